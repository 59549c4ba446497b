//! Input loading and synthetic data generation.

use csv::ReaderBuilder;
use ndarray::{Array2, ArrayView1, ArrayViewMut1};
use ndarray_rand::rand_distr::{Distribution, Normal};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::fs::File;
use std::path::Path;

use crate::codec;
use crate::pass::Point;
use crate::vector::SparseVector;
use crate::{CanopyError, Result};

/// Dense data representation (rows = samples, columns = features).
pub type DataMatrix = Array2<f64>;

/// Turn dense rows into points numbered by row; zero entries are not stored.
pub fn points_from_matrix(data: &DataMatrix) -> Vec<Point> {
    data.outer_iter()
        .enumerate()
        .map(|(row, values)| {
            let vector: SparseVector = values
                .iter()
                .enumerate()
                .filter(|&(_, &value)| value != 0.0)
                .map(|(index, &value)| (index as u32, value))
                .collect();
            Point::new(row as u64, vector)
        })
        .collect()
}

/// Sample `n_per_cluster` points around every row of `centres` with Gaussian
/// noise of standard deviation `spread`.
pub fn generate_clustered_points(
    n_per_cluster: usize,
    centres: &DataMatrix,
    spread: f64,
    rng: &mut ChaCha8Rng,
) -> Result<DataMatrix> {
    if !spread.is_finite() || spread < 0.0 {
        return Err(CanopyError::InvalidData(format!(
            "spread must be a non-negative finite number (got {spread})"
        )));
    }
    let normal = Normal::new(0.0, spread)
        .map_err(|err| CanopyError::InvalidData(format!("invalid spread {spread}: {err}")))?;
    let mut points = Array2::zeros((n_per_cluster * centres.nrows(), centres.ncols()));
    for (cluster, centre) in centres.outer_iter().enumerate() {
        for sample in 0..n_per_cluster {
            let row = points.row_mut(cluster * n_per_cluster + sample);
            jitter(&centre, row, &normal, rng);
        }
    }
    Ok(points)
}

fn jitter<R: Rng + ?Sized>(
    centre: &ArrayView1<f64>,
    mut row: ArrayViewMut1<'_, f64>,
    normal: &Normal<f64>,
    rng: &mut R,
) {
    for (value, &c) in row.iter_mut().zip(centre.iter()) {
        *value = c + normal.sample(rng);
    }
}

fn rows_to_matrix(rows: Vec<Vec<f64>>) -> Result<DataMatrix> {
    let Some(width) = rows.first().map(Vec::len) else {
        return Ok(Array2::zeros((0, 0)));
    };
    let mut data = Array2::zeros((rows.len(), width));
    for (i, row) in rows.into_iter().enumerate() {
        if row.len() != width {
            return Err(CanopyError::InvalidData(format!(
                "row {i} width mismatch: expected {width}, found {}",
                row.len()
            )));
        }
        for (j, value) in row.into_iter().enumerate() {
            if !value.is_finite() {
                return Err(CanopyError::InvalidData(format!(
                    "row {i} column {j} is not finite ({value})"
                )));
            }
            data[(i, j)] = value;
        }
    }
    Ok(data)
}

/// Loaders for the supported input formats.
pub struct DataLoader;

impl DataLoader {
    /// CSV with a header row and numeric columns.
    pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<DataMatrix> {
        let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row = record
                .iter()
                .map(|field| field.trim().parse::<f64>())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.push(row);
        }
        rows_to_matrix(rows)
    }

    /// Whitespace-separated numbers, one sample per line. Blank lines are skipped.
    pub fn load_text<P: AsRef<Path>>(path: P) -> Result<DataMatrix> {
        let raw = std::fs::read_to_string(path)?;
        let mut rows = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            let row = line
                .split_whitespace()
                .map(str::parse::<f64>)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.push(row);
        }
        rows_to_matrix(rows)
    }

    /// Parquet file whose columns are all numeric.
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<DataMatrix> {
        let reader = SerializedFileReader::new(File::open(path)?)?;
        let rows = reader
            .get_row_iter(None)?
            .collect::<std::result::Result<Vec<Row>, _>>()?;
        let mut matrix = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = row
                .get_column_iter()
                .enumerate()
                .map(|(column, (_, field))| numeric_field(column, field))
                .collect::<Result<Vec<_>>>()?;
            matrix.push(values);
        }
        rows_to_matrix(matrix)
    }

    /// Length-prefixed stream of wire records, returned undecoded.
    pub fn load_records<P: AsRef<Path>>(path: P) -> Result<Vec<bytes::Bytes>> {
        codec::read_stream(path)
    }
}

fn numeric_field(column: usize, field: &Field) -> Result<f64> {
    let value = match field {
        Field::Double(v) => *v,
        Field::Float(v) => f64::from(*v),
        Field::Int(v) => f64::from(*v),
        Field::Long(v) => *v as f64,
        Field::Short(v) => f64::from(*v),
        Field::Byte(v) => f64::from(*v),
        Field::UInt(v) => f64::from(*v),
        Field::ULong(v) => *v as f64,
        Field::UShort(v) => f64::from(*v),
        Field::UByte(v) => f64::from(*v),
        Field::Null => {
            return Err(CanopyError::InvalidData(format!(
                "column {column} contains NULL"
            )))
        }
        other => {
            return Err(CanopyError::InvalidData(format!(
                "unsupported parquet field in column {column}: {other:?}"
            )))
        }
    };
    Ok(value)
}
