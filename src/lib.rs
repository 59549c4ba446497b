//! Canopy-approximated mean-shift clustering, run as a sequence of parallel
//! map/reduce passes.
//!
//! The pipeline seeds canopies from raw points, repeatedly shifts every canopy
//! towards the weighted mean of the canopies within its outer radius until no
//! centroid moves more than the convergence delta (or the iteration cap is
//! hit), and finally labels each point with its nearest canopy. Intermediate
//! canopy sets are persisted between passes through a compact big-endian wire
//! format shared with the input record stream.

pub mod canopy;
pub mod codec;
pub mod config;
pub mod data;
pub mod distance;
pub mod driver;
pub mod pass;
pub mod substrate;
pub mod vector;

use thiserror::Error;

pub use canopy::{merge_covered, Canopy, CanopyId, CentroidAccumulator, Fold, PointId};
pub use codec::{decode, decode_canopy, encode, encode_canopy, Record, WireVector};
pub use config::CanopyConfig;
pub use data::{generate_clustered_points, points_from_matrix, DataLoader, DataMatrix};
pub use distance::{
    checked_distance, Chebyshev, Cosine, DistanceMeasure, Euclidean, Manhattan, MeasureKind,
    SquaredEuclidean, Tanimoto,
};
pub use driver::{ClusteringDriver, ClusteringRun, DriverState, Termination};
pub use pass::{CanopyPass, ClusterAssignment, PassInput, PassOutput, Point};
pub use substrate::{LocalSubstrate, PassError, Substrate};
pub use vector::SparseVector;

/// Error type used by operations in this crate.
#[derive(Debug, Error)]
pub enum CanopyError {
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("pass failed at iteration {iteration} after {attempts} attempt(s): {reason}")]
    PassFailure {
        iteration: usize,
        attempts: usize,
        reason: String,
    },
    #[error("distance measure '{measure}' fault: {detail}")]
    DistanceMeasureFault { measure: String, detail: String },
    #[error("run aborted at iteration {iteration}: {source}")]
    Aborted {
        iteration: usize,
        #[source]
        source: Box<CanopyError>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl CanopyError {
    /// Whether a task raising this error must abort the run instead of being
    /// skipped as a single bad record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CanopyError::DistanceMeasureFault { .. }
                | CanopyError::InvalidConfiguration(_)
                | CanopyError::Aborted { .. }
        )
    }
}

/// Convenient alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, CanopyError>;
