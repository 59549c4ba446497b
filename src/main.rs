use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use canopy_meanshift::codec::write_stream;
use canopy_meanshift::{
    generate_clustered_points, points_from_matrix, CanopyConfig, CanopyError, ClusteringDriver,
    ClusteringRun, DataLoader, MeasureKind, Result as CanopyResult,
};

#[derive(Parser, Debug)]
#[command(name = "canopy-meanshift")]
#[command(about = "Canopy mean-shift clustering over parallel map/reduce passes", long_about = None)]
struct Args {
    /// Input dataset; synthetic clustered data is generated when omitted
    #[arg(long)]
    input: Option<PathBuf>,

    /// Input format (default: inferred from the file extension)
    #[arg(long, value_enum)]
    format: Option<InputFormat>,

    /// Directory receiving the canopy snapshot, point labels and summary
    #[arg(short, long, default_value = "canopy-output")]
    output: PathBuf,

    /// Replace the output directory if it already exists
    #[arg(long, default_value_t = false)]
    overwrite: bool,

    /// JSON run configuration; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Outer (fold) radius
    #[arg(long)]
    t1: Option<f64>,

    /// Inner (cover/merge) radius
    #[arg(long)]
    t2: Option<f64>,

    /// Largest centroid shift still counted as converged
    #[arg(long)]
    convergence_delta: Option<f64>,

    /// Refinement pass cap
    #[arg(short = 'i', long)]
    max_iterations: Option<usize>,

    /// Distance measure
    #[arg(long, value_parser = parse_measure)]
    measure: Option<MeasureKind>,

    /// The input is a stream of canopy records from an earlier run
    #[arg(long, default_value_t = false)]
    input_is_canopies: bool,

    /// Label points with their nearest canopy once iteration stops
    #[arg(long)]
    clustering: Option<bool>,

    /// Number of synthetic clusters
    #[arg(long, default_value_t = 4)]
    clusters: usize,

    /// Synthetic points per cluster
    #[arg(short = 'n', long, default_value_t = 250)]
    points_per_cluster: usize,

    /// Dimensionality of synthetic points
    #[arg(short, long, default_value_t = 2)]
    dim: usize,

    /// Standard deviation of synthetic points around their centre
    #[arg(long, default_value_t = 1.0)]
    spread: f64,

    /// RNG seed for synthetic data
    #[arg(long, default_value_t = 42u64)]
    seed: u64,

    /// Override Rayon global thread pool size
    #[arg(long)]
    threads: Option<usize>,

    /// Verbosity: set RUST_LOG style level (info, debug, warn)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum InputFormat {
    Csv,
    Parquet,
    Text,
    Records,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = init_logging(&args.log_level) {
        eprintln!("failed to initialise logging: {err}");
    }

    if let Err(err) = run(args) {
        error!(error = %err, "canopy run failed");
        process::exit(1);
    }
}

fn init_logging(level: &str) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(match level {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|err| err.to_string())
}

fn run(args: Args) -> CanopyResult<()> {
    if let Some(threads) = args.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|err| {
                CanopyError::InvalidConfiguration(format!(
                    "failed to configure rayon threadpool: {err}"
                ))
            })?;
        info!(threads, "configured rayon global thread pool");
    }

    let config = build_config(&args)?;
    prepare_output(&args.output, args.overwrite)?;
    let driver = ClusteringDriver::new(config)?;

    let start = Instant::now();
    let (run, source_points) = match resolve_format(&args)? {
        Some(InputFormat::Records) => {
            let path = input_path(&args)?;
            let records = DataLoader::load_records(path)?;
            info!(path = ?path, records = records.len(), "loaded record stream");
            (driver.run_records(&records)?, records.len())
        }
        format => {
            if driver.config().input_already_canopies {
                return Err(CanopyError::InvalidConfiguration(
                    "--input-is-canopies requires a record stream input".into(),
                ));
            }
            let points = points_from_matrix(&load_matrix(&args, format)?);
            let count = points.len();
            (driver.run_points(points)?, count)
        }
    };
    let elapsed = start.elapsed();
    info!(
        canopies = run.canopies.len(),
        iterations = run.iterations,
        termination = ?run.termination,
        took_seconds = elapsed.as_secs_f64(),
        "canopy mean-shift finished"
    );

    let snapshot_path = args.output.join(format!("clusters-{}.bin", run.iterations));
    write_stream(&snapshot_path, &run.snapshot)?;
    info!(path = ?snapshot_path, "wrote canopy snapshot");

    if run.assignment.is_some() {
        write_assignments(&args.output.join("clustered-points.csv"), &run)?;
    }
    write_summary(
        &args,
        driver.config(),
        &run,
        source_points,
        elapsed.as_secs_f64(),
    )?;
    Ok(())
}

fn build_config(args: &Args) -> CanopyResult<CanopyConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => {
            info!(path = ?path, "loading run configuration");
            CanopyConfig::from_json_file(path)?
        }
        None => CanopyConfig::default(),
    };
    if let Some(t1) = args.t1 {
        config.t1 = t1;
    }
    if let Some(t2) = args.t2 {
        config.t2 = t2;
    }
    if let Some(delta) = args.convergence_delta {
        config.convergence_delta = delta;
    }
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    if let Some(measure) = args.measure {
        config.measure = measure;
    }
    if let Some(clustering) = args.clustering {
        config.run_clustering = clustering;
    }
    config.input_already_canopies |= args.input_is_canopies;
    Ok(config)
}

fn prepare_output(dir: &Path, overwrite: bool) -> CanopyResult<()> {
    if dir.exists() {
        if !overwrite {
            return Err(CanopyError::InvalidConfiguration(format!(
                "output directory {} exists; pass --overwrite to replace it",
                dir.display()
            )));
        }
        std::fs::remove_dir_all(dir)?;
        info!(path = ?dir, "removed existing output directory");
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

fn input_path(args: &Args) -> CanopyResult<&Path> {
    args.input.as_deref().ok_or_else(|| {
        CanopyError::InvalidConfiguration("--format records requires --input".into())
    })
}

fn resolve_format(args: &Args) -> CanopyResult<Option<InputFormat>> {
    match (args.input.as_deref(), args.format) {
        (Some(_), Some(format)) => Ok(Some(format)),
        (Some(path), None) => Ok(Some(infer_format(path).unwrap_or(InputFormat::Csv))),
        (None, Some(InputFormat::Records)) => Err(CanopyError::InvalidConfiguration(
            "--format records requires --input".into(),
        )),
        (None, requested) => {
            if let Some(requested) = requested {
                info!(
                    ?requested,
                    "ignoring --format because synthetic data will be generated"
                );
            }
            Ok(None)
        }
    }
}

fn load_matrix(args: &Args, format: Option<InputFormat>) -> CanopyResult<Array2<f64>> {
    match (args.input.as_deref(), format) {
        (Some(path), Some(format)) => {
            info!(path = ?path, ?format, "loading input data");
            match format {
                InputFormat::Csv => DataLoader::load_csv(path),
                InputFormat::Parquet => DataLoader::load_parquet(path),
                InputFormat::Text => DataLoader::load_text(path),
                InputFormat::Records => Err(CanopyError::InvalidConfiguration(
                    "record streams are not dense matrices".into(),
                )),
            }
        }
        _ => {
            let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
            let centres = Array2::random_using(
                (args.clusters, args.dim),
                Uniform::new(0.0, 100.0),
                &mut rng,
            );
            info!(
                clusters = args.clusters,
                points_per_cluster = args.points_per_cluster,
                dim = args.dim,
                spread = args.spread,
                "generating synthetic clustered data"
            );
            generate_clustered_points(args.points_per_cluster, &centres, args.spread, &mut rng)
        }
    }
}

fn infer_format(path: &Path) -> Option<InputFormat> {
    path.extension().and_then(|ext| ext.to_str()).map(|ext| {
        match ext.to_ascii_lowercase().as_str() {
            "parquet" | "pq" => InputFormat::Parquet,
            "txt" | "data" => InputFormat::Text,
            "bin" | "seq" => InputFormat::Records,
            _ => InputFormat::Csv,
        }
    })
}

fn write_summary(
    args: &Args,
    config: &CanopyConfig,
    run: &ClusteringRun,
    source_points: usize,
    elapsed_secs: f64,
) -> CanopyResult<()> {
    let canopies: Vec<_> = run
        .canopies
        .iter()
        .map(|canopy| {
            json!({
                "id": canopy.id(),
                "point_count": canopy.point_count(),
                "members": canopy.members().len(),
                "centroid": canopy.centroid().iter().collect::<Vec<_>>(),
            })
        })
        .collect();

    let dump = json!({
        "inputs": source_points,
        "canopies": run.canopies.len(),
        "iterations": run.iterations,
        "termination": format!("{:?}", run.termination).to_lowercase(),
        "cluster_sizes": run.assignment.as_ref().map(|labels| labels.sizes()),
        "elapsed_seconds": elapsed_secs,
        "config": config,
        "data_source": match args.input.as_ref() {
            Some(path) => json!({
                "type": "file",
                "path": path.display().to_string(),
            }),
            None => json!({
                "type": "synthetic",
                "clusters": args.clusters,
                "points_per_cluster": args.points_per_cluster,
                "dim": args.dim,
                "spread": args.spread,
                "seed": args.seed,
            }),
        },
        "centroids": canopies,
    });

    let path = args.output.join("summary.json");
    std::fs::write(&path, serde_json::to_string_pretty(&dump)?)?;
    info!(path = ?path, "wrote clustering summary");
    Ok(())
}

fn write_assignments(path: &Path, run: &ClusteringRun) -> CanopyResult<()> {
    let Some(labels) = run.assignment.as_ref() else {
        return Ok(());
    };
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["point", "canopy"])?;
    for (point, canopy) in labels.iter() {
        writer.write_record([point.to_string(), canopy.to_string()])?;
    }
    writer.flush()?;
    info!(path = ?path, points = labels.len(), "wrote point assignments");
    Ok(())
}

fn parse_measure(raw: &str) -> Result<MeasureKind, String> {
    MeasureKind::from_str(raw).map_err(|err| err.to_string())
}
