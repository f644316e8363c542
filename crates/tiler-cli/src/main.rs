//! tiler-cli - Command-line interface for the HistoFlow tiler
//!
//! Submits tiling jobs, seeds slides into the object store and inspects the
//! published metadata records.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use thiserror::Error;
use tiler_core::metadata::metadata_key;
use tiler_core::{
    DeepZoomEncoder, JobMetadataRecord, JobScheduler, JobState, OrchestratorSettings,
    ServiceConfig, SubmitError, TilingJob, TilingOrchestrator,
};
use tiler_store::{BucketStore, ObjectStoreClient, StoreBackend, StoreError};
use tracing::{error, info, warn};

mod logging;
mod output;

/// tiler - Deep Zoom tiling for whole-slide images
///
/// Downloads slides from an object store, cuts them into a Deep Zoom pyramid
/// and publishes the tiles and a metadata record back to the store.
#[derive(Parser)]
#[command(name = "tiler")]
#[command(author, version, about = "Deep Zoom tiling for whole-slide images", long_about = None)]
struct Cli {
    /// Enable verbose output for debugging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true, env = "TILER_CONFIG")]
    config: Option<PathBuf>,

    /// Use a local directory tree as the object store, one sub-directory per bucket
    #[arg(long, global = true, env = "TILER_STORE_ROOT")]
    store_root: Option<PathBuf>,

    /// Bucket receiving tile sets
    #[arg(long, global = true, env = "TILER_UPLOAD_BUCKET")]
    upload_bucket: Option<String>,

    /// Parent directory of per-job working areas
    #[arg(long, global = true, env = "TILER_TEMP_STORAGE_PATH")]
    temp_dir: Option<PathBuf>,

    /// MinIO endpoint, e.g. localhost:9000
    #[arg(long, global = true, env = "MINIO_ENDPOINT")]
    minio_endpoint: Option<String>,

    /// MinIO access key
    #[arg(
        long,
        global = true,
        env = "MINIO_ACCESS_KEY",
        default_value = "minioadmin",
        hide_env_values = true
    )]
    minio_access_key: String,

    /// MinIO secret key
    #[arg(
        long,
        global = true,
        env = "MINIO_SECRET_KEY",
        default_value = "minioadmin",
        hide_env_values = true
    )]
    minio_secret_key: String,

    /// Connect to MinIO over HTTPS
    #[arg(long, global = true, env = "MINIO_SECURE")]
    minio_secure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tile one slide and wait for the job to finish
    Tile {
        /// Tile-set prefix in the upload bucket
        #[arg(long)]
        image_id: String,

        /// Bucket holding the slide
        #[arg(long)]
        source_bucket: String,

        /// Key of the slide inside the source bucket
        #[arg(long)]
        source_object: String,

        /// Label copied into the metadata record
        #[arg(long)]
        dataset_name: Option<String>,

        /// Output the final status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Tile every job of a JSON-lines file ("-" reads stdin)
    Batch {
        /// File with one job object per line
        file: PathBuf,

        /// Output the final statuses as JSON
        #[arg(long)]
        json: bool,
    },

    /// Upload a local slide so it can be tiled
    UploadSlide {
        /// Slide to upload
        #[arg(long)]
        file: PathBuf,

        /// Image id the slide belongs to
        #[arg(long)]
        image_id: String,

        /// Destination bucket, created when missing
        #[arg(long, default_value = "histoflow-unprocessed")]
        bucket: String,

        /// Key prefix placed before the image id
        #[arg(long, default_value = "unprocessed")]
        prefix: String,

        /// Full object key, overriding prefix/image id/file name
        #[arg(long)]
        object_name: Option<String>,
    },

    /// Show the metadata record of a tiled image
    Inspect {
        /// Image id to look up
        #[arg(long)]
        image_id: String,

        /// Bucket holding the tile set (defaults to the upload bucket)
        #[arg(long)]
        bucket: Option<String>,

        /// Output the raw record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show or create the configuration
    Config {
        /// Show the effective configuration (default)
        #[arg(long, conflicts_with_all = ["path", "init"])]
        show: bool,

        /// Show configuration file path
        #[arg(long, conflicts_with_all = ["show", "init"])]
        path: bool,

        /// Write a commented default configuration file if none exists
        #[arg(long, conflicts_with_all = ["show", "path"])]
        init: bool,
    },
}

/// Some submitted jobs did not complete
#[derive(Error, Debug)]
#[error("{failed} of {total} tiling jobs failed")]
struct JobsFailed {
    failed: usize,
    total: usize,
}

fn main() {
    let result = run();

    match result {
        Ok(_) => process::exit(0),
        Err(e) => {
            error!("Error: {:#}", e);

            let exit_code = map_error_to_exit_code(&e);
            process::exit(exit_code);
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    logging::setup_logging(cli.verbose, cli.quiet);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(execute(cli))
}

async fn execute(cli: Cli) -> Result<()> {
    // These two must work before a config file exists.
    if let Commands::Config { path, init, .. } = &cli.command {
        if *path {
            let location = match &cli.config {
                Some(path) => path.clone(),
                None => ServiceConfig::config_path()?,
            };
            println!("{}", location.display());
            return Ok(());
        }
        if *init {
            let location = init_config(cli.config.as_deref())?;
            println!("Configuration file: {}", location.display());
            return Ok(());
        }
    }

    let config = effective_config(&cli)?;

    match cli.command {
        Commands::Tile {
            image_id,
            source_bucket,
            source_object,
            dataset_name,
            json,
        } => {
            let mut job = TilingJob::new(image_id, source_bucket, source_object);
            if let Some(dataset_name) = dataset_name {
                job = job.with_dataset(dataset_name);
            }
            run_jobs(&config, vec![job], json).await?;
        }

        Commands::Batch { file, json } => {
            let jobs = read_jobs(&file)?;
            if jobs.is_empty() {
                warn!("No jobs found in {}", file.display());
                return Ok(());
            }
            run_jobs(&config, jobs, json).await?;
        }

        Commands::UploadSlide {
            file,
            image_id,
            bucket,
            prefix,
            object_name,
        } => {
            if !file.is_file() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("File not found: {}", file.display()),
                )
                .into());
            }
            let file_name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .context("Slide path has no file name")?;
            let key = build_object_name(&prefix, &image_id, &file_name, object_name.as_deref());

            let store = build_store(&config)?;
            if !store.bucket_exists(&bucket).await? {
                info!("Creating bucket '{}'", bucket);
                store.create_bucket(&bucket).await?;
            }
            let written = store.upload_file(&bucket, &key, &file).await?;
            info!("Uploaded {} bytes", written);

            println!("Upload complete");
            println!("  Bucket: {}", bucket);
            println!("  Object: {}", key);
        }

        Commands::Inspect {
            image_id,
            bucket,
            json,
        } => {
            let bucket = bucket.unwrap_or_else(|| config.upload.bucket.clone());
            let key = metadata_key(&image_id);
            let store = build_store(&config)?;

            let body = store
                .read_object(&bucket, &key)
                .await
                .with_context(|| format!("Failed to read {}/{}", bucket, key))?;
            let record = JobMetadataRecord::from_json(&body)
                .with_context(|| format!("{}/{} is not a metadata record", bucket, key))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                output::print_metadata(&record);
            }
        }

        Commands::Config { .. } => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
    }

    Ok(())
}

/// Submit `jobs`, wait for them all and report
async fn run_jobs(config: &ServiceConfig, jobs: Vec<TilingJob>, json: bool) -> Result<()> {
    let store = build_store(config)?;
    let orchestrator = TilingOrchestrator::new(
        store,
        Arc::new(DeepZoomEncoder::new()),
        OrchestratorSettings::from_config(config),
    );

    let mut scheduler_config = config.scheduler;
    scheduler_config.queue_capacity = scheduler_config.queue_capacity.max(jobs.len());
    let scheduler = JobScheduler::start(orchestrator, scheduler_config);

    let total = jobs.len();
    for job in jobs {
        let image_id = job.image_id.clone();
        match scheduler.submit(job) {
            Ok(ack) => info!("{} ({})", ack.message, image_id),
            Err(err) => {
                scheduler.drain().await;
                return Err(err).with_context(|| format!("Job {} was not accepted", image_id));
            }
        }
    }

    scheduler.drain().await;

    let statuses = scheduler.statuses();
    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        output::print_status_table(&statuses);
    }

    let failed = statuses
        .iter()
        .filter(|status| status.state != JobState::Completed)
        .count();
    if failed > 0 {
        return Err(JobsFailed { failed, total }.into());
    }
    Ok(())
}

/// Parse a JSON-lines job file; blank lines and `#` comments are skipped
fn read_jobs(file: &Path) -> Result<Vec<TilingJob>> {
    let reader: Box<dyn BufRead> = if file.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let handle = std::fs::File::open(file)
            .with_context(|| format!("Failed to open {}", file.display()))?;
        Box::new(BufReader::new(handle))
    };

    let mut jobs = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let job: TilingJob = serde_json::from_str(line)
            .with_context(|| format!("Invalid job on line {}", index + 1))?;
        jobs.push(job);
    }
    Ok(jobs)
}

/// Load the configuration file and apply command-line overrides
fn effective_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => {
            let path = ServiceConfig::config_path()?;
            if path.exists() {
                ServiceConfig::load_from(&path)?
            } else {
                ServiceConfig::default()
            }
        }
    };

    if let Some(root) = &cli.store_root {
        config.storage.backend = StoreBackend::Local { root: root.clone() };
    } else if let Some(endpoint) = &cli.minio_endpoint {
        config.storage.backend = StoreBackend::minio(
            endpoint,
            &cli.minio_access_key,
            &cli.minio_secret_key,
            cli.minio_secure,
        );
    }
    if let Some(bucket) = &cli.upload_bucket {
        config.upload.bucket = bucket.clone();
    }
    if let Some(temp_dir) = &cli.temp_dir {
        config.tiling.temp_storage_path = temp_dir.clone();
    }

    config.validate()?;
    Ok(config)
}

fn build_store(config: &ServiceConfig) -> Result<Arc<dyn ObjectStoreClient>> {
    let store = BucketStore::new(
        config.storage.backend.clone(),
        config.storage.tuning.clone(),
    )?;
    Ok(Arc::new(store))
}

/// Write the commented default configuration unless a file already exists
fn init_config(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => {
            if !path.exists() {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, ServiceConfig::default_config_content())?;
            }
            Ok(path.to_path_buf())
        }
        None => {
            ServiceConfig::load()?;
            Ok(ServiceConfig::config_path()?)
        }
    }
}

/// `{prefix}/{image_id}/{file_name}` unless an explicit key is given
fn build_object_name(
    prefix: &str,
    image_id: &str,
    file_name: &str,
    object_name: Option<&str>,
) -> String {
    if let Some(name) = object_name.filter(|name| !name.is_empty()) {
        return name.to_string();
    }
    [prefix.trim_matches('/'), image_id.trim_matches('/'), file_name]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Map errors to exit codes:
/// - 0: Success
/// - 1: General error
/// - 2: IO or object store error
/// - 3: Invalid input
/// - 4: Tiling job failure
fn map_error_to_exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<JobsFailed>().is_some() {
        return 4;
    }
    if let Some(submit_err) = err.downcast_ref::<SubmitError>() {
        return match submit_err {
            SubmitError::Invalid(_) => 3,
            SubmitError::QueueFull { .. } | SubmitError::Closed => 1,
        };
    }
    if let Some(core_err) = err.downcast_ref::<tiler_core::Error>() {
        return match core_err {
            tiler_core::Error::Io(_) => 2,
            tiler_core::Error::StoreUnavailable(_) => 2,
            tiler_core::Error::SourceNotFound { .. } => 2,
            tiler_core::Error::InvalidJob(_) => 3,
            tiler_core::Error::Config(_) => 3,
            tiler_core::Error::Encoding(_) => 4,
            tiler_core::Error::Upload { .. } => 4,
            tiler_core::Error::MetadataWrite(_) => 4,
            tiler_core::Error::Cancelled { .. } => 4,
            tiler_core::Error::Task(_) => 1,
        };
    }
    if err.downcast_ref::<StoreError>().is_some() || err.downcast_ref::<io::Error>().is_some() {
        2
    } else if err.downcast_ref::<serde_json::Error>().is_some() {
        3
    } else {
        1
    }
}
