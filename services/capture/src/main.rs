//! Bodyscan capture CLI
//!
//! Runs the client half of the scan pipeline from the command line: grade a
//! set of pose photos, hash them, or gate and upload a full scan to the ingest
//! API.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/capture.toml, /etc/bodyscan/capture.toml)
//! 2. Environment variables (prefixed with CAPTURE__)

use anyhow::{bail, Context};
use bodyscan_capture::api_client::{CompleteScanRequest, ScanApiClient};
use bodyscan_capture::config::{CaptureConfig, LoggingConfig};
use bodyscan_capture::gate::{PoseImage, QualityGate};
use bodyscan_capture::hash::{compute_image_hash, find_duplicate_photos};
use bodyscan_capture::upload::{
    ConnectivityMonitor, HttpStorageTransport, UploadEngine, UploadParams, UploadPolicy,
};
use bodyscan_common::Pose;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Photos closer than this many hash bits are treated as the same shot.
const DUPLICATE_HASH_DISTANCE: u32 = 4;

#[derive(Debug, Parser)]
#[command(name = "bodyscan-capture", version, about = "Grade and upload body scan photos")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the quality gate over four pose photos
    Gate(PosePhotoArgs),
    /// Print the perceptual hash of each photo
    Hash {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Gate, upload and submit a scan
    Upload(UploadArgs),
}

#[derive(Debug, Args)]
struct PosePhotoArgs {
    #[arg(long)]
    front: PathBuf,
    #[arg(long)]
    back: PathBuf,
    #[arg(long)]
    left: PathBuf,
    #[arg(long)]
    right: PathBuf,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[command(flatten)]
    photos: PosePhotoArgs,

    /// Caller identity sent as x-user-id
    #[arg(long)]
    uid: String,

    /// Scan identifier (generated when omitted)
    #[arg(long)]
    scan_id: Option<String>,

    #[arg(long)]
    current_weight_kg: Option<f64>,

    #[arg(long)]
    goal_weight_kg: Option<f64>,

    /// Upload even if the quality gate fails
    #[arg(long)]
    skip_gate: bool,
}

impl PosePhotoArgs {
    fn paths(&self) -> [(Pose, &PathBuf); 4] {
        [
            (Pose::Front, &self.front),
            (Pose::Back, &self.back),
            (Pose::Left, &self.left),
            (Pose::Right, &self.right),
        ]
    }

    async fn load(&self) -> anyhow::Result<Vec<PoseImage>> {
        let mut images = Vec::with_capacity(4);
        for (pose, path) in self.paths() {
            let blob = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {} photo {}", pose, path.display()))?;
            let image = PoseImage::new(pose, blob)
                .with_context(|| format!("Failed to decode {} photo {}", pose, path.display()))?;
            images.push(image);
        }
        Ok(images)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = CaptureConfig::load().context("Failed to load configuration")?;
    init_logging(&config.logging)?;
    config.validate()?;

    let result = match cli.command {
        Command::Gate(args) => run_gate(&config, &args).await,
        Command::Hash { files } => run_hash(&files).await,
        Command::Upload(args) => run_upload(&config, args).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("bodyscan_capture={}", level).parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);
    let location = config.include_location;

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json().with_file(location).with_line_number(location))
            .init();
    } else {
        subscriber
            .with(fmt::layer().pretty().with_file(location).with_line_number(location))
            .init();
    }

    Ok(())
}

async fn run_gate(config: &CaptureConfig, args: &PosePhotoArgs) -> anyhow::Result<()> {
    let images = args.load().await?;
    let result = QualityGate::new(config.gate.clone()).evaluate(&images)?;

    info!(pass = result.pass, score = result.score, "Quality gate evaluated");
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_hash(files: &[PathBuf]) -> anyhow::Result<()> {
    for path in files {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let hash = compute_image_hash(&bytes)
            .with_context(|| format!("Failed to hash {}", path.display()))?;
        println!("{}  {}", hash, path.display());
    }
    Ok(())
}

async fn run_upload(config: &CaptureConfig, args: UploadArgs) -> anyhow::Result<()> {
    let images = args.photos.load().await?;

    let gate = QualityGate::new(config.gate.clone()).evaluate(&images)?;
    if !gate.pass {
        if args.skip_gate {
            warn!(score = gate.score, reasons = ?gate.reasons, "Quality gate failed, uploading anyway");
        } else {
            for reason in &gate.reasons {
                eprintln!("- {}", reason);
            }
            bail!("Quality gate failed with score {:.2}", gate.score);
        }
    }

    let duplicates = find_duplicate_photos(&images, DUPLICATE_HASH_DISTANCE)?;
    if let Some((a, b)) = duplicates.first() {
        bail!("The {} and {} photos look identical; retake one of them", a, b);
    }

    let scan_id = args
        .scan_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let correlation_id = uuid::Uuid::new_v4().to_string();
    info!(scan_id = %scan_id, correlation_id = %correlation_id, "Uploading scan");

    let api = Arc::new(ScanApiClient::new(&config.api)?);
    let transport = Arc::new(HttpStorageTransport::new(api.clone(), config.api.chunk_size_bytes));
    let engine = UploadEngine::new(
        transport,
        ConnectivityMonitor::new(),
        UploadPolicy::from(&config.upload),
    );

    let signal = CancellationToken::new();
    tokio::spawn({
        let signal = signal.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Received interrupt, cancelling uploads");
                signal.cancel();
            }
        }
    });

    let uploads = images
        .into_iter()
        .map(|image| {
            UploadParams::new(args.uid.clone(), scan_id.clone(), image.pose, image.blob)
                .with_download_url(config.upload.include_download_url)
                .with_signal(signal.clone())
        })
        .collect();

    let mut failed = false;
    for (result, pose) in engine.upload_all(uploads).await.into_iter().zip(Pose::ALL) {
        match result {
            Ok(photo) => info!(pose = %pose, path = %photo.path, size = photo.size, "Uploaded"),
            Err(e) => {
                error!(pose = %pose, code = e.code(), error = %e, "Upload failed");
                failed = true;
            }
        }
    }
    if failed {
        bail!("One or more photos failed to upload");
    }

    let receipt = api
        .complete_scan(
            &args.uid,
            &scan_id,
            &correlation_id,
            &CompleteScanRequest {
                current_weight_kg: args.current_weight_kg,
                goal_weight_kg: args.goal_weight_kg,
            },
        )
        .await
        .context("Failed to submit scan")?;

    info!(scan_id = %receipt.scan_id, status = %receipt.status, debug_id = %receipt.debug_id, "Scan submitted");
    println!("{}", serde_json::to_string_pretty(&receipt.photo_paths)?);
    Ok(())
}
