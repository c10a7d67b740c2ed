use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ponto_core::lbph::LbphParams;
use ponto_core::settings::{clamp_cooldown, clamp_stable, clamp_threshold, parse_setting};
use ponto_core::{
    dataset, CameraSession, CapturePolicy, CascadeDetector, DatasetStore, DetectionNotice,
    Recognizer, SessionRegistry, SourceKind, TrainError, TrainSummary,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "ponto", about = "Ponto face-recognition attendance engine")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the recognizer on the dataset and report what was loaded
    Train,
    /// Show enrolled identities and effective settings
    Status,
    /// Detect the face in each image and add it to an identity's folder
    Enroll {
        /// Identity key (folder name under the dataset root)
        #[arg(short, long)]
        identity: String,
        /// Reject images showing more than one face
        #[arg(long)]
        require_single: bool,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Classify the largest face in an image
    Predict { image: PathBuf },
    /// Feed a directory of frames through one camera session
    Replay {
        dir: PathBuf,
        /// Simulated time between consecutive frames
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
        /// Write annotated frames here
        #[arg(long)]
        out: Option<PathBuf>,
        /// Confirm every detection and add its face to the dataset
        #[arg(long)]
        confirm: bool,
    },
    /// Print the effective (clamped) tuning for the given values
    Tune {
        #[arg(long)]
        threshold: Option<String>,
        #[arg(long)]
        stable: Option<String>,
        #[arg(long)]
        cooldown: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Train => {
            let summary = match dataset::train(&config.dataset_dir, LbphParams::default()) {
                Ok(model) => model.summary(),
                Err(TrainError::EmptyDataset { root }) => {
                    tracing::warn!(root = %root.display(), "no usable images; recognizer stays untrained");
                    TrainSummary::empty()
                }
                Err(e) => return Err(e.into()),
            };
            print_json(&summary)?;
        }
        Commands::Status => {
            let store = DatasetStore::new(&config.dataset_dir);
            print_json(&StatusOutput {
                dataset_dir: &config.dataset_dir,
                cascade_path: &config.cascade_path,
                identities: store.summary()?,
                engine: &config.engine,
            })?;
        }
        Commands::Enroll {
            identity,
            require_single,
            images,
        } => {
            let recognizer = build_recognizer(&config)?;
            let policy = if require_single {
                CapturePolicy::RequireSingle
            } else {
                CapturePolicy::Largest
            };
            let results: Vec<EnrollOutput> = images
                .iter()
                .map(|path| enroll_one(&recognizer, &identity, path, policy))
                .collect();
            print_json(&results)?;
            if results.iter().all(|r| r.saved.is_none()) {
                bail!("no face enrolled for {identity}");
            }
        }
        Commands::Predict { image } => {
            let recognizer = build_recognizer(&config)?;
            train_or_warn(&recognizer);
            let frame = open_rgb(&image)?;
            print_json(&recognizer.debug_predict(&frame))?;
        }
        Commands::Replay {
            dir,
            interval_ms,
            out,
            confirm,
        } => {
            let recognizer = Arc::new(build_recognizer(&config)?);
            train_or_warn(&recognizer);
            replay(recognizer, &dir, Duration::from_millis(interval_ms), out.as_deref(), confirm)?;
        }
        Commands::Tune {
            threshold,
            stable,
            cooldown,
        } => {
            let mut engine = config.engine.clone();
            if let Some(raw) = threshold {
                engine.threshold = clamp_threshold(parse_setting("threshold", &raw)?)?;
            }
            if let Some(raw) = stable {
                engine.stable_seconds = clamp_stable(parse_setting("stable_seconds", &raw)?)?;
            }
            if let Some(raw) = cooldown {
                engine.cooldown_seconds = clamp_cooldown(parse_setting("cooldown_seconds", &raw)?)?;
            }
            print_json(&engine.tuning())?;
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct StatusOutput<'a> {
    dataset_dir: &'a Path,
    cascade_path: &'a Path,
    identities: Vec<ponto_core::IdentitySummary>,
    engine: &'a ponto_core::EngineSettings,
}

#[derive(Serialize)]
struct EnrollOutput {
    image: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    saved: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct ReplayEvent<'a> {
    frame: &'a Path,
    #[serde(flatten)]
    notice: &'a DetectionNotice,
    #[serde(skip_serializing_if = "Option::is_none")]
    confirmed: Option<PathBuf>,
}

fn build_recognizer(config: &Config) -> Result<Recognizer> {
    let detector = CascadeDetector::load(&config.cascade_path, config.engine.detector_params())
        .with_context(|| format!("loading cascade {}", config.cascade_path.display()))?;
    Ok(Recognizer::new(Arc::new(detector), &config.dataset_dir, &config.engine))
}

/// An empty dataset is a valid state: every face is reported unknown.
fn train_or_warn(recognizer: &Recognizer) {
    if let Err(e) = recognizer.train() {
        tracing::warn!(error = %e, "continuing without a trained model");
    }
}

fn open_rgb(path: &Path) -> Result<image::RgbImage> {
    let img = image::open(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(img.to_rgb8())
}

fn enroll_one(recognizer: &Recognizer, identity: &str, path: &Path, policy: CapturePolicy) -> EnrollOutput {
    let result = open_rgb(path).and_then(|frame| {
        let captured = recognizer.capture(&frame, policy)?;
        Ok(recognizer.dataset().save_enrollment(identity, &captured.face)?)
    });
    match result {
        Ok(saved) => EnrollOutput {
            image: path.to_path_buf(),
            saved: Some(saved),
            error: None,
        },
        Err(e) => {
            tracing::warn!(image = %path.display(), error = %e, "enrollment skipped");
            EnrollOutput {
                image: path.to_path_buf(),
                saved: None,
                error: Some(format!("{e:#}")),
            }
        }
    }
}

fn replay(
    recognizer: Arc<Recognizer>,
    dir: &Path,
    interval: Duration,
    out: Option<&Path>,
    confirm: bool,
) -> Result<()> {
    let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    frames.sort();
    if let Some(out) = out {
        std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;
    }

    let registry = SessionRegistry::new(Arc::clone(&recognizer));
    let session = registry.create_session(SourceKind::Device);
    let start = Instant::now();
    let mut detections = 0usize;

    for (i, path) in frames.iter().enumerate() {
        let frame = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(frame = %path.display(), error = %e, "skipping undecodable frame");
                continue;
            }
        };
        let now = frame_time(start, interval, i)?;
        let report = registry.submit_frame_at(&session.id(), frame, now)?;
        tracing::debug!(frame = %path.display(), faces = report.faces.len(), "frame replayed");

        if let Some(out) = out {
            save_annotated(&session, path, out)?;
        }
        if let Some(notice) = &report.detection {
            // Read the marker so the session can confirm again.
            session.pipeline().pop_last_detection();
            detections += 1;
            let confirmed = if confirm {
                confirm_detection(&recognizer, notice)?
            } else {
                None
            };
            println!(
                "{}",
                serde_json::to_string(&ReplayEvent {
                    frame: path,
                    notice,
                    confirmed,
                })?
            );
        }
    }

    tracing::info!(frames = frames.len(), detections, "replay finished");
    Ok(())
}

/// Synthetic capture time of the `index`-th replayed frame.
fn frame_time(start: Instant, interval: Duration, index: usize) -> Result<Instant> {
    u32::try_from(index)
        .ok()
        .and_then(|i| interval.checked_mul(i))
        .and_then(|offset| start.checked_add(offset))
        .with_context(|| format!("frame {index} is out of range for a {interval:?} interval"))
}

fn confirm_detection(recognizer: &Recognizer, notice: &DetectionNotice) -> Result<Option<PathBuf>> {
    let Some(entry) = recognizer.consume_pending(&notice.detection_id) else {
        tracing::warn!(detection_id = %notice.detection_id, "pending detection already gone");
        return Ok(None);
    };
    let path = recognizer
        .dataset()
        .save_confirmation(&entry.identity, &entry.face)?;
    Ok(Some(path))
}

fn save_annotated(session: &CameraSession, source: &Path, out: &Path) -> Result<()> {
    let Some(frame) = session.latest_frame() else {
        return Ok(());
    };
    let name = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "frame".to_string());
    let dest = out.join(format!("{name}.png"));
    frame
        .save(&dest)
        .with_context(|| format!("writing {}", dest.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
