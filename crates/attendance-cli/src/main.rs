use anyhow::{Context, Result};
use attendance_core::session::load_model;
use attendance_core::{
    train_model, AttendanceSession, CaptureError, Config, FailureKind, LbphRecognizer, LiveFrame,
    PreviewFrames, RegistrationCapture, RosterStore, SampleStore, ScrfdDetector, SessionError,
    StoreError, TrainError,
};
use attendance_hw::V4lDevice;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "attendance", about = "Face recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered students
    Students,
    /// Show the attendance ledger for a day
    Today {
        /// Day to show (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Register a student and capture face samples from the camera
    Register {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// Samples to capture (default from config)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Train the recognizer from all captured samples
    Train,
    /// Recognize faces from the camera and mark attendance
    Attend {
        /// Stop after this many frames (default: until Ctrl-C)
        #[arg(long)]
        max_frames: Option<usize>,
        /// Print the roster without writing the ledger
        #[arg(long)]
        no_commit: bool,
        /// Write the last annotated frame to this image file
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Show face boxes from the camera without saving anything
    Preview {
        /// Frames to read before writing the snapshot
        #[arg(long, default_value_t = 10)]
        frames: usize,
        /// Image file for the last annotated frame
        #[arg(long)]
        output: PathBuf,
    },
    /// Delete every student, sample, model and ledger
    ClearAll {
        #[arg(long)]
        password: String,
    },
}

/// Classify an error chain for the process exit code.
fn failure_kind(err: &anyhow::Error) -> Option<FailureKind> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            e.kind()
        } else if let Some(e) = cause.downcast_ref::<TrainError>() {
            e.kind()
        } else if let Some(e) = cause.downcast_ref::<SessionError>() {
            e.kind()
        } else if let Some(e) = cause.downcast_ref::<CaptureError>() {
            e.kind()
        } else {
            None
        }
    })
}

fn open_store(config: &Config) -> Result<RosterStore> {
    RosterStore::open(config.layout())
        .with_context(|| format!("opening data directory {}", config.data_dir.display()))
}

fn load_detector(config: &Config) -> Result<ScrfdDetector> {
    let path = config.scrfd_model_path();
    ScrfdDetector::load(&path).with_context(|| format!("loading detector from {}", path.display()))
}

fn camera(config: &Config) -> V4lDevice {
    V4lDevice::new(config.camera_device.clone(), config.warmup_frames)
}

fn save_snapshot(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("writing snapshot {}", path.display()))?;
    println!("Snapshot written to {}", path.display());
    Ok(())
}

/// Pull frames until the stream ends, `stop` is set or `max_frames` is reached.
///
/// A failed frame ends the loop; it is returned with the last good image.
fn drain_frames<I>(
    frames: I,
    max_frames: Option<usize>,
    stop: &AtomicBool,
) -> (Option<RgbImage>, Option<SessionError>)
where
    I: Iterator<Item = Result<LiveFrame, SessionError>>,
{
    let mut last = None;
    for (n, frame) in frames.enumerate() {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(frame = n, error = %e, "recognition stopped");
                return (last, Some(e));
            }
        };
        for hit in &frame.recognized {
            tracing::debug!(frame = n, student_id = %hit.student_id, "hit");
        }
        last = Some(frame.image);
        if stop.load(Ordering::Relaxed) || max_frames.is_some_and(|max| n + 1 >= max) {
            break;
        }
    }
    (last, None)
}

/// Print and commit the roster, then report whatever ended the stream.
fn finish_attend(
    session: &AttendanceSession,
    store: &RosterStore,
    no_commit: bool,
    failure: Option<SessionError>,
) -> Result<()> {
    let roster = session.roster();
    if roster.is_empty() {
        println!("No students recognized.");
    }
    for id in &roster {
        println!("  {id}  {}", store.student_name(id));
    }

    if no_commit {
        println!("Not committed ({} in roster).", roster.len());
    } else {
        let summary = session.commit(store)?;
        println!(
            "Saved {} records ({} already marked today).",
            summary.saved, summary.already_marked
        );
    }

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn cmd_attend(
    config: Config,
    max_frames: Option<usize>,
    no_commit: bool,
    snapshot: Option<PathBuf>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let store = open_store(&config)?;
    let recognizer = load_model(&store.layout().model_file())?;
    let detector = load_detector(&config)?;
    let session = Arc::new(AttendanceSession::new());

    let frames = session.start(&camera(&config), detector, recognizer, store.clone())?;
    println!("Recognizing; press Ctrl-C to stop.");
    let (last, failure) = drain_frames(frames, max_frames, &stop);

    if let (Some(path), Some(image)) = (snapshot, last.as_ref()) {
        save_snapshot(image, &path)?;
    }
    finish_attend(&session, &store, no_commit, failure)
}

fn cmd_register(config: Config, id: &str, name: &str, limit: Option<usize>) -> Result<()> {
    let store = open_store(&config)?;
    // Load the detector first so a missing model does not leave a half-registered student.
    let detector = load_detector(&config)?;
    let student = store.add_student(id, name)?;

    let mut options = config.capture_options();
    if let Some(limit) = limit {
        options.limit = limit;
    }
    let samples = SampleStore::new(store.layout().training_dir());
    let capture = RegistrationCapture::start(&camera(&config), detector, samples, student, options)?;

    let mut captured = 0;
    for frame in capture {
        let frame = frame?;
        if frame.captured != captured {
            captured = frame.captured;
            println!("Captured {}/{}", frame.captured, frame.limit);
        }
    }
    if captured < options.limit {
        println!("Camera stopped early: {captured}/{} samples.", options.limit);
    } else {
        println!("Successfully captured {captured} images for {name}.");
    }
    Ok(())
}

fn cmd_preview(config: Config, frames: usize, output: &Path) -> Result<()> {
    let detector = load_detector(&config)?;
    let mut last = None;
    for frame in PreviewFrames::start(&camera(&config), detector)?.take(frames.max(1)) {
        last = Some(frame?);
    }
    match last {
        Some(image) => save_snapshot(&image, output),
        None => anyhow::bail!("camera produced no frames"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load().context("loading configuration")?;
    if let Some(path) = &config.label_font {
        attendance_core::annotate::set_label_font(path).context("loading label font")?;
    }

    match cli.command {
        Commands::Students => {
            let students = open_store(&config)?.students();
            if students.is_empty() {
                println!("No students registered");
            }
            for s in students {
                println!("{}\t{}", s.id, s.name);
            }
        }
        Commands::Today { date } => {
            let store = open_store(&config)?;
            let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let records = store.records_on(date);
            println!("Attendance for {date}: {} present", records.len());
            for r in records {
                println!("{}\t{}\t{}", r.id, r.name, r.time);
            }
        }
        Commands::Register { id, name, limit } => {
            tokio::task::spawn_blocking(move || cmd_register(config, &id, &name, limit)).await??;
        }
        Commands::Train => {
            let store = open_store(&config)?;
            let samples = SampleStore::new(store.layout().training_dir());
            let summary = train_model(&samples, &mut LbphRecognizer::new(), &store.layout().model_file())?;
            println!(
                "Model trained on {} images of {} students ({} skipped).",
                summary.faces,
                summary.per_student.len(),
                summary.skipped
            );
        }
        Commands::Attend { max_frames, no_commit, snapshot } => {
            let stop = Arc::new(AtomicBool::new(false));
            tokio::spawn({
                let stop = Arc::clone(&stop);
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("interrupt received; stopping after this frame");
                        stop.store(true, Ordering::Relaxed);
                    }
                }
            });
            tokio::task::spawn_blocking(move || cmd_attend(config, max_frames, no_commit, snapshot, stop))
                .await??;
        }
        Commands::Preview { frames, output } => {
            tokio::task::spawn_blocking(move || cmd_preview(config, frames, &output)).await??;
        }
        Commands::ClearAll { password } => match config.verify_danger_secret(&password) {
            attendance_core::SecretCheck::Accepted => {
                open_store(&config)?.clear_all()?;
                println!("All student data cleared.");
            }
            attendance_core::SecretCheck::Rejected => anyhow::bail!("incorrect password"),
            attendance_core::SecretCheck::Disabled => {
                anyhow::bail!("bulk clear is disabled: set ATTENDANCE_DANGER_SECRET")
            }
        },
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = failure_kind(&e).map_or(1, FailureKind::exit_code);
            ExitCode::from(code as u8)
        }
    }
}
