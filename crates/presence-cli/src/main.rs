use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use presence_core::{EuclideanMatcher, FeatureExtractor, KnownSetCell};
use presence_hw::{Camera, ImageSequenceSource, NullPreview, PreviewSink, SnapshotPreview, VideoSource};
use presence_session::{ControllerState, SessionController};
use presence_store::{SessionStore, SqliteStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

/// Write every Nth preview frame to the snapshot file.
const PREVIEW_EVERY: u64 = 5;
const STATE_POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "presence", about = "Face-recognition attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage professors
    #[command(subcommand)]
    Professor(ProfessorCommand),
    /// Manage enrolled students
    #[command(subcommand)]
    Student(StudentCommand),
    /// Check that a photo is usable for enrollment
    Check {
        image: PathBuf,
    },
    /// Identify every face in a still image
    Identify {
        image: PathBuf,
    },
    /// Run and inspect attendance sessions
    #[command(subcommand)]
    Session(SessionCommand),
    /// List video capture devices
    Devices,
}

#[derive(Subcommand)]
enum ProfessorCommand {
    Add {
        first_name: String,
        last_name: String,
        subject: String,
    },
    List,
    Remove {
        id: i64,
    },
}

#[derive(Subcommand)]
enum StudentCommand {
    /// Enroll a student from a photo containing exactly one face
    Enroll {
        first_name: String,
        last_name: String,
        #[arg(short, long)]
        photo: PathBuf,
    },
    List,
    Remove {
        id: i64,
    },
    /// Re-encode every student from their stored photo with the active encoder
    Reencode,
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Take attendance until Ctrl-C or until the video source ends
    Run {
        professor_id: i64,
        subject: String,
        /// Replay images from this directory instead of the camera
        #[arg(long)]
        frames: Option<PathBuf>,
        /// Loop the replayed images
        #[arg(long = "loop", requires = "frames")]
        looping: bool,
    },
    /// Every student with their check-in time or absence
    Report {
        session_id: i64,
    },
    Stats {
        session_id: i64,
    },
    /// Raw attendance records
    Attendance {
        session_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Professor(cmd) => professor(&config, cmd),
        Commands::Student(cmd) => student(&config, cmd),
        Commands::Check { image } => {
            let extractor = load_extractor(&config)?;
            let bytes = read_image(&image)?;
            let check = presence_session::check_photo(&extractor, &bytes)?;
            print_json(&check)
        }
        Commands::Identify { image } => identify(&config, &image),
        Commands::Session(cmd) => session(&config, cmd).await,
        Commands::Devices => print_json(&Camera::list_devices()),
    }
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))
}

fn load_extractor(config: &Config) -> Result<FeatureExtractor> {
    FeatureExtractor::load(&config.extractor_config())
        .with_context(|| format!("loading face cascade {}", config.cascade_path.display()))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn professor(config: &Config, cmd: ProfessorCommand) -> Result<()> {
    let store = open_store(config)?;
    match cmd {
        ProfessorCommand::Add {
            first_name,
            last_name,
            subject,
        } => {
            let id = store.add_professor(&first_name, &last_name, &subject)?;
            print_json(&serde_json::json!({ "id": id }))
        }
        ProfessorCommand::List => print_json(&store.list_professors()?),
        ProfessorCommand::Remove { id } => {
            if !store.delete_professor(id)? {
                bail!("professor {id} not found");
            }
            Ok(())
        }
    }
}

fn student(config: &Config, cmd: StudentCommand) -> Result<()> {
    let store = open_store(config)?;
    match cmd {
        StudentCommand::Enroll {
            first_name,
            last_name,
            photo,
        } => {
            let extractor = load_extractor(config)?;
            let bytes = read_image(&photo)?;
            let enrolled = presence_session::enroll_student(
                &extractor,
                &store,
                Some(config.photo_dir.as_path()),
                &bytes,
                &first_name,
                &last_name,
            )?;
            print_json(&enrolled)
        }
        StudentCommand::List => print_json(&store.list_students()?),
        StudentCommand::Remove { id } => {
            if !store.delete_student(id)? {
                bail!("student {id} not found");
            }
            Ok(())
        }
        StudentCommand::Reencode => {
            let extractor = load_extractor(config)?;
            let report = presence_session::reencode_students(&extractor, &store)?;
            print_json(&report)
        }
    }
}

fn identify(config: &Config, path: &Path) -> Result<()> {
    let store = open_store(config)?;
    let extractor = load_extractor(config)?;
    let known = KnownSetCell::new(extractor.empty_known_set());
    let snapshot = presence_session::reload_known_set(&store, &known)?;

    let frame = image::load_from_memory(&read_image(path)?)
        .with_context(|| format!("decoding {}", path.display()))?
        .to_rgb8();
    let results = extractor.recognize(&frame, &snapshot, &EuclideanMatcher)?;
    print_json(&results)
}

async fn session(config: &Config, cmd: SessionCommand) -> Result<()> {
    match cmd {
        SessionCommand::Run {
            professor_id,
            subject,
            frames,
            looping,
        } => run_session(config, professor_id, &subject, frames, looping).await,
        SessionCommand::Report { session_id } => {
            print_json(&open_store(config)?.session_report(session_id)?)
        }
        SessionCommand::Stats { session_id } => {
            print_json(&open_store(config)?.session_stats(session_id)?)
        }
        SessionCommand::Attendance { session_id } => {
            print_json(&open_store(config)?.session_attendance(session_id)?)
        }
    }
}

async fn run_session(
    config: &Config,
    professor_id: i64,
    subject: &str,
    frames: Option<PathBuf>,
    looping: bool,
) -> Result<()> {
    let store = Arc::new(open_store(config)?);
    if store.professor(professor_id)?.is_none() {
        bail!("professor {professor_id} not found");
    }

    let extractor = Arc::new(load_extractor(config)?);
    let known = Arc::new(KnownSetCell::new(extractor.empty_known_set()));
    let snapshot = presence_session::reload_known_set(store.as_ref(), &known)?;
    if snapshot.is_empty() {
        tracing::warn!("no enrolled students in the active encoding mode");
    }

    let source: Box<dyn VideoSource> = match frames {
        Some(dir) => Box::new(ImageSequenceSource::new(dir).looping(looping)),
        None => Box::new(Camera::new(&config.camera_device)),
    };
    let preview: Box<dyn PreviewSink> = match &config.preview_path {
        Some(path) => Box::new(
            SnapshotPreview::new(path.clone(), PREVIEW_EVERY)
                .with_context(|| format!("starting preview writer for {}", path.display()))?,
        ),
        None => Box::new(NullPreview),
    };

    let session_id = store.create_session(professor_id, subject)?;
    let mut controller = SessionController::new(
        extractor,
        Arc::new(EuclideanMatcher),
        store.clone(),
        store.clone(),
        source,
        preview,
        config.controller_options(),
    );

    if let Err(e) = controller.start(session_id, known) {
        store.end_session(session_id)?;
        return Err(e.into());
    }
    eprintln!("Session {session_id} running. Press Ctrl-C to stop.");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(STATE_POLL);
    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res?;
                tracing::info!("interrupt received");
                break;
            }
            _ = poll.tick() => {
                if controller.state() != ControllerState::Running {
                    break;
                }
            }
        }
    }

    // stop() joins worker threads; keep it off the async runtime.
    let (summary, status) = tokio::task::spawn_blocking(move || {
        controller.stop();
        (controller.summary(), controller.status())
    })
    .await?;

    print_json(&serde_json::json!({
        "session_id": session_id,
        "marked_count": summary.marked_count,
        "marked_ids": summary.marked_ids,
        "frames_read": status.frames_read,
        "detection_cycles": status.detection_cycles,
    }))
}
