use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
// Only import Daemonize on Unix platforms
#[cfg(unix)]
use daemonize::Daemonize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use ytq::agent::YtDlpAgent;
use ytq::config::{load_config, project_dirs, Config};
use ytq::control::{ControlSurface, Defaults, Intake};
use ytq::models::{HistoryEntry, HistoryStatus, Source, Submission};
use ytq::store::{read_json_or_default, QueueStore, StorePaths};
use ytq::sync::{Mailbox, Synchronizer};
use ytq::worker::QueueWorker;
use ytq::{console, handlers, AppState};

// --- Command-Line Argument Parsing ---
#[derive(Parser, Debug)]
#[command(author, version, about = "A personal download queue for yt-dlp.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the download manager in the foreground with an interactive console.
    Run {
        /// Start downloading as soon as items are added.
        #[arg(long)]
        auto_download: bool,
    },
    /// Manages the local API listener process.
    Api {
        #[command(subcommand)]
        action: ServerAction,
    },
    /// Submit a URL to the running manager through the mailbox file.
    Add {
        url: String,
        #[arg(long)]
        quality: Option<String>,
        #[arg(long)]
        format: Option<String>,
        #[arg(long)]
        audio_bitrate: Option<String>,
    },
    /// Print the download history.
    History {
        /// Number of most recent entries to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ServerAction {
    /// Start the API listener as a background process.
    Start,
    /// Stop the background API listener.
    Stop,
    /// Restart the background API listener.
    Restart,
    /// Run the API listener in the foreground.
    Run,
    /// Check the status of the background API listener.
    Status,
}

// --- Main Application Logic ---
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { auto_download } => run_manager(auto_download).await?,
        Commands::Api { action } => match action {
            ServerAction::Start => start_server()?,
            ServerAction::Stop => stop_server()?,
            ServerAction::Restart => {
                stop_server()?;
                std::thread::sleep(Duration::from_secs(1));
                start_server()?;
            }
            ServerAction::Run => run_server().await?,
            ServerAction::Status => check_status()?,
        },
        Commands::Add { url, quality, format, audio_bitrate } => {
            submit(Submission { url, quality, format, audio_bitrate }).await?
        }
        Commands::History { limit } => print_history(limit).await?,
    }

    Ok(())
}

fn intake_for(config: &Config, agent: Arc<YtDlpAgent>) -> Arc<Intake> {
    Arc::new(Intake::new(agent, Defaults::from(config)))
}

/// The foreground manager: queue store, worker, synchronizer and console.
async fn run_manager(auto_download: bool) -> anyhow::Result<()> {
    // Logs go to stderr so they don't interleave with console output.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let config = load_config().await?;

    let agent = Arc::new(YtDlpAgent::new(&config.agent_binary, &config.download_directory));
    if !agent.is_available().await {
        eprintln!("{} is not installed. Please install it first:", config.agent_binary);
        eprintln!("pip install yt-dlp");
    }

    let store = Arc::new(QueueStore::open(StorePaths {
        queue: config.queue_path(),
        history: config.history_path(),
    }));
    let worker = QueueWorker::new(store.clone(), agent.clone());
    let auto_download = auto_download || config.auto_download;
    let control = ControlSurface::new(store.clone(), worker.clone(), intake_for(&config, agent), auto_download);

    let mut synchronizer = Synchronizer::new(store.clone(), Mailbox::new(config.mailbox_path()));
    if auto_download {
        synchronizer = synchronizer.with_auto_start(worker.clone());
    }
    let shutdown = CancellationToken::new();
    let sync_task = synchronizer.spawn(shutdown.clone());
    tracing::info!("Watching {} for API submissions", config.mailbox_path().display());

    let result = console::run(control.clone()).await;

    shutdown.cancel();
    sync_task.await?;
    if control.is_running() {
        println!("Stopping the current download...");
        control.pause();
        control.cancel_current();
        let stopped = tokio::time::timeout(Duration::from_secs(10), async {
            while control.is_running() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if stopped.is_err() {
            tracing::warn!("Worker did not stop in time");
        }
    }
    result
}

/// The core function that runs the Axum web server.
async fn run_server() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let config = load_config().await?;
    let agent = Arc::new(YtDlpAgent::new(&config.agent_binary, &config.download_directory));
    let state = AppState {
        intake: intake_for(&config, agent),
        mailbox: Mailbox::new(config.mailbox_path()),
        snapshot: config.queue_path(),
    };
    let addr = config.api_addr();
    let app = Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/add-to-queue", post(handlers::add_to_queue))
        .route("/api/get-queue", get(handlers::get_queue))
        .route("/api/get-video-info", post(handlers::get_video_info))
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any))
        .with_state(state);
    tracing::info!("Starting API server in foreground, listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// One-shot remote submission from the shell.
async fn submit(submission: Submission) -> anyhow::Result<()> {
    let config = load_config().await?;
    let agent = Arc::new(YtDlpAgent::new(&config.agent_binary, &config.download_directory));
    let item = intake_for(&config, agent).prepare(submission, Source::Remote).await?;
    Mailbox::new(config.mailbox_path()).post(&item)?;
    println!("Video added to queue: {}", item.title);
    Ok(())
}

async fn print_history(limit: usize) -> anyhow::Result<()> {
    let config = load_config().await?;
    let history: Vec<HistoryEntry> = read_json_or_default(&config.history_path());
    if history.is_empty() {
        println!("No downloads yet.");
    }
    for entry in history.iter().rev().take(limit) {
        let status = match entry.status {
            HistoryStatus::Success => "Success",
            HistoryStatus::Failed => "Failed",
        };
        println!(
            "{}  {:<7}  {}  [{} / {}, {}]  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            status,
            entry.title,
            entry.quality,
            entry.format,
            entry.size,
            entry.url
        );
    }
    Ok(())
}

/// Starts the API listener as a background process using platform-specific logic.
fn start_server() -> anyhow::Result<()> {
    if is_running()? {
        println!("API server is already running.");
        return Ok(());
    }

    let pid_file = get_pid_path()?;
    let myself = env::current_exe()?;
    println!("Starting API server in the background...");

    let mut listener = Command::new(&myself);
    listener.arg("api").arg("run");

    #[cfg(unix)]
    {
        println!("PID file at: {}", pid_file.display());
        // The daemon only detaches; the PID on record is the listener it spawns.
        if let Err(e) = Daemonize::new().start() {
            eprintln!("Error, failed to daemonize: {}", e);
            return Ok(());
        }
        spawn_recorded(&mut listener, &pid_file)?;
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;

        listener.creation_flags(CREATE_NO_WINDOW);
        spawn_recorded(&mut listener, &pid_file)?;
        println!("API server started. PID file at: {}", pid_file.display());
    }

    Ok(())
}

/// Stops the background API listener.
fn stop_server() -> anyhow::Result<()> {
    let pid_file = get_pid_path()?;
    match kill_recorded(&pid_file)? {
        None => println!("API server is not running (no PID file)."),
        Some((pid, true)) => println!("Stopped API server process with PID: {}", pid),
        Some((pid, false)) => println!("Process with PID {} not found. It may have already stopped.", pid),
    }
    Ok(())
}

/// Checks if the API listener process is running.
fn check_status() -> anyhow::Result<()> {
    match read_pid(&get_pid_path()?)? {
        Some(pid) if is_alive(pid) => println!("API server is running with PID: {}", pid),
        _ => println!("API server is not running."),
    }
    Ok(())
}

// --- Helper Functions ---

/// Gets the path for the API listener's PID file.
fn get_pid_path() -> anyhow::Result<PathBuf> {
    let project_dirs = project_dirs()?;
    let data_dir = project_dirs.data_local_dir();
    fs::create_dir_all(data_dir)?;
    Ok(data_dir.join("api.pid"))
}

/// Checks the PID file against the process list.
fn is_running() -> anyhow::Result<bool> {
    Ok(read_pid(&get_pid_path()?)?.is_some_and(is_alive))
}

/// Spawns the listener and records its own PID.
fn spawn_recorded(command: &mut Command, pid_file: &Path) -> anyhow::Result<Child> {
    let child = command.spawn()?;
    fs::write(pid_file, child.id().to_string())?;
    Ok(child)
}

fn read_pid(pid_file: &Path) -> anyhow::Result<Option<u32>> {
    if !pid_file.exists() {
        return Ok(None);
    }
    let pid_str = fs::read_to_string(pid_file)?;
    Ok(Some(pid_str.trim().parse()?))
}

fn is_alive(pid: u32) -> bool {
    let s = System::new_all();
    s.process(Pid::from_u32(pid)).is_some()
}

/// Kills the recorded process and removes the PID file. Returns the PID and
/// whether a live process was found.
fn kill_recorded(pid_file: &Path) -> anyhow::Result<Option<(u32, bool)>> {
    let Some(pid) = read_pid(pid_file)? else {
        return Ok(None);
    };
    let s = System::new_all();
    let killed = s.process(Pid::from_u32(pid)).map(|process| process.kill()).unwrap_or(false);
    fs::remove_file(pid_file)?;
    Ok(Some((pid, killed)))
}
