//! Fetch agent adapter: turns a queue item into a yt-dlp invocation and
//! exposes the child's merged stdout/stderr as a cancellable line stream.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::models::{QueueItem, UNKNOWN_TITLE};

const LINE_BUFFER: usize = 256;
const TITLE_TIMEOUT: Duration = Duration::from_secs(30);
const TITLE_MAX_CHARS: usize = 50;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

static TITLE_STRIP_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s\-\.]").unwrap());

/// Launches one download per queue item.
#[async_trait]
pub trait FetchAgent: Send + Sync {
    async fn launch(&self, item: &QueueItem) -> Result<AgentRun, AgentError>;
}

/// Resolves a display title for a URL. Never fails: falls back to `Unknown Title`.
#[async_trait]
pub trait TitleLookup: Send + Sync {
    async fn title(&self, url: &str) -> String;
}

/// A running agent invocation.
///
/// Lines arrive through [`AgentRun::next_line`] until the child closes its
/// output or the run is cancelled; [`AgentRun::finish`] then yields the
/// terminal outcome. Once cancelled, no further lines are delivered and the
/// outcome is always [`AgentError::Cancelled`].
pub struct AgentRun {
    lines: mpsc::Receiver<String>,
    cancel: CancellationToken,
    exit: JoinHandle<Result<(), AgentError>>,
}

impl AgentRun {
    pub fn new(
        lines: mpsc::Receiver<String>,
        cancel: CancellationToken,
        exit: JoinHandle<Result<(), AgentError>>,
    ) -> Self {
        AgentRun { lines, cancel, exit }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            line = self.lines.recv() => line,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn finish(self) -> Result<(), AgentError> {
        // Stop reader tasks from blocking on a full channel nobody drains.
        drop(self.lines);
        let outcome = match self.exit.await {
            Ok(outcome) => outcome,
            Err(e) => Err(AgentError::LaunchFailed(e.to_string())),
        };
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        outcome
    }
}

/// The real fetch agent: a `yt-dlp` child process.
#[derive(Debug, Clone)]
pub struct YtDlpAgent {
    binary: String,
    download_dir: PathBuf,
}

impl YtDlpAgent {
    pub fn new(binary: impl Into<String>, download_dir: impl Into<PathBuf>) -> Self {
        YtDlpAgent { binary: binary.into(), download_dir: download_dir.into() }
    }

    /// Checks that the agent binary answers `--version`.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Builds the yt-dlp argument list for an item. The URL is always last.
pub fn build_args(item: &QueueItem, download_dir: &std::path::Path) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    if item.is_audio() {
        args.extend(["-x".into(), "--audio-format".into(), item.format.clone()]);
        if let Some(bitrate) = &item.audio_bitrate {
            args.extend(["--audio-quality".into(), bitrate.clone()]);
        }
    } else {
        let selector = if item.quality == "best" {
            "best".to_string()
        } else {
            format!("best[height<={}]", item.quality)
        };
        args.extend(["--format".into(), selector]);
        if item.format != "best" {
            args.extend(["--merge-output-format".into(), item.format.clone()]);
        }
    }

    let template = download_dir.join("%(title)s.%(ext)s");
    args.extend(["--output".into(), template.to_string_lossy().to_string()]);

    for flag in [
        "--no-playlist",
        "--newline",
        "--retries", "10",
        "--fragment-retries", "10",
        "--socket-timeout", "30",
        "--http-chunk-size", "10485760",
        "--concurrent-fragments", "4",
        "--buffer-size", "65536",
        "--user-agent", USER_AGENT,
    ] {
        args.push(flag.to_string());
    }

    args.push(item.url.clone());
    args
}

#[async_trait]
impl FetchAgent for YtDlpAgent {
    async fn launch(&self, item: &QueueItem) -> Result<AgentRun, AgentError> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| AgentError::LaunchFailed(format!("cannot create {}: {}", self.download_dir.display(), e)))?;

        let args = build_args(item, &self.download_dir);
        tracing::debug!("Launching {} {}", self.binary, args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .current_dir(&self.download_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => AgentError::AgentUnavailable(self.binary.clone()),
                _ => AgentError::LaunchFailed(e.to_string()),
            })?;

        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let exit = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(AgentError::ExitNonZero { code: status.code() }),
                    Err(e) => Err(AgentError::LaunchFailed(e.to_string())),
                },
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!("Failed to kill fetch agent: {}", e);
                    }
                    Err(AgentError::Cancelled)
                }
            }
        });

        Ok(AgentRun::new(rx, cancel, exit))
    }
}

#[async_trait]
impl TitleLookup for YtDlpAgent {
    async fn title(&self, url: &str) -> String {
        let lookup = Command::new(&self.binary)
            .arg("--get-title")
            .arg("--no-playlist")
            .arg(url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(TITLE_TIMEOUT, lookup).await {
            Ok(Ok(output)) if output.status.success() => {
                sanitize_title(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(Ok(output)) => {
                tracing::debug!("Title lookup for {} exited with {:?}", url, output.status.code());
                UNKNOWN_TITLE.to_string()
            }
            Ok(Err(e)) => {
                tracing::debug!("Title lookup for {} failed: {}", url, e);
                UNKNOWN_TITLE.to_string()
            }
            Err(_) => {
                tracing::debug!("Title lookup for {} timed out", url);
                UNKNOWN_TITLE.to_string()
            }
        }
    }
}

/// Keeps word characters, whitespace, `-` and `.`, then truncates to 50 characters.
pub fn sanitize_title(raw: &str) -> String {
    let cleaned = TITLE_STRIP_REGEX.replace_all(raw.trim(), "");
    let title: String = cleaned.chars().take(TITLE_MAX_CHARS).collect();
    if title.trim().is_empty() {
        UNKNOWN_TITLE.to_string()
    } else {
        title
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = LinesStream::new(BufReader::new(reader).lines());
    while let Some(Ok(line)) = lines.next().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if tx.send(line).await.is_err() {
            break;
        }
    }
}
