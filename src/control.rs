//! Operations the UI and the API call into.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::agent::TitleLookup;
use crate::config::Config;
use crate::error::{ClearError, EnqueueError, WorkerError};
use crate::models::{
    is_audio_format, FinishedReport, HistoryEntry, ItemStatus, QueueEvent, QueueItem, Source,
    Submission,
};
use crate::store::QueueStore;
use crate::worker::QueueWorker;

/// Only links starting with one of these are accepted.
pub const ALLOWED_PREFIXES: &[&str] = &[
    "https://www.youtube.com/",
    "https://youtu.be/",
    "https://youtube.com/",
];

/// Values used when a submission leaves a field out.
#[derive(Debug, Clone)]
pub struct Defaults {
    pub quality: String,
    pub format: String,
    pub audio_bitrate: String,
}

impl From<&Config> for Defaults {
    fn from(config: &Config) -> Self {
        Defaults {
            quality: config.default_quality.clone(),
            format: config.default_format.clone(),
            audio_bitrate: config.audio_bitrate.clone(),
        }
    }
}

pub fn validate_url(raw: &str) -> Result<String, EnqueueError> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(EnqueueError::EmptyUrl);
    }
    if !ALLOWED_PREFIXES.iter().any(|p| url.starts_with(p)) {
        return Err(EnqueueError::InvalidUrlPrefix(url.to_string()));
    }
    Ok(url.to_string())
}

/// `"mp3 (Audio Only)"` becomes `"mp3"`.
pub fn normalize_format(raw: &str) -> String {
    raw.split_whitespace().next().unwrap_or_default().to_lowercase()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Turns raw submissions into queue items: validation, defaults, title lookup.
/// Shared by the manager process and the API process.
pub struct Intake {
    titles: Arc<dyn TitleLookup>,
    defaults: Defaults,
}

impl Intake {
    pub fn new(titles: Arc<dyn TitleLookup>, defaults: Defaults) -> Self {
        Intake { titles, defaults }
    }

    pub async fn prepare(&self, submission: Submission, source: Source) -> Result<QueueItem, EnqueueError> {
        let url = validate_url(&submission.url)?;
        let title = self.titles.title(&url).await;

        let quality = non_blank(submission.quality).unwrap_or_else(|| self.defaults.quality.clone());
        let format = normalize_format(
            &non_blank(submission.format).unwrap_or_else(|| self.defaults.format.clone()),
        );
        let audio_bitrate = is_audio_format(&format).then(|| {
            non_blank(submission.audio_bitrate).unwrap_or_else(|| self.defaults.audio_bitrate.clone())
        });

        Ok(QueueItem {
            id: uuid::Uuid::new_v4(),
            url,
            title,
            quality,
            format,
            audio_bitrate,
            status: ItemStatus::Queued,
            added_time: chrono::Utc::now(),
            source,
        })
    }

    /// Validates the URL and resolves its display title.
    pub async fn lookup_title(&self, raw_url: &str) -> Result<(String, String), EnqueueError> {
        let url = validate_url(raw_url)?;
        let title = self.titles.title(&url).await;
        Ok((url, title))
    }
}

#[derive(Clone)]
pub struct ControlSurface {
    store: Arc<QueueStore>,
    worker: QueueWorker,
    intake: Arc<Intake>,
    auto_download: bool,
}

impl ControlSurface {
    pub fn new(store: Arc<QueueStore>, worker: QueueWorker, intake: Arc<Intake>, auto_download: bool) -> Self {
        ControlSurface { store, worker, intake, auto_download }
    }

    pub async fn enqueue(&self, submission: Submission, source: Source) -> Result<QueueItem, EnqueueError> {
        let item = self.intake.prepare(submission, source).await?;
        self.store.append(item.clone());
        tracing::info!("Added to queue: {} ({})", item.title, item.url);
        self.store.emit(QueueEvent::Enqueued { item: item.clone() });

        if self.auto_download && self.worker.start().is_ok() {
            tracing::info!("Auto-download started");
        }
        Ok(item)
    }

    pub fn list(&self) -> Vec<QueueItem> {
        self.store.list()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.store.history()
    }

    pub fn clear(&self) -> Result<usize, ClearError> {
        let count = self.store.clear()?;
        tracing::info!("Queue cleared ({} item(s))", count);
        self.store.emit(QueueEvent::Cleared { count });
        Ok(count)
    }

    pub fn start(&self) -> Result<JoinHandle<()>, WorkerError> {
        self.worker.start()
    }

    pub fn pause(&self) -> bool {
        self.worker.pause()
    }

    pub fn cancel_current(&self) -> bool {
        self.worker.cancel_current()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn progress(&self) -> f64 {
        self.worker.progress()
    }

    pub fn last_report(&self) -> Option<FinishedReport> {
        self.worker.last_report()
    }

    /// The last `n` output lines of the most recently finished item.
    pub fn last_output(&self, n: usize) -> Vec<String> {
        self.worker
            .last_report()
            .map(|report| {
                let skip = report.output_tail.len().saturating_sub(n);
                report.output_tail.into_iter().skip(skip).collect()
            })
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.store.subscribe()
    }
}
