use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_SIZE: &str = "Unknown";

/// Format tokens that request audio-only extraction.
pub const AUDIO_FORMATS: &[&str] = &["mp3", "m4a", "wav", "opus"];

pub fn is_audio_format(format: &str) -> bool {
    AUDIO_FORMATS.contains(&format)
}

// === Queue & History Models ===

/// Lifecycle of a queue item: `Queued -> Downloading -> {Completed | Failed}`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        matches!(
            (self, next),
            (ItemStatus::Queued, ItemStatus::Downloading)
                | (ItemStatus::Downloading, ItemStatus::Completed)
                | (ItemStatus::Downloading, ItemStatus::Failed)
        )
    }
}

/// Where a queue item was submitted from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Source {
    #[default]
    Local,
    Remote,
}

/// One requested download.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueItem {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub url: String,
    pub title: String,
    pub quality: String,
    pub format: String,
    #[serde(default)]
    pub audio_bitrate: Option<String>,
    pub status: ItemStatus,
    pub added_time: DateTime<Utc>,
    #[serde(default)]
    pub source: Source,
}

impl QueueItem {
    pub fn is_audio(&self) -> bool {
        is_audio_format(&self.format)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStatus {
    Success,
    Failed,
}

/// Immutable record of one terminal attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub title: String,
    pub quality: String,
    pub format: String,
    pub status: HistoryStatus,
    pub size: String,
}

impl HistoryEntry {
    pub fn for_item(item: &QueueItem, status: HistoryStatus, size: Option<String>) -> Self {
        HistoryEntry {
            timestamp: Utc::now(),
            url: item.url.clone(),
            title: item.title.clone(),
            quality: item.quality.clone(),
            format: item.format.clone(),
            status,
            size: size.unwrap_or_else(|| UNKNOWN_SIZE.to_string()),
        }
    }
}

/// Why an item ended `Failed`. Kept apart from the generic exit failure so
/// callers can suggest the right remediation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    AgentUnavailable,
    LaunchFailed { message: String },
    ExitNonZero { code: Option<i32> },
    AnomalyAbort { hits: u32 },
    Cancelled,
}

impl FailureReason {
    pub fn hint(&self) -> &'static str {
        match self {
            FailureReason::AgentUnavailable => "install the fetch agent (pip install yt-dlp) and make sure it is on PATH",
            FailureReason::LaunchFailed { .. } => "the fetch agent could not be started; check permissions on the agent and download directory",
            FailureReason::ExitNonZero { .. } => "the fetch agent reported an error; inspect the last output lines",
            FailureReason::AnomalyAbort { .. } => "too many access-denied responses, consider changing network path",
            FailureReason::Cancelled => "the download was cancelled; re-enqueue the URL to retry",
        }
    }
}

/// Summary of the most recently finished item, kept for on-demand diagnostics.
#[derive(Serialize, Debug, Clone)]
pub struct FinishedReport {
    pub item: QueueItem,
    pub failure: Option<FailureReason>,
    pub output_tail: Vec<String>,
}

/// Status callbacks published to the UI and any other observer.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued { item: QueueItem },
    Started { id: Uuid, title: String },
    Progress { id: Uuid, percent: f64 },
    Finished { id: Uuid, title: String, status: ItemStatus, failure: Option<FailureReason> },
    Paused,
    Idle,
    Synced { count: usize },
    Cleared { count: usize },
}

// === API Request/Response Models ===

/// The JSON body for a `POST /api/add-to-queue` request.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Submission {
    #[serde(default)]
    pub url: String,
    pub quality: Option<String>,
    pub format: Option<String>,
    pub audio_bitrate: Option<String>,
}

/// The JSON body for a `POST /api/get-video-info` request.
#[derive(Deserialize, Debug)]
pub struct VideoInfoRequest {
    #[serde(default)]
    pub url: String,
}

#[derive(Serialize, Debug)]
pub struct EnqueueResponse {
    pub status: &'static str,
    pub message: String,
    pub queue_item: QueueItem,
}

#[derive(Serialize, Debug)]
pub struct QueueListing {
    pub status: &'static str,
    pub queue: Vec<QueueItem>,
    pub pending: Vec<QueueItem>,
}

#[derive(Serialize, Debug)]
pub struct VideoInfoResponse {
    pub status: &'static str,
    pub title: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_forward_transitions_are_allowed() {
        assert!(ItemStatus::Queued.can_transition_to(ItemStatus::Downloading));
        assert!(ItemStatus::Downloading.can_transition_to(ItemStatus::Completed));
        assert!(ItemStatus::Downloading.can_transition_to(ItemStatus::Failed));
        assert!(!ItemStatus::Queued.can_transition_to(ItemStatus::Completed));
        assert!(!ItemStatus::Completed.can_transition_to(ItemStatus::Downloading));
        assert!(!ItemStatus::Failed.can_transition_to(ItemStatus::Queued));
    }

    #[test]
    fn item_without_id_or_source_still_loads() {
        let raw = r#"{
            "url": "https://youtu.be/abc123",
            "title": "clip",
            "quality": "best",
            "format": "mp4",
            "status": "Queued",
            "added_time": "2024-05-01T10:00:00Z"
        }"#;
        let item: QueueItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.source, Source::Local);
        assert_eq!(item.audio_bitrate, None);
        assert_eq!(item.status, ItemStatus::Queued);
    }

    #[test]
    fn anomaly_abort_is_distinct_from_generic_failure() {
        let abort = FailureReason::AnomalyAbort { hits: 5 };
        let exit = FailureReason::ExitNonZero { code: Some(1) };
        assert_ne!(abort.hint(), exit.hint());
        assert!(abort.hint().contains("access-denied"));
    }
}
