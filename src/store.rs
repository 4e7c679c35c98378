//! Queue store: the ordered queue plus the append-only history log.
//!
//! All mutations go through one mutex so the worker, the control surface and
//! the synchronizer serialize through a single choke point. Every change is
//! mirrored to disk before the call returns with a write-temp-then-rename.
//! Documents are serialized under the state lock but written after it is
//! released, so readers never wait on disk I/O.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ClearError;
use crate::models::{HistoryEntry, ItemStatus, QueueEvent, QueueItem};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct StorePaths {
    pub queue: PathBuf,
    pub history: PathBuf,
}

#[derive(Default)]
struct StoreInner {
    queue: Vec<QueueItem>,
    history: Vec<HistoryEntry>,
    queue_rev: u64,
    history_rev: u64,
}

impl StoreInner {
    fn stage_queue(&mut self) -> Option<Staged> {
        self.queue_rev += 1;
        stage(self.queue_rev, &self.queue)
    }

    fn stage_history(&mut self) -> Option<Staged> {
        self.history_rev += 1;
        stage(self.history_rev, &self.history)
    }
}

/// A serialized document and the revision it was taken at.
struct Staged {
    rev: u64,
    body: String,
}

fn stage<T: Serialize + ?Sized>(rev: u64, value: &T) -> Option<Staged> {
    match serde_json::to_string_pretty(value) {
        Ok(body) => Some(Staged { rev, body }),
        Err(e) => {
            tracing::warn!("Failed to serialize store document: {}", e);
            None
        }
    }
}

/// Last revision of each document that reached disk.
#[derive(Default)]
struct Written {
    queue: u64,
    history: u64,
}

pub struct QueueStore {
    inner: Mutex<StoreInner>,
    // Orders disk writes; never held together with `inner`.
    written: Mutex<Written>,
    paths: StorePaths,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueStore {
    /// Loads both documents; missing or malformed files start out empty.
    pub fn open(paths: StorePaths) -> Self {
        let mut queue: Vec<QueueItem> = read_json_or_default(&paths.queue);
        let history: Vec<HistoryEntry> = read_json_or_default(&paths.history);

        // A previous process died mid-download; nothing is running now.
        for item in queue.iter_mut().filter(|i| i.status == ItemStatus::Downloading) {
            tracing::warn!("Marking interrupted download as failed: {}", item.url);
            item.status = ItemStatus::Failed;
        }

        tracing::info!("Loaded {} queued item(s) and {} history entries", queue.len(), history.len());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        QueueStore {
            inner: Mutex::new(StoreInner { queue, history, ..Default::default() }),
            written: Mutex::new(Written::default()),
            paths,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends at the tail and persists the queue.
    pub fn append(&self, item: QueueItem) {
        let staged = {
            let mut inner = self.lock();
            inner.queue.push(item);
            inner.stage_queue()
        };
        self.persist_queue(staged);
    }

    /// Appends items whose URL is not already in the queue (also deduplicating
    /// within the batch). Returns the added items; persists only if there are any.
    pub fn merge(&self, incoming: Vec<QueueItem>) -> Vec<QueueItem> {
        let mut inner = self.lock();
        let mut known: HashSet<String> = inner.queue.iter().map(|i| i.url.clone()).collect();
        let mut added = Vec::new();

        for mut item in incoming {
            if !known.insert(item.url.clone()) {
                continue;
            }
            item.status = ItemStatus::Queued;
            added.push(item.clone());
            inner.queue.push(item);
        }

        if !added.is_empty() {
            let staged = inner.stage_queue();
            drop(inner);
            self.persist_queue(staged);
        }
        added
    }

    pub fn list(&self) -> Vec<QueueItem> {
        self.lock().queue.clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.clone()
    }

    pub fn has_queued(&self) -> bool {
        self.lock().queue.iter().any(|i| i.status == ItemStatus::Queued)
    }

    pub fn is_busy(&self) -> bool {
        self.lock().queue.iter().any(|i| i.status == ItemStatus::Downloading)
    }

    /// Applies a state-machine transition. Returns the updated item, or `None`
    /// if the item is gone or the transition is not allowed.
    pub fn replace_status(&self, id: Uuid, status: ItemStatus) -> Option<QueueItem> {
        let mut inner = self.lock();
        let updated = transition(&mut inner, id, status)?;
        let staged = inner.stage_queue();
        drop(inner);
        self.persist_queue(staged);
        Some(updated)
    }

    /// Marks the oldest `Queued` item `Downloading`, unless something is
    /// already downloading.
    pub fn claim_next(&self) -> Option<QueueItem> {
        let mut inner = self.lock();
        if inner.queue.iter().any(|i| i.status == ItemStatus::Downloading) {
            return None;
        }
        let id = inner.queue.iter().find(|i| i.status == ItemStatus::Queued)?.id;
        let claimed = transition(&mut inner, id, ItemStatus::Downloading)?;
        let staged = inner.stage_queue();
        drop(inner);
        self.persist_queue(staged);
        Some(claimed)
    }

    /// Records a terminal transition and its history entry in one step.
    pub fn finish(&self, id: Uuid, status: ItemStatus, entry: HistoryEntry) -> Option<QueueItem> {
        let mut inner = self.lock();
        let updated = transition(&mut inner, id, status);
        inner.history.push(entry);
        let (queue, history) = (inner.stage_queue(), inner.stage_history());
        drop(inner);
        self.persist_queue(queue);
        self.persist_history(history);
        updated
    }

    /// Records a history entry without touching the queue.
    pub fn append_history(&self, entry: HistoryEntry) {
        let staged = {
            let mut inner = self.lock();
            inner.history.push(entry);
            inner.stage_history()
        };
        self.persist_history(staged);
    }

    /// Drops every item. Rejected while something is downloading.
    pub fn clear(&self) -> Result<usize, ClearError> {
        let mut inner = self.lock();
        if inner.queue.iter().any(|i| i.status == ItemStatus::Downloading) {
            return Err(ClearError::Busy);
        }
        let count = inner.queue.len();
        inner.queue.clear();
        let staged = inner.stage_queue();
        drop(inner);
        self.persist_queue(staged);
        Ok(count)
    }

    fn persist_queue(&self, staged: Option<Staged>) {
        self.persist(&self.paths.queue, staged, |w| &mut w.queue);
    }

    fn persist_history(&self, staged: Option<Staged>) {
        self.persist(&self.paths.history, staged, |w| &mut w.history);
    }

    /// Writes `staged` unless a later revision of the same document is
    /// already on disk.
    fn persist(&self, path: &Path, staged: Option<Staged>, last: impl FnOnce(&mut Written) -> &mut u64) {
        let Some(staged) = staged else { return };
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        let last = last(&mut *written);
        if staged.rev <= *last {
            return;
        }
        match write_atomic(path, &staged.body) {
            Ok(()) => *last = staged.rev,
            Err(e) => tracing::warn!("Failed to persist {}: {:#}", path.display(), e),
        }
    }
}

fn transition(inner: &mut StoreInner, id: Uuid, status: ItemStatus) -> Option<QueueItem> {
    let item = inner.queue.iter_mut().find(|i| i.id == id)?;
    if !item.status.can_transition_to(status) {
        tracing::warn!("Rejected transition {:?} -> {:?} for {}", item.status, status, item.url);
        return None;
    }
    item.status = status;
    Some(item.clone())
}

/// Reads a JSON document, treating absent or malformed files as empty.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match read_json(path) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            tracing::warn!("Ignoring unreadable {}: {:#}", path.display(), e);
            T::default()
        }
    }
}

/// `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let value = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Pretty-prints to a sibling temp file, then renames it over `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    write_atomic(path, &body)
}

fn write_atomic(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{HistoryStatus, Source};
    use chrono::Utc;
    use tempfile::TempDir;

    pub(crate) fn paths_in(dir: &TempDir) -> StorePaths {
        StorePaths {
            queue: dir.path().join("download_queue.json"),
            history: dir.path().join("download_history.json"),
        }
    }

    pub(crate) fn queued(url: &str) -> QueueItem {
        QueueItem {
            id: Uuid::new_v4(),
            url: url.to_string(),
            title: "clip".to_string(),
            quality: "best".to_string(),
            format: "mp4".to_string(),
            audio_bitrate: None,
            status: ItemStatus::Queued,
            added_time: Utc::now(),
            source: Source::Local,
        }
    }

    #[test]
    fn persisted_queue_round_trips_field_for_field() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(paths_in(&dir));
        let mut audio = queued("https://youtu.be/b");
        audio.format = "mp3".to_string();
        audio.audio_bitrate = Some("192k".to_string());
        audio.source = Source::Remote;
        store.append(queued("https://youtu.be/a"));
        store.append(audio);
        store.append(queued("https://youtu.be/a"));

        let reopened = QueueStore::open(paths_in(&dir));
        assert_eq!(reopened.list(), store.list());
        assert!(!dir.path().join("download_queue.json.tmp").exists());
    }

    #[test]
    fn missing_or_malformed_documents_load_empty() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        assert!(QueueStore::open(paths.clone()).list().is_empty());

        fs::write(&paths.queue, "{ not json").unwrap();
        fs::write(&paths.history, "[1, 2").unwrap();
        let store = QueueStore::open(paths);
        assert!(store.list().is_empty());
        assert!(store.history().is_empty());
    }

    #[test]
    fn claim_next_allows_a_single_download() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(paths_in(&dir));
        store.append(queued("https://youtu.be/a"));
        store.append(queued("https://youtu.be/b"));

        let first = store.claim_next().unwrap();
        assert_eq!(first.url, "https://youtu.be/a");
        assert!(store.claim_next().is_none());
        let downloading = store.list().iter().filter(|i| i.status == ItemStatus::Downloading).count();
        assert_eq!(downloading, 1);
    }

    #[test]
    fn terminal_states_are_not_reentered() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(paths_in(&dir));
        let item = queued("https://youtu.be/a");
        let id = item.id;
        store.append(item);

        assert!(store.replace_status(id, ItemStatus::Completed).is_none());
        assert!(store.replace_status(id, ItemStatus::Downloading).is_some());
        assert!(store.replace_status(id, ItemStatus::Failed).is_some());
        assert!(store.replace_status(id, ItemStatus::Queued).is_none());
        assert_eq!(store.list()[0].status, ItemStatus::Failed);
    }

    #[test]
    fn clear_is_rejected_while_downloading() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(paths_in(&dir));
        store.append(queued("https://youtu.be/a"));
        store.append(queued("https://youtu.be/b"));
        let claimed = store.claim_next().unwrap();

        assert_eq!(store.clear(), Err(ClearError::Busy));
        assert_eq!(store.list().len(), 2);

        let entry = HistoryEntry::for_item(&claimed, HistoryStatus::Success, None);
        store.finish(claimed.id, ItemStatus::Completed, entry);
        assert_eq!(store.clear(), Ok(2));
        assert!(store.list().is_empty());
    }

    #[test]
    fn finish_appends_history_and_persists_both() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        let store = QueueStore::open(paths.clone());
        store.append(queued("https://youtu.be/a"));
        let claimed = store.claim_next().unwrap();
        let entry = HistoryEntry::for_item(&claimed, HistoryStatus::Failed, Some("3.5MiB".to_string()));
        store.finish(claimed.id, ItemStatus::Failed, entry);

        let reopened = QueueStore::open(paths);
        assert_eq!(reopened.list()[0].status, ItemStatus::Failed);
        let history = reopened.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HistoryStatus::Failed);
        assert_eq!(history[0].size, "3.5MiB");
    }

    #[test]
    fn interrupted_download_is_failed_on_load() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        let mut item = queued("https://youtu.be/a");
        item.status = ItemStatus::Downloading;
        write_json_atomic(&paths.queue, &vec![item]).unwrap();

        let store = QueueStore::open(paths);
        assert_eq!(store.list()[0].status, ItemStatus::Failed);
        assert!(!store.is_busy());
    }

    #[test]
    fn append_history_leaves_queue_untouched() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        let store = QueueStore::open(paths.clone());
        let item = queued("https://youtu.be/a");
        store.append(item.clone());
        store.append_history(HistoryEntry::for_item(&item, HistoryStatus::Success, None));

        let reopened = QueueStore::open(paths);
        assert_eq!(reopened.list(), vec![item]);
        assert_eq!(reopened.history().len(), 1);
        assert_eq!(reopened.history()[0].size, "Unknown");
    }

    #[test]
    fn concurrent_appends_all_reach_disk() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        let store = std::sync::Arc::new(QueueStore::open(paths.clone()));

        let writers: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for n in 0..10 {
                        store.append(queued(&format!("https://youtu.be/{t}-{n}")));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let reopened = QueueStore::open(paths);
        assert_eq!(reopened.list().len(), 80);
        assert_eq!(reopened.list(), store.list());
        assert!(!dir.path().join("download_queue.json.tmp").exists());
    }

    #[test]
    fn merge_skips_known_urls_and_batch_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = QueueStore::open(paths_in(&dir));
        store.append(queued("https://youtu.be/a"));

        let added = store.merge(vec![
            queued("https://youtu.be/a"),
            queued("https://youtu.be/b"),
            queued("https://youtu.be/b"),
        ]);
        assert_eq!(added.len(), 1);
        let urls: Vec<String> = store.list().into_iter().map(|i| i.url).collect();
        assert_eq!(urls, vec!["https://youtu.be/a", "https://youtu.be/b"]);
    }
}
