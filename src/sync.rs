//! Cross-process hand-off: the API process posts items into a mailbox file
//! and the manager process drains it into its queue every two seconds.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::{QueueEvent, QueueItem};
use crate::store::{read_json, read_json_or_default, write_json_atomic, QueueStore};
use crate::worker::QueueWorker;

pub const SYNC_INTERVAL: Duration = Duration::from_secs(2);

/// The mailbox file. Same shape as the queue snapshot.
#[derive(Debug, Clone)]
pub struct Mailbox {
    path: PathBuf,
    // Serializes read-modify-write cycles within one process.
    write_lock: Arc<Mutex<()>>,
}

impl Mailbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Mailbox { path: path.into(), write_lock: Arc::new(Mutex::new(())) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one item. A malformed mailbox is replaced rather than
    /// blocking new submissions.
    pub fn post(&self, item: &QueueItem) -> Result<()> {
        let _guard = self.lock();
        let mut pending = self.pending();
        pending.push(item.clone());
        write_json_atomic(&self.path, &pending)
    }

    pub fn read(&self) -> Result<Vec<QueueItem>> {
        let items: Option<Vec<QueueItem>> = read_json(&self.path)?;
        Ok(items.unwrap_or_default())
    }

    /// Items waiting to be drained; unreadable mailboxes count as empty.
    pub fn pending(&self) -> Vec<QueueItem> {
        read_json_or_default(&self.path)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Empties the mailbox. Callers hold the lock.
    fn write_empty(&self) -> Result<()> {
        write_json_atomic(&self.path, &Vec::<QueueItem>::new())
    }
}

pub struct Synchronizer {
    store: Arc<QueueStore>,
    mailbox: Mailbox,
    auto_start: Option<QueueWorker>,
}

impl Synchronizer {
    pub fn new(store: Arc<QueueStore>, mailbox: Mailbox) -> Self {
        Synchronizer { store, mailbox, auto_start: None }
    }

    /// Starts the worker whenever a merge brings in new items.
    pub fn with_auto_start(mut self, worker: QueueWorker) -> Self {
        self.auto_start = Some(worker);
        self
    }

    /// One reconciliation pass. Returns how many items were merged.
    ///
    /// Read, merge and truncate run under the mailbox lock, so posts made
    /// through this process's [`Mailbox`] are never lost. A post from another
    /// process that lands between the read and the truncate is dropped; the
    /// file carries no cross-process lock.
    pub fn merge_once(&self) -> usize {
        let guard = self.mailbox.lock();
        let incoming = match self.mailbox.read() {
            Ok(items) => items,
            Err(e) => {
                tracing::debug!("Skipping mailbox this tick: {:#}", e);
                return 0;
            }
        };
        if incoming.is_empty() {
            return 0;
        }

        let added = self.store.merge(incoming);
        if added.is_empty() {
            return 0;
        }

        if let Err(e) = self.mailbox.write_empty() {
            tracing::warn!("Failed to truncate mailbox {}: {:#}", self.mailbox.path().display(), e);
        }
        drop(guard);
        tracing::info!("Synced {} item(s) from {}", added.len(), self.mailbox.path().display());
        for item in &added {
            self.store.emit(QueueEvent::Enqueued { item: item.clone() });
        }
        self.store.emit(QueueEvent::Synced { count: added.len() });

        if let Some(worker) = &self.auto_start {
            if worker.start().is_ok() {
                tracing::info!("Auto-download started for synced items");
            }
        }
        added.len()
    }

    /// Runs `merge_once` every [`SYNC_INTERVAL`] until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + SYNC_INTERVAL, SYNC_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.merge_once();
                    }
                }
            }
            tracing::debug!("Synchronizer stopped");
        })
    }
}
