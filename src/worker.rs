//! The single sequential download loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::FetchAgent;
use crate::error::{AgentError, WorkerError};
use crate::models::{
    FailureReason, FinishedReport, HistoryEntry, HistoryStatus, ItemStatus, QueueEvent, QueueItem,
};
use crate::progress::{ProgressParser, ANOMALY_THRESHOLD};
use crate::store::QueueStore;

/// Output lines kept for the most recently finished item.
pub const DIAGNOSTIC_LINES: usize = 50;

enum DrainEnd {
    Idle,
    Paused,
}

struct WorkerInner {
    store: Arc<QueueStore>,
    agent: Arc<dyn FetchAgent>,
    running: AtomicBool,
    pause_requested: AtomicBool,
    progress: Mutex<f64>,
    current: Mutex<Option<CancellationToken>>,
    last_report: Mutex<Option<FinishedReport>>,
}

#[derive(Clone)]
pub struct QueueWorker {
    inner: Arc<WorkerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QueueWorker {
    pub fn new(store: Arc<QueueStore>, agent: Arc<dyn FetchAgent>) -> Self {
        QueueWorker {
            inner: Arc::new(WorkerInner {
                store,
                agent,
                running: AtomicBool::new(false),
                pause_requested: AtomicBool::new(false),
                progress: Mutex::new(0.0),
                current: Mutex::new(None),
                last_report: Mutex::new(None),
            }),
        }
    }

    /// Spawns the loop on its own task. It runs until no `Queued` item is
    /// left or a pause is observed between items.
    pub fn start(&self) -> Result<JoinHandle<()>, WorkerError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WorkerError::AlreadyRunning);
        }
        self.inner.pause_requested.store(false, Ordering::SeqCst);

        let worker = self.clone();
        Ok(tokio::spawn(async move { worker.run_loop().await }))
    }

    /// Stops the loop before it starts the next item. The in-flight item is
    /// left to finish. Returns `false` when the worker was not running.
    pub fn pause(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.inner.pause_requested.store(true, Ordering::SeqCst);
        tracing::info!("Pause requested; the current item will finish first");
        true
    }

    /// Forcibly terminates the in-flight download, which then ends `Failed`.
    pub fn cancel_current(&self) -> bool {
        match lock(&self.inner.current).as_ref() {
            Some(token) => {
                tracing::info!("Cancelling the current download");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> f64 {
        *lock(&self.inner.progress)
    }

    pub fn last_report(&self) -> Option<FinishedReport> {
        lock(&self.inner.last_report).clone()
    }

    async fn run_loop(&self) {
        tracing::info!("Queue worker started");
        loop {
            let end = self.drain().await;
            self.inner.running.store(false, Ordering::SeqCst);
            match end {
                DrainEnd::Paused => {
                    tracing::info!("Queue paused");
                    self.inner.store.emit(QueueEvent::Paused);
                    return;
                }
                DrainEnd::Idle => {
                    // An enqueue may have raced the final empty check.
                    if self.inner.store.has_queued()
                        && self
                            .inner
                            .running
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                    {
                        continue;
                    }
                    tracing::info!("Queue completed; worker idle");
                    self.inner.store.emit(QueueEvent::Idle);
                    return;
                }
            }
        }
    }

    async fn drain(&self) -> DrainEnd {
        loop {
            if self.inner.pause_requested.load(Ordering::SeqCst) {
                return DrainEnd::Paused;
            }
            let Some(item) = self.inner.store.claim_next() else {
                return DrainEnd::Idle;
            };
            self.process(item).await;
        }
    }

    fn set_progress(&self, percent: f64) {
        *lock(&self.inner.progress) = percent;
    }

    async fn process(&self, item: QueueItem) {
        tracing::info!("Starting download: {} ({})", item.title, item.url);
        self.set_progress(0.0);
        self.inner.store.emit(QueueEvent::Started { id: item.id, title: item.title.clone() });

        let mut parser = ProgressParser::new();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_LINES);
        let mut size: Option<String> = None;

        let result: Result<(), FailureReason> = match self.inner.agent.launch(&item).await {
            Ok(mut run) => {
                *lock(&self.inner.current) = Some(run.cancel_token());
                let mut aborted = false;

                while let Some(line) = run.next_line().await {
                    tracing::debug!(target: "ytq::agent", "{}", line);
                    let report = parser.feed(&line);

                    if let Some(percent) = report.percent {
                        self.set_progress(percent);
                        self.inner.store.emit(QueueEvent::Progress { id: item.id, percent });
                    }
                    if report.size.is_some() {
                        size = report.size;
                    }
                    if report.anomaly {
                        tracing::warn!(
                            "Access denied by remote source (attempt {}/{})",
                            parser.anomalies(),
                            ANOMALY_THRESHOLD
                        );
                    } else if report.failure_marker {
                        tracing::warn!("Agent reported: {}", line);
                    }

                    if tail.len() == DIAGNOSTIC_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);

                    if report.abort_recommended {
                        tracing::warn!("Too many access-denied responses; aborting {}", item.url);
                        run.cancel();
                        aborted = true;
                    }
                }

                lock(&self.inner.current).take();
                match run.finish().await {
                    Err(AgentError::Cancelled) if aborted => {
                        Err(FailureReason::AnomalyAbort { hits: parser.anomalies() })
                    }
                    other => other.map_err(FailureReason::from),
                }
            }
            Err(e) => {
                tracing::error!("Could not launch fetch agent for {}: {}", item.url, e);
                Err(FailureReason::from(e))
            }
        };

        let (status, history_status, failure) = match result {
            Ok(()) => {
                self.set_progress(100.0);
                tracing::info!("Completed: {}", item.title);
                (ItemStatus::Completed, HistoryStatus::Success, None)
            }
            Err(reason) => {
                tracing::warn!("Failed: {} ({:?}); {}", item.title, reason, reason.hint());
                (ItemStatus::Failed, HistoryStatus::Failed, Some(reason))
            }
        };

        let entry = HistoryEntry::for_item(&item, history_status, size);
        let finished = self
            .inner
            .store
            .finish(item.id, status, entry)
            .unwrap_or_else(|| QueueItem { status, ..item.clone() });

        *lock(&self.inner.last_report) = Some(FinishedReport {
            item: finished,
            failure: failure.clone(),
            output_tail: tail.into_iter().collect(),
        });
        self.inner.store.emit(QueueEvent::Finished { id: item.id, title: item.title, status, failure });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedAgent;
    use crate::store::tests::{paths_in, queued};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{broadcast, Notify};

    fn setup(agent: ScriptedAgent, urls: &[&str]) -> (TempDir, Arc<QueueStore>, QueueWorker) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(QueueStore::open(paths_in(&dir)));
        for url in urls {
            store.append(queued(url));
        }
        let worker = QueueWorker::new(store.clone(), Arc::new(agent));
        (dir, store, worker)
    }

    async fn wait_for_started(rx: &mut broadcast::Receiver<QueueEvent>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(QueueEvent::Started { .. }) = rx.recv().await {
                    return;
                }
            }
        })
        .await
        .expect("worker never started an item");
    }

    #[tokio::test]
    async fn clean_exit_completes_and_records_success() {
        let agent = ScriptedAgent::exiting(0, &["[download]  50.0% of 10.00MiB", "[download] 100% of 10.00MiB"]);
        let (_dir, store, worker) = setup(agent, &["https://youtu.be/a"]);
        let mut events = store.subscribe();

        worker.start().unwrap().await.unwrap();

        let items = store.list();
        assert_eq!(items[0].status, ItemStatus::Completed);
        let history = store.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HistoryStatus::Success);
        assert_eq!(history[0].size, "10.00MiB");
        assert_eq!(worker.progress(), 100.0);
        assert!(!worker.is_running());

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                QueueEvent::Started { .. } => statuses.push(ItemStatus::Downloading),
                QueueEvent::Finished { status, .. } => statuses.push(status),
                _ => {}
            }
        }
        assert_eq!(statuses, vec![ItemStatus::Downloading, ItemStatus::Completed]);
    }

    #[tokio::test]
    async fn non_zero_exit_fails_and_keeps_output_tail() {
        let agent = ScriptedAgent::exiting(1, &["[youtube] abc123: Downloading webpage", "ERROR: Video unavailable"]);
        let (_dir, store, worker) = setup(agent, &["https://youtu.be/a"]);

        worker.start().unwrap().await.unwrap();

        assert_eq!(store.list()[0].status, ItemStatus::Failed);
        let history = store.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HistoryStatus::Failed);
        assert_eq!(history[0].size, "Unknown");

        let report = worker.last_report().unwrap();
        assert_eq!(report.failure, Some(FailureReason::ExitNonZero { code: Some(1) }));
        assert_eq!(report.output_tail.last().map(String::as_str), Some("ERROR: Video unavailable"));
    }

    #[tokio::test]
    async fn repeated_access_denial_aborts_with_distinct_reason() {
        let mut lines = vec!["ERROR: HTTP Error 403: Forbidden"; 5];
        lines.push("[download]  50.0% of 10.00MiB");
        let agent = ScriptedAgent::exiting(0, &lines);
        let (_dir, store, worker) = setup(agent, &["https://youtu.be/a"]);

        worker.start().unwrap().await.unwrap();

        assert_eq!(store.list()[0].status, ItemStatus::Failed);
        assert_eq!(store.history().len(), 1);
        let report = worker.last_report().unwrap();
        assert_eq!(report.failure, Some(FailureReason::AnomalyAbort { hits: 5 }));
        assert_eq!(report.output_tail.len(), 5);
        assert!(worker.progress() < 50.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_agent_is_killed_after_repeated_access_denial() {
        let dir = TempDir::new().unwrap();
        let denied = "echo 'ERROR: unable to download video data: HTTP Error 403: Forbidden' >&2\n".repeat(5);
        let agent = crate::agent::testing::script_agent(dir.path(), &format!("{denied}exec sleep 30"));
        let store = Arc::new(QueueStore::open(paths_in(&dir)));
        store.append(queued("https://youtu.be/a"));
        let worker = QueueWorker::new(store.clone(), Arc::new(agent));

        tokio::time::timeout(Duration::from_secs(5), worker.start().unwrap())
            .await
            .expect("agent was not terminated")
            .unwrap();

        assert_eq!(store.list()[0].status, ItemStatus::Failed);
        let report = worker.last_report().unwrap();
        assert_eq!(report.failure, Some(FailureReason::AnomalyAbort { hits: 5 }));
        assert_eq!(store.history()[0].status, HistoryStatus::Failed);
    }

    #[tokio::test]
    async fn launch_failure_is_recorded_and_loop_continues() {
        let agent = ScriptedAgent {
            launch_error: Some(AgentError::AgentUnavailable("yt-dlp".to_string())),
            ..Default::default()
        };
        let (_dir, store, worker) = setup(agent, &["https://youtu.be/a", "https://youtu.be/b"]);

        worker.start().unwrap().await.unwrap();

        assert!(store.list().iter().all(|i| i.status == ItemStatus::Failed));
        assert_eq!(store.history().len(), 2);
        assert_eq!(worker.last_report().unwrap().failure, Some(FailureReason::AgentUnavailable));
    }

    #[tokio::test]
    async fn items_are_processed_in_fifo_order() {
        let agent = ScriptedAgent::exiting(0, &[]);
        let urls = ["https://youtu.be/1", "https://youtu.be/2", "https://youtu.be/3"];
        let (_dir, store, worker) = setup(agent.clone(), &urls);

        worker.start().unwrap().await.unwrap();

        assert_eq!(agent.launched(), urls.to_vec());
        assert!(store.list().iter().all(|i| i.status == ItemStatus::Completed));
    }

    #[tokio::test]
    async fn pause_lets_current_item_finish_and_stops_the_next() {
        let gate = Arc::new(Notify::new());
        let agent = ScriptedAgent { gate: Some(gate.clone()), ..ScriptedAgent::exiting(0, &["[download] 100%"]) };
        let (_dir, store, worker) = setup(agent, &["https://youtu.be/a", "https://youtu.be/b"]);
        let mut events = store.subscribe();

        let handle = worker.start().unwrap();
        wait_for_started(&mut events).await;
        assert_eq!(worker.start().err(), Some(WorkerError::AlreadyRunning));
        assert!(worker.pause());
        gate.notify_one();
        handle.await.unwrap();

        let statuses: Vec<ItemStatus> = store.list().iter().map(|i| i.status).collect();
        assert_eq!(statuses, vec![ItemStatus::Completed, ItemStatus::Queued]);
        assert!(!worker.is_running());
        assert!(!worker.pause());

        gate.notify_one();
        worker.start().unwrap().await.unwrap();
        assert_eq!(store.list()[1].status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn explicit_cancel_fails_the_current_item() {
        let gate = Arc::new(Notify::new());
        let agent = ScriptedAgent { gate: Some(gate.clone()), ..ScriptedAgent::exiting(0, &["[download] 10%"]) };
        let (_dir, store, worker) = setup(agent, &["https://youtu.be/a"]);
        let mut events = store.subscribe();

        let handle = worker.start().unwrap();
        wait_for_started(&mut events).await;
        // The token is registered right after launch returns.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !worker.cancel_current() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        gate.notify_one();
        handle.await.unwrap();

        assert_eq!(store.list()[0].status, ItemStatus::Failed);
        assert_eq!(worker.last_report().unwrap().failure, Some(FailureReason::Cancelled));
        assert!(!worker.cancel_current());
    }
}
