//! Progress tracking for long-running batch jobs.
//!
//! Batch operations above a size threshold return a short task id right
//! away and run on a worker thread; clients poll the id for progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use spacebox_config::{log_notify_debug, log_notify_warn, TaskConfig};
use uuid::Uuid;

use crate::{Result, ServiceError};

const TASK_ID_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncStatus {
    Init,
    Processing,
    Success,
    Failed,
}

impl AsyncStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AsyncStatus::Success | AsyncStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncTaskInfo {
    pub task_id: String,
    pub task_status: AsyncStatus,
    pub total: u64,
    pub processed: u64,
}

#[derive(Debug)]
struct Entry {
    info: AsyncTaskInfo,
    /// Set when the job reaches a terminal state.
    finished: Option<Instant>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    tasks: Mutex<HashMap<String, Entry>>,
    running: AtomicUsize,
}

impl TrackerInner {
    fn update(&self, id: &str, f: impl FnOnce(&mut AsyncTaskInfo)) {
        if let Some(entry) = self.tasks.lock().unwrap().get_mut(id) {
            f(&mut entry.info);
            if entry.info.task_status.is_terminal() && entry.finished.is_none() {
                entry.finished = Some(Instant::now());
            }
        }
    }
}

/// Registry of batch jobs and their progress.
#[derive(Debug, Clone)]
pub struct AsyncTaskTracker {
    inner: Arc<TrackerInner>,
    threshold: usize,
    max_concurrent: usize,
    result_ttl: Duration,
}

/// Progress reporter for one job.
#[derive(Debug, Clone)]
pub struct AsyncTaskHandle {
    id: String,
    inner: Arc<TrackerInner>,
}

impl AsyncTaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn processing(&self) {
        self.inner
            .update(&self.id, |t| t.task_status = AsyncStatus::Processing);
    }

    pub fn advance(&self, n: u64) {
        self.inner.update(&self.id, |t| {
            t.processed = (t.processed + n).min(t.total);
        });
    }

    pub fn succeed(&self) {
        self.inner.update(&self.id, |t| {
            t.task_status = AsyncStatus::Success;
            t.processed = t.total;
        });
    }

    pub fn fail(&self) {
        self.inner
            .update(&self.id, |t| t.task_status = AsyncStatus::Failed);
    }
}

/// Decrements the running count when a worker exits, panics included.
struct RunningSlot(Arc<TrackerInner>);

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncTaskTracker {
    pub fn new(config: &TaskConfig) -> Self {
        Self {
            inner: Arc::default(),
            threshold: config.async_threshold,
            max_concurrent: config.max_concurrent.max(1),
            result_ttl: config.result_ttl(),
        }
    }

    /// Whether a batch of `count` items should run in the background.
    pub fn should_run_async(&self, count: usize) -> bool {
        count > self.threshold
    }

    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register a job in the `init` state. Finished jobs older than the
    /// result TTL are dropped first.
    pub fn create(&self, total: u64) -> AsyncTaskHandle {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let before = tasks.len();
        let ttl = self.result_ttl;
        tasks.retain(|_, entry| entry.finished.map_or(true, |at| at.elapsed() < ttl));
        if tasks.len() < before {
            log_notify_debug!("expired async results pruned", count = before - tasks.len());
        }
        let id = loop {
            let candidate = Uuid::new_v4().simple().to_string()[..TASK_ID_LEN].to_string();
            if !tasks.contains_key(&candidate) {
                break candidate;
            }
        };
        tasks.insert(
            id.clone(),
            Entry {
                info: AsyncTaskInfo {
                    task_id: id.clone(),
                    task_status: AsyncStatus::Init,
                    total,
                    processed: 0,
                },
                finished: None,
            },
        );
        AsyncTaskHandle {
            id,
            inner: self.inner.clone(),
        }
    }

    /// Run `job` on a worker thread and return its id.
    ///
    /// The job's result decides the terminal state.
    pub fn spawn<F>(&self, total: u64, job: F) -> Result<String>
    where
        F: FnOnce(&AsyncTaskHandle) -> Result<()> + Send + 'static,
    {
        let running = self.inner.running.fetch_add(1, Ordering::SeqCst);
        if running >= self.max_concurrent {
            self.inner.running.fetch_sub(1, Ordering::SeqCst);
            return Err(ServiceError::TooManyJobs {
                limit: self.max_concurrent,
            });
        }
        let slot = RunningSlot(self.inner.clone());

        let handle = self.create(total);
        let id = handle.id.clone();
        let worker = handle.clone();
        let spawned = thread::Builder::new()
            .name(format!("spacebox-task-{}", id))
            .spawn(move || {
                let _slot = slot;
                worker.processing();
                match job(&worker) {
                    Ok(()) => worker.succeed(),
                    Err(e) => {
                        log_notify_warn!(
                            "async task failed",
                            task_id = worker.id(),
                            error = tracing::field::display(&e)
                        );
                        worker.fail();
                    }
                }
            });
        if let Err(e) = spawned {
            self.inner.tasks.lock().unwrap().remove(&id);
            return Err(e.into());
        }
        log_notify_debug!("async task started", task_id = id.as_str(), total = total);
        Ok(id)
    }

    /// Current progress. Finished jobs are forgotten once reported.
    pub fn poll(&self, id: &str) -> Result<AsyncTaskInfo> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        let info = tasks
            .get(id)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| ServiceError::AsyncTaskNotFound(id.to_string()))?;
        if info.task_status.is_terminal() {
            tasks.remove(id);
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn tracker(threshold: usize, max_concurrent: usize) -> AsyncTaskTracker {
        AsyncTaskTracker::new(&TaskConfig {
            async_threshold: threshold,
            max_concurrent,
            ..TaskConfig::default()
        })
    }

    fn wait_terminal(tracker: &AsyncTaskTracker, id: &str) -> AsyncTaskInfo {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let tasks = tracker.inner.tasks.lock().unwrap();
            let info = tasks.get(id).map(|e| e.info.clone()).unwrap();
            drop(tasks);
            if info.task_status.is_terminal() || Instant::now() > deadline {
                return info;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_handle_lifecycle() {
        let tracker = tracker(10, 2);
        let handle = tracker.create(3);
        assert_eq!(handle.id().len(), TASK_ID_LEN);
        assert_eq!(tracker.poll(handle.id()).unwrap().task_status, AsyncStatus::Init);

        handle.processing();
        handle.advance(2);
        let info = tracker.poll(handle.id()).unwrap();
        assert_eq!(info.task_status, AsyncStatus::Processing);
        assert_eq!(info.processed, 2);

        handle.advance(5);
        assert_eq!(tracker.poll(handle.id()).unwrap().processed, 3);

        handle.succeed();
        assert_eq!(tracker.poll(handle.id()).unwrap().task_status, AsyncStatus::Success);
        // Reported once, then gone
        assert!(matches!(
            tracker.poll(handle.id()),
            Err(ServiceError::AsyncTaskNotFound(_))
        ));
    }

    #[test]
    fn test_unpolled_results_expire() {
        let tracker = AsyncTaskTracker::new(&TaskConfig {
            result_ttl_secs: 0,
            ..TaskConfig::default()
        });
        let done = tracker.create(1);
        done.succeed();
        let pending = tracker.create(1);

        // Creating a job prunes finished results past the TTL
        let _next = tracker.create(1);
        assert!(matches!(
            tracker.poll(done.id()),
            Err(ServiceError::AsyncTaskNotFound(_))
        ));
        assert_eq!(
            tracker.poll(pending.id()).unwrap().task_status,
            AsyncStatus::Init
        );
    }

    #[test]
    fn test_finished_results_kept_within_ttl() {
        let tracker = tracker(10, 2);
        let done = tracker.create(1);
        done.fail();
        tracker.create(1);
        assert_eq!(tracker.poll(done.id()).unwrap().task_status, AsyncStatus::Failed);
    }

    #[test]
    fn test_should_run_async() {
        let tracker = tracker(2, 1);
        assert!(!tracker.should_run_async(2));
        assert!(tracker.should_run_async(3));
    }

    #[test]
    fn test_spawn_reports_job_result() {
        let tracker = tracker(0, 2);
        let ok = tracker
            .spawn(4, |h| {
                h.advance(4);
                Ok(())
            })
            .unwrap();
        let failed = tracker
            .spawn(1, |_| Err(ServiceError::Param("boom".into())))
            .unwrap();

        assert_eq!(wait_terminal(&tracker, &ok).task_status, AsyncStatus::Success);
        assert_eq!(wait_terminal(&tracker, &failed).task_status, AsyncStatus::Failed);
    }

    #[test]
    fn test_spawn_limits_concurrency() {
        let tracker = tracker(0, 1);
        let (release_tx, release_rx) = bounded::<()>(0);
        let id = tracker
            .spawn(1, move |_| {
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();

        assert!(matches!(
            tracker.spawn(1, |_| Ok(())),
            Err(ServiceError::TooManyJobs { limit: 1 })
        ));

        release_tx.send(()).unwrap();
        assert_eq!(wait_terminal(&tracker, &id).task_status, AsyncStatus::Success);

        let deadline = Instant::now() + Duration::from_secs(5);
        while tracker.running() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(tracker.spawn(1, |_| Ok(())).is_ok());
    }
}
