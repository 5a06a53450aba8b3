//! Registry of active upload tasks.
//!
//! Tasks are keyed by the canonical fingerprint of their target object, so
//! a client can resume an upload knowing only what it is uploading. The
//! in-memory map is a cache over the snapshots in the meta directory.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};
use spacebox_cas::fingerprint::size_class;
use spacebox_cas::{ContentStore, Fingerprint, FingerprintError};
use spacebox_config::{log_sweep_debug, log_sweep_info, log_sweep_warn, MultipartConfig};

use crate::error::{MultipartError, Result};
use crate::task::{CompletedUpload, UploadParams, UploadTask, META_EXT};

/// Result of [`UploadTaskManager::generate`].
#[derive(Debug, Clone)]
pub enum Generated {
    /// A new task was created.
    Created(Arc<UploadTask>),
    /// A task for the same content is already active.
    Conflict(Arc<UploadTask>),
    /// The content is already stored; no task exists.
    AlreadyStored(Fingerprint),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    /// Idle tasks kept because parts are in flight or a caller still
    /// holds the task.
    pub busy: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub removed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub sweep: SweepReport,
    /// Present when the daily GC ran.
    pub gc: Option<GcReport>,
}

/// Snapshot older than the configured lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredTask {
    pub upload_id: String,
    pub meta_path: PathBuf,
    pub modified: DateTime<Utc>,
}

/// Owns every [`UploadTask`].
pub struct UploadTaskManager {
    store: Arc<ContentStore>,
    bucket: String,
    meta_dir: PathBuf,
    config: MultipartConfig,
    tasks: Mutex<HashMap<String, Arc<UploadTask>>>,
    last_gc_day: Mutex<Option<NaiveDate>>,
}

impl std::fmt::Debug for UploadTaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTaskManager")
            .field("bucket", &self.bucket)
            .field("meta_dir", &self.meta_dir)
            .field("active", &self.active_count())
            .finish()
    }
}

impl UploadTaskManager {
    pub fn new(
        store: Arc<ContentStore>,
        bucket: impl Into<String>,
        meta_dir: impl Into<PathBuf>,
        config: MultipartConfig,
    ) -> Result<Self> {
        let meta_dir = meta_dir.into();
        fs::create_dir_all(&meta_dir)?;
        Ok(Self {
            store,
            bucket: bucket.into(),
            meta_dir,
            config,
            tasks: Mutex::new(HashMap::new()),
            last_gc_day: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    pub fn config(&self) -> &MultipartConfig {
        &self.config
    }

    /// Tasks currently held in memory.
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn meta_path(&self, upload_id: &str) -> PathBuf {
        self.meta_dir.join(format!("{}.{}", upload_id, META_EXT))
    }

    /// Start an upload, or report why none is needed.
    pub fn generate(&self, params: UploadParams) -> Result<Generated> {
        if params.size == 0 {
            return Err(MultipartError::InvalidSize(0));
        }
        let expected = size_class(params.size);
        if params.fingerprint.size_class() != expected {
            return Err(FingerprintError::SizeClassMismatch {
                declared: params.fingerprint.size_class(),
                expected,
                size: params.size,
            }
            .into());
        }

        let upload_id = params.fingerprint.to_hex();
        if self.store.exists(&self.bucket, &upload_id)? {
            return Ok(Generated::AlreadyStored(params.fingerprint));
        }

        let mut tasks = self.lock();
        if let Some(task) = tasks.get(&upload_id) {
            task.touch();
            return Ok(Generated::Conflict(task.clone()));
        }
        if let Some(task) = self.load_snapshot(&upload_id)? {
            tasks.insert(upload_id, task.clone());
            return Ok(Generated::Conflict(task));
        }

        let placement =
            self.store
                .placer()
                .choose_placement(&self.bucket, &upload_id, params.size)?;
        let staging = self.store.placer().staging_dir(placement.disk_id)?;
        let task = Arc::new(UploadTask::create(
            upload_id.clone(),
            placement.disk_id,
            staging,
            &self.meta_dir,
            params,
        )?);
        tasks.insert(upload_id, task.clone());
        Ok(Generated::Created(task))
    }

    /// Find a task in memory or reload it from its snapshot.
    pub fn get_or_load(&self, upload_id: &str) -> Result<Arc<UploadTask>> {
        let mut tasks = self.lock();
        if let Some(task) = tasks.get(upload_id) {
            task.touch();
            return Ok(task.clone());
        }
        match self.load_snapshot(upload_id)? {
            Some(task) => {
                tasks.insert(upload_id.to_string(), task.clone());
                Ok(task)
            }
            None => Err(MultipartError::TaskNotFound(upload_id.to_string())),
        }
    }

    /// Finalize a task into the store and forget it.
    pub fn complete(&self, upload_id: &str) -> Result<CompletedUpload> {
        let task = self.get_or_load(upload_id)?;
        let completed = task.complete(&self.store, &self.bucket)?;
        self.remove(upload_id);
        Ok(completed)
    }

    /// Delete a task and its files. Returns whether anything existed.
    pub fn delete(&self, upload_id: &str) -> Result<bool> {
        let mut tasks = self.lock();
        if let Some(task) = tasks.get(upload_id) {
            if task.is_busy() {
                return Err(MultipartError::Busy(upload_id.to_string()));
            }
            let task = task.clone();
            tasks.remove(upload_id);
            drop(tasks);
            task.remove_files()?;
            log_sweep_debug!("upload task deleted", upload_id = upload_id);
            return Ok(true);
        }
        drop(tasks);

        if !is_valid_upload_id(upload_id) {
            return Ok(false);
        }
        let meta_path = self.meta_path(upload_id);
        if !meta_path.exists() {
            return Ok(false);
        }
        // Disk-only task: the snapshot locates the staging files.
        match UploadTask::read_snapshot(&meta_path) {
            Ok(task) => task.remove_files()?,
            Err(e) => {
                log_sweep_warn!(
                    "unreadable snapshot, removing it alone",
                    upload_id = upload_id,
                    error = tracing::field::display(&e)
                );
                remove_if_exists(&meta_path)?;
            }
        }
        log_sweep_debug!("upload task deleted", upload_id = upload_id);
        Ok(true)
    }

    /// Forget an in-memory task without touching its files.
    pub fn remove(&self, upload_id: &str) -> Option<Arc<UploadTask>> {
        self.lock().remove(upload_id)
    }

    /// Evict in-memory tasks idle for at least the idle timeout. Their
    /// snapshots stay on disk so the upload can still be resumed.
    ///
    /// A task handed out by [`get_or_load`](Self::get_or_load) is never
    /// evicted while the caller holds it, so a reload cannot produce a
    /// second instance with its own lock.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> SweepReport {
        let timeout = chrono::Duration::seconds(self.config.idle_timeout_secs as i64);
        let mut report = SweepReport::default();
        self.lock().retain(|id, task| {
            if now - task.last_active() < timeout {
                return true;
            }
            if Arc::strong_count(task) > 1 || task.is_busy() {
                report.busy += 1;
                return true;
            }
            log_sweep_debug!("idle upload task evicted", upload_id = id.as_str());
            report.evicted += 1;
            false
        });
        report
    }

    /// Snapshots whose modification time is older than the lifecycle.
    pub fn expired_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredTask>> {
        let lifecycle = chrono::Duration::seconds(self.config.lifecycle_secs as i64);
        let mut expired = Vec::new();
        for entry in fs::read_dir(&self.meta_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            let Some(upload_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let modified: DateTime<Utc> = entry.metadata()?.modified()?.into();
            if now - modified > lifecycle {
                expired.push(ExpiredTask {
                    upload_id: upload_id.to_string(),
                    meta_path: path.clone(),
                    modified,
                });
            }
        }
        expired.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
        Ok(expired)
    }

    /// Delete every expired task.
    pub fn gc_expired(&self, now: DateTime<Utc>) -> Result<GcReport> {
        let mut report = GcReport::default();
        for task in self.expired_tasks(now)? {
            match self.delete(&task.upload_id) {
                Ok(_) => report.removed.push(task.upload_id),
                Err(e) => report.failed.push((task.upload_id, e.to_string())),
            }
        }
        if !report.removed.is_empty() || !report.failed.is_empty() {
            log_sweep_info!(
                "expired upload tasks collected",
                removed = report.removed.len(),
                failed = report.failed.len()
            );
        }
        Ok(report)
    }

    /// Idle sweep, plus the snapshot GC once per calendar day (UTC).
    pub fn run_maintenance(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let sweep = self.sweep_idle(now);

        let today = now.date_naive();
        let mut last_gc_day = self
            .last_gc_day
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let gc = if *last_gc_day != Some(today) {
            *last_gc_day = Some(today);
            match self.gc_expired(now) {
                Ok(report) => Some(report),
                Err(e) => {
                    log_sweep_warn!(
                        "snapshot gc failed",
                        error = tracing::field::display(&e)
                    );
                    None
                }
            }
        } else {
            None
        };

        MaintenanceReport { sweep, gc }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<UploadTask>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload a snapshot. A corrupt snapshot, or one whose staging data
    /// is gone, is removed and treated as absent.
    fn load_snapshot(&self, upload_id: &str) -> Result<Option<Arc<UploadTask>>> {
        if !is_valid_upload_id(upload_id) {
            return Ok(None);
        }
        let meta_path = self.meta_path(upload_id);
        if !meta_path.exists() {
            return Ok(None);
        }
        let task = match UploadTask::read_snapshot(&meta_path) {
            Ok(task) => task,
            Err(MultipartError::Snapshot(e)) => {
                log_sweep_warn!(
                    "corrupt snapshot removed",
                    upload_id = upload_id,
                    error = tracing::field::display(&e)
                );
                remove_if_exists(&meta_path)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !task.data_path().is_file() {
            log_sweep_warn!(
                "snapshot without staging data removed",
                upload_id = upload_id,
                data_path = tracing::field::display(task.data_path().display())
            );
            task.remove_files()?;
            return Ok(None);
        }
        log_sweep_debug!("upload task reloaded", upload_id = upload_id);
        Ok(Some(Arc::new(task)))
    }
}

/// Upload ids are lowercase hex fingerprints; anything else cannot name a
/// snapshot.
fn is_valid_upload_id(upload_id: &str) -> bool {
    !upload_id.is_empty()
        && upload_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_id_validation() {
        assert!(is_valid_upload_id("16abcdef0123456789"));
        assert!(!is_valid_upload_id(""));
        assert!(!is_valid_upload_id("../etc/passwd"));
        assert!(!is_valid_upload_id("16ABCDEF"));
    }
}
