//! Resumable upload task.
//!
//! Each task owns three files:
//!
//! ```text
//! {disk}/multipart/{id}.data        # sparse object body, preallocated to size
//! {disk}/multipart/{id}.hash        # window k digest at offset k * 16
//! {data_root}/multipart-meta/{id}.mp  # JSON snapshot
//! ```
//!
//! Body bytes and window digests are fsynced before the snapshot that
//! records them, so a reloaded snapshot never claims data that is not on
//! disk. In-flight ranges live in memory only.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spacebox_cas::fingerprint::{window_bounds, window_count, Digest, HashingWriter, DIGEST_LEN};
use spacebox_cas::{ContentStore, DiskId, Fingerprint, WindowHasher, WINDOW_SIZE};
use spacebox_config::{log_upload_debug, log_upload_info, log_upload_warn};

use crate::error::{MultipartError, Result};
use crate::part::{self, Coverage, Part};

pub const DATA_EXT: &str = "data";
pub const HASH_EXT: &str = "hash";
pub const META_EXT: &str = "mp";

/// Client-declared parameters of an upload, persisted with the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadParams {
    pub file_name: String,
    pub size: u64,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    /// Client timestamps, unix millis.
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub modify_time: i64,
}

impl UploadParams {
    pub fn new(file_name: impl Into<String>, size: u64, fingerprint: Fingerprint) -> Self {
        Self {
            file_name: file_name.into(),
            size,
            fingerprint,
            user_id: 0,
            folder_id: None,
            folder_path: None,
            mime: None,
            create_time: 0,
            modify_time: 0,
        }
    }
}

/// Result of a part upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartOutcome {
    /// Bytes written and recorded; `hashed` lists windows completed by it.
    Stored { part: Part, hashed: Vec<u64> },
    /// The exact range was already uploaded; nothing was written.
    AlreadyUploaded,
}

/// Public view of a task, returned on conflicts and part listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub upload_id: String,
    pub params: UploadParams,
    pub uploaded_parts: Vec<Part>,
    pub uploading_parts: Vec<Part>,
}

/// Outcome of a successful [`UploadTask::complete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub upload_id: String,
    pub fingerprint: Fingerprint,
    pub disk_id: DiskId,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskSnapshot {
    upload_id: String,
    disk_id: DiskId,
    staging_dir: PathBuf,
    params: UploadParams,
    window_size: u64,
    uploaded_parts: Vec<Part>,
    #[serde(default)]
    uploading_parts: Vec<Part>,
    #[serde(default)]
    hashed_windows: BTreeSet<u64>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TaskState {
    uploaded: Vec<Part>,
    uploading: Vec<Part>,
    hashed: BTreeSet<u64>,
    completed: bool,
}

/// One resumable upload.
///
/// Part uploads to disjoint ranges run concurrently; the mutex guards only
/// the bookkeeping around the byte copy.
#[derive(Debug)]
pub struct UploadTask {
    upload_id: String,
    disk_id: DiskId,
    staging_dir: PathBuf,
    meta_path: PathBuf,
    params: UploadParams,
    created_at: DateTime<Utc>,
    state: Mutex<TaskState>,
    last_active: AtomicI64,
}

/// Removes an in-flight range on every exit path unless released.
struct InflightGuard<'a> {
    task: &'a UploadTask,
    part: Part,
    armed: bool,
}

impl InflightGuard<'_> {
    fn release(&mut self, state: &mut TaskState) {
        state.uploading.retain(|p| *p != self.part);
        self.armed = false;
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let part = self.part;
            self.task.lock().uploading.retain(|p| *p != part);
        }
    }
}

impl UploadTask {
    /// Create the staging files and the first snapshot.
    pub fn create(
        upload_id: impl Into<String>,
        disk_id: DiskId,
        staging_dir: impl Into<PathBuf>,
        meta_dir: &Path,
        params: UploadParams,
    ) -> Result<Self> {
        if params.size == 0 {
            return Err(MultipartError::InvalidSize(0));
        }
        let upload_id = upload_id.into();
        let staging_dir = staging_dir.into();
        fs::create_dir_all(&staging_dir)?;
        fs::create_dir_all(meta_dir)?;

        let task = Self {
            meta_path: meta_dir.join(format!("{}.{}", upload_id, META_EXT)),
            upload_id,
            disk_id,
            staging_dir,
            params,
            created_at: Utc::now(),
            state: Mutex::new(TaskState::default()),
            last_active: AtomicI64::new(0),
        };
        task.touch();

        File::create(task.data_path())?.set_len(task.params.size)?;
        File::create(task.hash_path())?
            .set_len(window_count(task.params.size) * DIGEST_LEN as u64)?;
        task.persist(&task.lock())?;

        log_upload_info!(
            "upload task created",
            upload_id = task.upload_id.as_str(),
            disk_id = task.disk_id,
            size = task.params.size
        );
        Ok(task)
    }

    /// Reload a task from its snapshot. In-flight ranges are dropped.
    pub fn load(meta_path: &Path) -> Result<Self> {
        let task = Self::read_snapshot(meta_path)?;
        if !task.data_path().is_file() {
            return Err(MultipartError::TaskNotFound(task.upload_id));
        }
        log_upload_debug!("upload task reloaded", upload_id = task.upload_id.as_str());
        Ok(task)
    }

    /// Parse a snapshot without checking that its staging files exist.
    pub(crate) fn read_snapshot(meta_path: &Path) -> Result<Self> {
        let raw = fs::read(meta_path)?;
        let snapshot: TaskSnapshot = serde_json::from_slice(&raw)?;

        let mut hashed = snapshot.hashed_windows;
        if snapshot.window_size != WINDOW_SIZE {
            log_upload_warn!(
                "snapshot window size differs, rehashing on completion",
                upload_id = snapshot.upload_id.as_str(),
                window_size = snapshot.window_size
            );
            hashed.clear();
        }

        let task = Self {
            upload_id: snapshot.upload_id,
            disk_id: snapshot.disk_id,
            staging_dir: snapshot.staging_dir,
            meta_path: meta_path.to_path_buf(),
            params: snapshot.params,
            created_at: snapshot.created_at,
            state: Mutex::new(TaskState {
                uploaded: snapshot.uploaded_parts,
                uploading: Vec::new(),
                hashed,
                completed: false,
            }),
            last_active: AtomicI64::new(0),
        };
        task.touch();
        Ok(task)
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn disk_id(&self) -> DiskId {
        self.disk_id
    }

    pub fn params(&self) -> &UploadParams {
        &self.params
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn data_path(&self) -> PathBuf {
        self.staging_dir
            .join(format!("{}.{}", self.upload_id, DATA_EXT))
    }

    pub fn hash_path(&self) -> PathBuf {
        self.staging_dir
            .join(format!("{}.{}", self.upload_id, HASH_EXT))
    }

    /// Any part currently being written.
    pub fn is_busy(&self) -> bool {
        !self.lock().uploading.is_empty()
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_active.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    pub fn touch(&self) {
        self.last_active
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn status(&self) -> TaskStatus {
        let state = self.lock();
        TaskStatus {
            upload_id: self.upload_id.clone(),
            params: self.params.clone(),
            uploaded_parts: state.uploaded.clone(),
            uploading_parts: state.uploading.clone(),
        }
    }

    /// Write `[start, end)` from `body`.
    ///
    /// `expected_md5` is the client digest of the body; a mismatch leaves
    /// the range unrecorded.
    pub fn upload<R: Read>(
        &self,
        start: u64,
        end: u64,
        body: R,
        expected_md5: Option<Digest>,
    ) -> Result<PartOutcome> {
        let size = self.params.size;
        if start >= end || end > size {
            return Err(MultipartError::RangeError { start, end, size });
        }
        let part = Part::new(start, end);

        let Some(mut guard) = self.begin(part)? else {
            log_upload_debug!(
                "range already uploaded",
                upload_id = self.upload_id.as_str(),
                start = start,
                end = end
            );
            return Ok(PartOutcome::AlreadyUploaded);
        };
        self.touch();

        let inline = self.write_range(part, body, expected_md5)?;
        self.write_digests(&inline)?;

        let ready = {
            let mut state = self.lock();
            part::merge(&mut state.uploaded, part);
            state.hashed.extend(inline.iter().map(|(w, _)| *w));
            self.covered_unhashed(&state, part)
        };

        let mut readback = Vec::with_capacity(ready.len());
        for window in ready {
            readback.push((window, self.hash_window(window)?));
        }
        self.write_digests(&readback)?;

        let mut state = self.lock();
        state.hashed.extend(readback.iter().map(|(w, _)| *w));
        guard.release(&mut state);
        self.persist(&state)?;
        drop(state);
        self.touch();

        let mut hashed: Vec<u64> = inline.iter().chain(&readback).map(|(w, _)| *w).collect();
        hashed.sort_unstable();
        log_upload_debug!(
            "part stored",
            upload_id = self.upload_id.as_str(),
            start = start,
            end = end,
            inline = inline.len(),
            readback = readback.len()
        );
        Ok(PartOutcome::Stored { part, hashed })
    }

    /// Verify the assembled object and move it into `store`.
    ///
    /// Staging hash and snapshot files are removed on success. On failure
    /// the task is left intact.
    pub fn complete(&self, store: &ContentStore, bucket: &str) -> Result<CompletedUpload> {
        let size = self.params.size;
        let mut state = self.lock();
        if state.completed {
            return Err(MultipartError::TaskNotFound(self.upload_id.clone()));
        }
        if !state.uploading.is_empty() || state.uploaded.as_slice() != [Part::new(0, size)] {
            return Err(MultipartError::NotFullyUploaded {
                uploaded: part::total_len(&state.uploaded),
                size,
            });
        }

        let missing: Vec<u64> = (0..window_count(size))
            .filter(|w| !state.hashed.contains(w))
            .collect();
        if !missing.is_empty() {
            log_upload_warn!(
                "recomputing missing window digests",
                upload_id = self.upload_id.as_str(),
                missing = missing.len()
            );
            let mut digests = Vec::with_capacity(missing.len());
            for window in missing {
                digests.push((window, self.hash_window(window)?));
            }
            self.write_digests(&digests)?;
            state.hashed.extend(digests.iter().map(|(w, _)| *w));
            self.persist(&state)?;
        }

        let actual = Fingerprint::from_windows(size, &self.read_digests()?);
        if actual != self.params.fingerprint {
            log_upload_warn!(
                "fingerprint mismatch",
                upload_id = self.upload_id.as_str(),
                expected = tracing::field::display(&self.params.fingerprint),
                actual = tracing::field::display(&actual)
            );
            return Err(MultipartError::HashMismatch {
                expected: self.params.fingerprint.to_hex(),
                actual: actual.to_hex(),
            });
        }

        let key = actual.to_hex();
        let path = store.move_into_store(&self.data_path(), self.disk_id, bucket, &key)?;
        state.completed = true;
        remove_if_exists(&self.hash_path())?;
        remove_if_exists(&self.meta_path)?;

        log_upload_info!(
            "upload completed",
            upload_id = self.upload_id.as_str(),
            disk_id = self.disk_id,
            size = size
        );
        Ok(CompletedUpload {
            upload_id: self.upload_id.clone(),
            fingerprint: actual,
            disk_id: self.disk_id,
            path,
            size,
        })
    }

    /// Remove staging and snapshot files.
    pub fn remove_files(&self) -> Result<()> {
        remove_if_exists(&self.data_path())?;
        remove_if_exists(&self.hash_path())?;
        remove_if_exists(&self.meta_path)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `part` as in flight, or `None` if it is already uploaded.
    fn begin(&self, part: Part) -> Result<Option<InflightGuard<'_>>> {
        let mut state = self.lock();
        if state.completed {
            return Err(MultipartError::TaskNotFound(self.upload_id.clone()));
        }
        match part::classify(&state.uploaded, part) {
            Coverage::Contained => return Ok(None),
            Coverage::Partial(existing) => {
                return Err(MultipartError::Overlap { part, existing });
            }
            Coverage::Disjoint => {}
        }
        if let Some(inflight) = state.uploading.iter().find(|p| p.intersects(&part)) {
            return Err(MultipartError::UploadingConflict {
                part,
                inflight: *inflight,
            });
        }
        state.uploading.push(part);
        Ok(Some(InflightGuard {
            task: self,
            part,
            armed: true,
        }))
    }

    /// Stream the body into the data file. Window-aligned ranges are hashed
    /// inline and their digests returned.
    fn write_range<R: Read>(
        &self,
        part: Part,
        mut body: R,
        expected_md5: Option<Digest>,
    ) -> Result<Vec<(u64, Digest)>> {
        let size = self.params.size;
        let mut file = OpenOptions::new().write(true).open(self.data_path())?;
        file.seek(SeekFrom::Start(part.start))?;

        let aligned =
            part.start % WINDOW_SIZE == 0 && (part.end % WINDOW_SIZE == 0 || part.end == size);
        let mut range_hasher = expected_md5.map(|_| WindowHasher::new());
        let mut windows = Vec::new();

        if aligned {
            let mut offset = part.start;
            while offset < part.end {
                let index = offset / WINDOW_SIZE;
                let (_, window_end) = window_bounds(index, size);
                let mut hasher = WindowHasher::new();
                let mut writer =
                    HashingWriter::new(&mut file, Some(&mut hasher), range_hasher.as_mut());
                copy_exact(&mut body, &mut writer, window_end - offset)?;
                drop(writer);
                windows.push((index, hasher.finish()));
                offset = window_end;
            }
        } else {
            let mut writer = HashingWriter::new(&mut file, None, range_hasher.as_mut());
            copy_exact(&mut body, &mut writer, part.len())?;
        }
        file.sync_data()?;

        if let (Some(expected), Some(hasher)) = (expected_md5, range_hasher) {
            let actual = hasher.finish();
            if actual != expected {
                return Err(MultipartError::ChecksumMismatch {
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }
        }
        Ok(windows)
    }

    /// Windows touched by `part` that are now fully uploaded but not hashed.
    fn covered_unhashed(&self, state: &TaskState, part: Part) -> Vec<u64> {
        let size = self.params.size;
        let first = part.start / WINDOW_SIZE;
        let last = (part.end - 1) / WINDOW_SIZE;
        (first..=last)
            .filter(|w| !state.hashed.contains(w))
            .filter(|&w| {
                let (start, end) = window_bounds(w, size);
                part::covers(&state.uploaded, Part::new(start, end))
            })
            .collect()
    }

    /// Digest of window `index`, read back from the data file.
    fn hash_window(&self, index: u64) -> io::Result<Digest> {
        let (start, end) = window_bounds(index, self.params.size);
        let mut file = File::open(self.data_path())?;
        file.seek(SeekFrom::Start(start))?;
        let mut hasher = WindowHasher::new();
        let mut sink = HashingWriter::new(io::sink(), Some(&mut hasher), None);
        copy_exact(&mut file, &mut sink, end - start)?;
        drop(sink);
        Ok(hasher.finish())
    }

    fn write_digests(&self, digests: &[(u64, Digest)]) -> io::Result<()> {
        if digests.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new().write(true).open(self.hash_path())?;
        for (window, digest) in digests {
            file.seek(SeekFrom::Start(window * DIGEST_LEN as u64))?;
            file.write_all(digest)?;
        }
        file.sync_data()
    }

    fn read_digests(&self) -> io::Result<Vec<Digest>> {
        let raw = fs::read(self.hash_path())?;
        let expected = window_count(self.params.size) as usize * DIGEST_LEN;
        if raw.len() < expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("hash file holds {} of {} bytes", raw.len(), expected),
            ));
        }
        Ok(raw[..expected]
            .chunks_exact(DIGEST_LEN)
            .map(|c| {
                let mut d = [0u8; DIGEST_LEN];
                d.copy_from_slice(c);
                d
            })
            .collect())
    }

    /// Atomically replace the snapshot.
    fn persist(&self, state: &TaskState) -> Result<()> {
        let snapshot = TaskSnapshot {
            upload_id: self.upload_id.clone(),
            disk_id: self.disk_id,
            staging_dir: self.staging_dir.clone(),
            params: self.params.clone(),
            window_size: WINDOW_SIZE,
            uploaded_parts: state.uploaded.clone(),
            uploading_parts: state.uploading.clone(),
            hashed_windows: state.hashed.clone(),
            created_at: self.created_at,
        };
        let data = serde_json::to_vec(&snapshot)?;

        let tmp = self.meta_path.with_extension(format!("{}.tmp", META_EXT));
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.meta_path)?;
        Ok(())
    }
}

fn copy_exact<R: Read, W: Write>(reader: &mut R, writer: &mut W, len: u64) -> io::Result<()> {
    let copied = io::copy(&mut reader.take(len), writer)?;
    if copied != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("body ended after {} of {} bytes", copied, len),
        ));
    }
    Ok(())
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
    use spacebox_cas::fingerprint_bytes;
    use tempfile::TempDir;

    const W: u64 = WINDOW_SIZE;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn new_task(temp: &TempDir, data: &[u8]) -> UploadTask {
        let fp = fingerprint_bytes(data);
        UploadTask::create(
            fp.to_hex(),
            1,
            temp.path().join("staging"),
            &temp.path().join("meta"),
            UploadParams::new("a.bin", data.len() as u64, fp),
        )
        .unwrap()
    }

    #[test]
    fn test_create_preallocates_files() {
        let temp = TempDir::new().unwrap();
        let data = payload(W as usize + 10);
        let task = new_task(&temp, &data);

        assert_eq!(fs::metadata(task.data_path()).unwrap().len(), W + 10);
        assert_eq!(fs::metadata(task.hash_path()).unwrap().len(), 32);
        assert!(task.meta_path().is_file());
    }

    #[test]
    fn test_zero_size_rejected() {
        let temp = TempDir::new().unwrap();
        let fp = fingerprint_bytes(b"");
        let err = UploadTask::create(
            "x",
            1,
            temp.path().join("staging"),
            &temp.path().join("meta"),
            UploadParams::new("empty", 0, fp),
        )
        .unwrap_err();
        assert!(matches!(err, MultipartError::InvalidSize(0)));
    }

    #[test]
    fn test_range_validation() {
        let temp = TempDir::new().unwrap();
        let task = new_task(&temp, &payload(16));
        for (s, e) in [(4, 4), (5, 4), (0, 17)] {
            assert!(matches!(
                task.upload(s, e, &[][..], None),
                Err(MultipartError::RangeError { .. })
            ));
        }
    }

    #[test]
    fn test_overlap_and_merge() {
        let temp = TempDir::new().unwrap();
        let data = payload(16);
        let task = new_task(&temp, &data);

        task.upload(0, 4, &data[0..4], None).unwrap();
        let err = task.upload(2, 6, &data[2..6], None).unwrap_err();
        assert!(matches!(err, MultipartError::Overlap { .. }));

        task.upload(4, 8, &data[4..8], None).unwrap();
        assert_eq!(task.status().uploaded_parts, vec![Part::new(0, 8)]);
        assert!(task.status().uploading_parts.is_empty());
    }

    #[test]
    fn test_already_uploaded_does_not_write() {
        let temp = TempDir::new().unwrap();
        let data = payload(16);
        let task = new_task(&temp, &data);

        task.upload(0, 8, &data[0..8], None).unwrap();
        let outcome = task.upload(2, 6, &b"XXXX"[..], None).unwrap();
        assert_eq!(outcome, PartOutcome::AlreadyUploaded);
        assert_eq!(&fs::read(task.data_path()).unwrap()[0..8], &data[0..8]);
    }

    #[test]
    fn test_inflight_conflict() {
        let temp = TempDir::new().unwrap();
        let task = new_task(&temp, &payload(16));

        let guard = task.begin(Part::new(0, 8)).unwrap().unwrap();
        let err = task.upload(4, 12, &[0u8; 8][..], None).unwrap_err();
        assert!(matches!(err, MultipartError::UploadingConflict { .. }));
        assert!(task.is_busy());

        drop(guard);
        assert!(!task.is_busy());
    }

    #[test]
    fn test_short_body_releases_inflight() {
        let temp = TempDir::new().unwrap();
        let data = payload(16);
        let task = new_task(&temp, &data);

        let err = task.upload(0, 8, &data[0..5], None).unwrap_err();
        assert!(matches!(err, MultipartError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
        let status = task.status();
        assert!(status.uploaded_parts.is_empty());
        assert!(status.uploading_parts.is_empty());

        task.upload(0, 8, &data[0..8], None).unwrap();
    }

    #[test]
    fn test_part_checksum() {
        let temp = TempDir::new().unwrap();
        let data = payload(16);
        let task = new_task(&temp, &data);

        let wrong = md5::compute(b"nope").0;
        let err = task.upload(0, 8, &data[0..8], Some(wrong)).unwrap_err();
        assert!(matches!(err, MultipartError::ChecksumMismatch { .. }));
        assert!(task.status().uploaded_parts.is_empty());

        let right = md5::compute(&data[0..8]).0;
        task.upload(0, 8, &data[0..8], Some(right)).unwrap();
        assert_eq!(task.status().uploaded_parts, vec![Part::new(0, 8)]);
    }

    #[test]
    fn test_aligned_parts_hash_inline() {
        let temp = TempDir::new().unwrap();
        let data = payload(2 * W as usize + 100);
        let task = new_task(&temp, &data);

        let outcome = task
            .upload(W, 2 * W, &data[W as usize..2 * W as usize], None)
            .unwrap();
        assert_eq!(
            outcome,
            PartOutcome::Stored {
                part: Part::new(W, 2 * W),
                hashed: vec![1]
            }
        );

        let last = task.upload(2 * W, 2 * W + 100, &data[2 * W as usize..], None).unwrap();
        assert!(matches!(last, PartOutcome::Stored { ref hashed, .. } if hashed == &vec![2]));
    }

    #[test]
    fn test_misaligned_parts_hash_on_cover() {
        let temp = TempDir::new().unwrap();
        let data = payload(W as usize + 10);
        let task = new_task(&temp, &data);
        let mid = 1000usize;

        let first = task.upload(0, mid as u64, &data[..mid], None).unwrap();
        assert!(matches!(first, PartOutcome::Stored { ref hashed, .. } if hashed.is_empty()));

        let second = task
            .upload(mid as u64, W + 10, &data[mid..], None)
            .unwrap();
        assert!(matches!(second, PartOutcome::Stored { ref hashed, .. } if hashed == &vec![0, 1]));
    }

    #[test]
    fn test_snapshot_reload_clears_inflight() {
        let temp = TempDir::new().unwrap();
        let data = payload(16);
        let task = new_task(&temp, &data);
        task.upload(0, 4, &data[0..4], None).unwrap();
        let _guard = task.begin(Part::new(8, 12)).unwrap().unwrap();
        // Snapshot written while a part is in flight
        task.persist(&task.lock()).unwrap();

        let reloaded = UploadTask::load(task.meta_path()).unwrap();
        let status = reloaded.status();
        assert_eq!(status.uploaded_parts, vec![Part::new(0, 4)]);
        assert!(status.uploading_parts.is_empty());
        assert_eq!(reloaded.params(), task.params());
    }

    #[test]
    fn test_load_without_data_file() {
        let temp = TempDir::new().unwrap();
        let task = new_task(&temp, &payload(16));
        fs::remove_file(task.data_path()).unwrap();
        assert!(matches!(
            UploadTask::load(task.meta_path()),
            Err(MultipartError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_remove_files() {
        let temp = TempDir::new().unwrap();
        let task = new_task(&temp, &payload(16));
        task.remove_files().unwrap();
        assert!(!task.data_path().exists());
        assert!(!task.hash_path().exists());
        assert!(!task.meta_path().exists());
        task.remove_files().unwrap();
    }
}
