//! Upload and download operations as seen by clients.

use std::io::Read;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use spacebox_cas::fingerprint::parse_digest;
use spacebox_cas::{
    ByteRange, ContentStore, DeleteOutcome, Fingerprint, ObjectReader, WINDOW_SIZE,
};
use spacebox_config::{log_upload_debug, log_upload_info, log_upload_warn};
use spacebox_multipart::{Generated, PartOutcome, TaskStatus, UploadParams, UploadTaskManager};

use crate::async_task::{AsyncTaskHandle, AsyncTaskInfo, AsyncTaskTracker};
use crate::metadata::{
    self, FileRecord, MetadataError, MetadataStore, TrashState, DEFAULT_MIME, ROOT_PATH,
};
use crate::{Result, ServiceError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadRequest {
    pub file_name: String,
    pub size: u64,
    /// 32 or 34 hex characters.
    pub betag: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub folder_path: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub modify_time: i64,
}

impl CreateUploadRequest {
    pub fn new(file_name: impl Into<String>, size: u64, betag: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            size,
            betag: betag.into(),
            folder_id: None,
            folder_path: None,
            mime: None,
            create_time: 0,
            modify_time: 0,
        }
    }

    pub fn in_folder(mut self, path: impl Into<String>) -> Self {
        self.folder_path = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rspType", rename_all = "camelCase")]
pub enum CreateUploadResponse {
    /// Send parts for `upload_id`.
    #[serde(rename_all = "camelCase")]
    Started { upload_id: String, part_size: u64 },
    /// A task for this content already exists.
    Conflict(TaskStatus),
    /// The content is already stored; the file record is ready.
    Complete(FileRecord),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchDelete {
    Done(BatchReport),
    /// Running in the background; poll the task id.
    Async(String),
}

/// Client-facing upload service.
pub struct UploadService {
    manager: Arc<UploadTaskManager>,
    metadata: Arc<dyn MetadataStore>,
    tracker: AsyncTaskTracker,
}

impl std::fmt::Debug for UploadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadService")
            .field("manager", &self.manager)
            .field("tracker", &self.tracker)
            .finish()
    }
}

impl UploadService {
    pub fn new(
        manager: Arc<UploadTaskManager>,
        metadata: Arc<dyn MetadataStore>,
        tracker: AsyncTaskTracker,
    ) -> Self {
        Self {
            manager,
            metadata,
            tracker,
        }
    }

    pub fn manager(&self) -> &Arc<UploadTaskManager> {
        &self.manager
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn tracker(&self) -> &AsyncTaskTracker {
        &self.tracker
    }

    fn store(&self) -> &Arc<ContentStore> {
        self.manager.store()
    }

    fn bucket(&self) -> &str {
        self.manager.bucket()
    }

    pub fn create_upload(
        &self,
        user_id: u64,
        req: CreateUploadRequest,
    ) -> Result<CreateUploadResponse> {
        if req.file_name.is_empty() || req.file_name.contains('/') {
            return Err(ServiceError::Param(format!(
                "invalid file name {:?}",
                req.file_name
            )));
        }
        let fingerprint = Fingerprint::normalize(&req.betag, req.size)?;
        let folder = self.resolve_folder(
            user_id,
            req.folder_id.as_deref(),
            req.folder_path.as_deref(),
        )?;

        let mut params = UploadParams::new(req.file_name, req.size, fingerprint);
        params.user_id = user_id;
        params.folder_id = Some(folder.id.clone());
        params.folder_path = Some(folder.full_path());
        params.mime = req.mime.filter(|m| !m.is_empty());
        params.create_time = req.create_time;
        params.modify_time = req.modify_time;

        match self.manager.generate(params.clone())? {
            Generated::Created(task) => Ok(CreateUploadResponse::Started {
                upload_id: task.upload_id().to_string(),
                part_size: WINDOW_SIZE,
            }),
            Generated::Conflict(task) => {
                log_upload_debug!("upload already in progress", upload_id = task.upload_id());
                Ok(CreateUploadResponse::Conflict(task.status()))
            }
            Generated::AlreadyStored(fingerprint) => {
                log_upload_info!(
                    "content already stored, skipping upload",
                    fingerprint = tracing::field::display(&fingerprint)
                );
                Ok(CreateUploadResponse::Complete(self.insert_record(&params)?))
            }
        }
    }

    /// Store bytes `[start, end)`. `md5sum` is the hex digest of the body.
    pub fn upload_part<R: Read>(
        &self,
        upload_id: &str,
        start: u64,
        end: u64,
        body: R,
        md5sum: Option<&str>,
    ) -> Result<PartOutcome> {
        let expected = match md5sum.filter(|s| !s.is_empty()) {
            Some(hex) => Some(parse_digest(hex)?),
            None => None,
        };
        let task = self.manager.get_or_load(upload_id)?;
        Ok(task.upload(start, end, body, expected)?)
    }

    pub fn complete_upload(&self, upload_id: &str) -> Result<FileRecord> {
        let params = self.manager.get_or_load(upload_id)?.params().clone();
        self.manager.complete(upload_id)?;
        self.insert_record(&params)
    }

    pub fn list_uploaded_parts(&self, upload_id: &str) -> Result<TaskStatus> {
        Ok(self.manager.get_or_load(upload_id)?.status())
    }

    /// Abort an upload. Returns whether a task existed.
    pub fn delete_upload(&self, upload_id: &str) -> Result<bool> {
        Ok(self.manager.delete(upload_id)?)
    }

    pub fn download_object(
        &self,
        fingerprint: &str,
        range: Option<ByteRange>,
    ) -> Result<ObjectReader> {
        let key = Fingerprint::parse(fingerprint)?.to_hex();
        Ok(self.store().get(self.bucket(), &key, range)?)
    }

    /// Delete stored objects by fingerprint.
    pub fn delete_objects(&self, keys: Vec<String>) -> Result<BatchDelete> {
        if !self.tracker.should_run_async(keys.len()) {
            return Ok(BatchDelete::Done(delete_batch(
                self.store(),
                self.bucket(),
                &keys,
                None,
            )));
        }

        let store = self.store().clone();
        let bucket = self.bucket().to_string();
        let total = keys.len();
        let task_id = self.tracker.spawn(total as u64, move |handle| {
            let report = delete_batch(&store, &bucket, &keys, Some(handle));
            if report.is_complete() {
                Ok(())
            } else {
                Err(ServiceError::PartiallyFailed {
                    failed: report.failed.len(),
                    total,
                })
            }
        })?;
        log_upload_info!(
            "batch delete running in background",
            task_id = task_id.as_str(),
            total = total
        );
        Ok(BatchDelete::Async(task_id))
    }

    pub fn async_task_status(&self, task_id: &str) -> Result<AsyncTaskInfo> {
        self.tracker.poll(task_id)
    }

    fn resolve_folder(
        &self,
        user_id: u64,
        folder_id: Option<&str>,
        folder_path: Option<&str>,
    ) -> Result<FileRecord> {
        if let Some(id) = folder_id.filter(|s| !s.is_empty()) {
            return match self.metadata.get_record_by_id(id) {
                Ok(record) if record.is_dir && record.user_id == user_id => Ok(record),
                Ok(_) | Err(MetadataError::NotFound(_)) => {
                    Err(ServiceError::FolderNotFound(id.to_string()))
                }
                Err(e) => Err(e.into()),
            };
        }
        match folder_path.filter(|s| !s.is_empty()) {
            Some(path) => Ok(self.metadata.ensure_folder(user_id, path)?),
            None => Err(ServiceError::Param(
                "folderId or folderPath is required".to_string(),
            )),
        }
    }

    /// Folder recorded in the params at creation time.
    fn folder_of(&self, params: &UploadParams) -> Result<FileRecord> {
        match params.folder_id.as_deref().filter(|s| !s.is_empty()) {
            Some(id) => Ok(self.metadata.get_record_by_id(id)?),
            None => {
                let path = params.folder_path.as_deref().unwrap_or(ROOT_PATH);
                Ok(self.metadata.ensure_folder(params.user_id, path)?)
            }
        }
    }

    /// Record the stored object under the upload's file name.
    ///
    /// A same-named record with equal content is refreshed and returned;
    /// one with different content forces a numbered name.
    fn insert_record(&self, params: &UploadParams) -> Result<FileRecord> {
        let folder = self.folder_of(params)?;
        let parent_path = folder.full_path();
        let betag = params.fingerprint.to_hex();
        let mut name = params.file_name.clone();

        match self.metadata.lookup_file_by_path(
            params.user_id,
            &parent_path,
            &name,
            TrashState::Normal,
        ) {
            Ok(existing) if existing.betag == betag => {
                let now = Utc::now().timestamp_millis();
                self.metadata.update_operation_time(&existing.id, now)?;
                return Ok(FileRecord {
                    operation_time: now,
                    ..existing
                });
            }
            Ok(_) => name = self.free_name(params.user_id, &parent_path, &name)?,
            Err(MetadataError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut record = FileRecord::file(params.user_id, &folder, &name, &betag, params.size);
        record.bucket = self.bucket().to_string();
        if record.mime == DEFAULT_MIME {
            if let Some(mime) = &params.mime {
                record.mime = mime.clone();
            }
        }
        if params.create_time > 0 {
            record.create_time = params.create_time;
        }
        if params.modify_time > 0 {
            record.modify_time = params.modify_time;
        }
        self.metadata.insert_file_record(record.clone(), &folder.id)?;
        log_upload_info!(
            "file record inserted",
            name = record.name.as_str(),
            path = record.path.as_str(),
            betag = record.betag.as_str()
        );
        Ok(record)
    }

    fn free_name(&self, user_id: u64, parent_path: &str, name: &str) -> Result<String> {
        let mut n = 1u32;
        loop {
            let candidate = metadata::numbered_name(name, n);
            match self.metadata.lookup_file_by_path(
                user_id,
                parent_path,
                &candidate,
                TrashState::Normal,
            ) {
                Err(MetadataError::NotFound(_)) => return Ok(candidate),
                Ok(_) => n = n.saturating_add(1),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn delete_batch(
    store: &ContentStore,
    bucket: &str,
    keys: &[String],
    progress: Option<&AsyncTaskHandle>,
) -> BatchReport {
    let mut report = BatchReport::default();
    for key in keys {
        let result = Fingerprint::parse(key)
            .map_err(|e| e.to_string())
            .and_then(|fp| {
                store
                    .delete(bucket, &fp.to_hex())
                    .map_err(|e| e.to_string())
            });
        match result {
            Ok(DeleteOutcome::Removed { .. }) | Ok(DeleteOutcome::AlreadyGone) => {
                report.succeeded.push(key.clone())
            }
            Err(e) => {
                log_upload_warn!("object delete failed", key = key.as_str(), error = e.as_str());
                report.failed.push((key.clone(), e));
            }
        }
        if let Some(handle) = progress {
            handle.advance(1);
        }
    }
    report
}
