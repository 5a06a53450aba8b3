//! # spacebox-service
//!
//! Client-facing facade over the content store and multipart uploads.
//!
//! - [`UploadService`]: create, feed, complete and download uploads
//! - [`codes`]: stable numeric result codes
//! - [`metadata`]: file-record collaborator and an in-memory implementation
//! - [`AsyncTaskTracker`]: progress of long-running batch jobs
//! - [`EventPublisher`]: bounded delivery of store change events
//! - [`Runtime`]: wires everything from a [`spacebox_config::Config`]

use std::io;

use spacebox_cas::{FingerprintError, StoreError};
use spacebox_multipart::MultipartError;
use thiserror::Error;

pub mod async_task;
pub mod codes;
pub mod metadata;
pub mod publisher;
pub mod runtime;
pub mod upload;

pub use async_task::{AsyncStatus, AsyncTaskHandle, AsyncTaskInfo, AsyncTaskTracker};
pub use codes::ErrorCode;
pub use metadata::{FileRecord, MemoryMetadata, MetadataError, MetadataStore, TrashState};
pub use publisher::{EventPublisher, EventTransport, LogTransport, PublisherStats, TransportError};
pub use runtime::{Runtime, RuntimeOptions};
pub use upload::{
    BatchDelete, BatchReport, CreateUploadRequest, CreateUploadResponse, UploadService,
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Multipart(#[from] MultipartError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error("Invalid parameter: {0}")]
    Param(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Async task not found: {0}")]
    AsyncTaskNotFound(String),

    #[error("Too many background jobs (limit {limit})")]
    TooManyJobs { limit: usize },

    #[error("{failed} of {total} items failed")]
    PartiallyFailed { failed: usize, total: usize },
}

pub type Result<T> = std::result::Result<T, ServiceError>;
