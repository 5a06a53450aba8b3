//! # spacebox-multipart
//!
//! Resumable multipart uploads into the content store.
//!
//! A client declares an object by size and fingerprint, sends `[start, end)`
//! parts in any order, and completes the upload once the parts cover the
//! whole object. Window digests are computed as parts land so completion
//! only combines them. Task state survives restarts through JSON snapshots.

mod error;
pub mod manager;
pub mod part;
pub mod sweeper;
pub mod task;

pub use error::{MultipartError, Result};
pub use manager::{
    ExpiredTask, GcReport, Generated, MaintenanceReport, SweepReport, UploadTaskManager,
};
pub use part::Part;
pub use sweeper::Sweeper;
pub use task::{CompletedUpload, PartOutcome, TaskStatus, UploadParams, UploadTask};
