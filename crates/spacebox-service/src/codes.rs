//! Stable numeric result codes exposed to clients.

use serde::{Serialize, Serializer};
use spacebox_cas::StoreError;
use spacebox_multipart::{MultipartError, PartOutcome};

use crate::metadata::MetadataError;
use crate::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 200,
    ParamErr = 1001,
    FileNotExist = 1003,
    FolderNotExist = 1005,
    FailedToSaveFile = 1010,
    FailedToOperateDb = 1011,
    FailedToCreateMultipartTask = 1027,
    MultipartTaskNotFound = 1028,
    MultipartTaskOverlap = 1029,
    MultipartTaskRangeErr = 1030,
    MultipartTaskHashErr = 1031,
    MultipartTaskCompleteErr = 1032,
    NotEnoughSpace = 1036,
    MultipartRangeUploaded = 1037,
    MultipartUploadingConflict = 1038,
    MultipartTaskBusy = 1039,
    PartChecksumErr = 1040,
    RangeNotSatisfiable = 1041,
    AsyncTaskNotFound = 1062,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::ParamErr => "Parameter error",
            ErrorCode::FileNotExist => "File is not exist",
            ErrorCode::FolderNotExist => "Folder is not exist",
            ErrorCode::FailedToSaveFile => "failed to save file",
            ErrorCode::FailedToOperateDb => "failed to operate db",
            ErrorCode::FailedToCreateMultipartTask => "failed to create multipart task",
            ErrorCode::MultipartTaskNotFound => "multipart task not found",
            ErrorCode::MultipartTaskOverlap => "multipart range overlaps uploaded data",
            ErrorCode::MultipartTaskRangeErr => "multipart range error",
            ErrorCode::MultipartTaskHashErr => "multipart hash mismatch",
            ErrorCode::MultipartTaskCompleteErr => "multipart upload not complete",
            ErrorCode::NotEnoughSpace => "Normal Upload: not enough space",
            ErrorCode::MultipartRangeUploaded => "multipart range already uploaded",
            ErrorCode::MultipartUploadingConflict => "multipart range is uploading",
            ErrorCode::MultipartTaskBusy => "multipart task is busy",
            ErrorCode::PartChecksumErr => "part checksum mismatch",
            ErrorCode::RangeNotSatisfiable => "range not satisfiable",
            ErrorCode::AsyncTaskNotFound => "async task not found",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.as_u32(), self.message())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}

/// Code reported for a successful part upload.
pub fn part_code(outcome: &PartOutcome) -> ErrorCode {
    match outcome {
        PartOutcome::Stored { .. } => ErrorCode::Ok,
        PartOutcome::AlreadyUploaded => ErrorCode::MultipartRangeUploaded,
    }
}

fn store_code(err: &StoreError) -> ErrorCode {
    match err {
        StoreError::NotFound { .. } => ErrorCode::FileNotExist,
        StoreError::InsufficientSpace { .. } => ErrorCode::NotEnoughSpace,
        StoreError::InvalidKey(_) | StoreError::Fingerprint(_) => ErrorCode::ParamErr,
        StoreError::RangeNotSatisfiable { .. } => ErrorCode::RangeNotSatisfiable,
        StoreError::Index(_) => ErrorCode::FailedToOperateDb,
        _ => ErrorCode::FailedToSaveFile,
    }
}

fn multipart_code(err: &MultipartError) -> ErrorCode {
    match err {
        MultipartError::Store(e) => store_code(e),
        MultipartError::InvalidSize(_) | MultipartError::Fingerprint(_) => ErrorCode::ParamErr,
        MultipartError::RangeError { .. } => ErrorCode::MultipartTaskRangeErr,
        MultipartError::Overlap { .. } => ErrorCode::MultipartTaskOverlap,
        MultipartError::UploadingConflict { .. } => ErrorCode::MultipartUploadingConflict,
        MultipartError::NotFullyUploaded { .. } => ErrorCode::MultipartTaskCompleteErr,
        MultipartError::HashMismatch { .. } => ErrorCode::MultipartTaskHashErr,
        MultipartError::ChecksumMismatch { .. } => ErrorCode::PartChecksumErr,
        MultipartError::Busy(_) => ErrorCode::MultipartTaskBusy,
        MultipartError::TaskNotFound(_) => ErrorCode::MultipartTaskNotFound,
        MultipartError::Snapshot(_) => ErrorCode::FailedToCreateMultipartTask,
        MultipartError::Io(_) => ErrorCode::FailedToSaveFile,
    }
}

impl ServiceError {
    /// Client-facing code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::Store(e) => store_code(e),
            ServiceError::Multipart(e) => multipart_code(e),
            ServiceError::Metadata(MetadataError::NotFound(_)) => ErrorCode::FileNotExist,
            ServiceError::Metadata(_) => ErrorCode::FailedToOperateDb,
            ServiceError::Fingerprint(_) | ServiceError::Param(_) => ErrorCode::ParamErr,
            ServiceError::FolderNotFound(_) => ErrorCode::FolderNotExist,
            ServiceError::AsyncTaskNotFound(_) => ErrorCode::AsyncTaskNotFound,
            ServiceError::TooManyJobs { .. } => ErrorCode::FailedToOperateDb,
            ServiceError::Io(_) | ServiceError::PartiallyFailed { .. } => {
                ErrorCode::FailedToSaveFile
            }
        }
    }
}
