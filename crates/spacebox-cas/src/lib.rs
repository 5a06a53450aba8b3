//! # spacebox-cas
//!
//! Multi-disk content-addressed object storage for Spacebox.
//!
//! Objects are keyed by their windowed MD5 fingerprint (see [`fingerprint`])
//! and spread over every mounted disk with a 2-level fan-out:
//!
//! ```text
//! {data_root}/{prefix}{disk}/
//! └── {bucket}/
//!     └── 16/
//!         └── ab/
//!             └── 16abcdef...   # 34 hex chars
//! ```
//!
//! An in-memory index remembers which disk holds each key; it is rebuilt
//! from disk with [`ContentStore::rebuild_index`].

pub mod events;
pub mod fingerprint;
pub mod index;
pub mod placement;
mod store;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use events::{EventSink, NullSink, StoreEvent};
pub use fingerprint::{
    fingerprint_bytes, fingerprint_reader, Fingerprint, FingerprintError, WindowHasher,
    WINDOW_SIZE,
};
pub use index::{DiskIndex, MemoryIndex};
pub use placement::{
    DiskId, DiskMount, DiskPlacer, DiskTopology, DiskUsage, FixedSpace, Fs2Probe, Placement,
    SpaceProbe,
};
pub use store::{ByteRange, ContentStore, DeleteOutcome, ObjectReader, PutOutcome};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Invalid object key: {0:?}")]
    InvalidKey(String),

    #[error("Insufficient space: no disk can hold {requested} bytes")]
    InsufficientSpace { requested: u64 },

    #[error("Unknown disk: {0}")]
    UnknownDisk(DiskId),

    #[error("No disks configured in {0}")]
    NoDisks(PathBuf),

    #[error("Path {0} is outside the data root")]
    OutsideDataRoot(PathBuf),

    #[error("Range not satisfiable: {start}..{end:?} of {size} bytes")]
    RangeNotSatisfiable {
        start: u64,
        end: Option<u64>,
        size: u64,
    },

    #[error("Topology error: {0}")]
    Topology(#[from] serde_json::Error),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Another writer is storing {key}")]
    WriteInProgress { key: String },

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
