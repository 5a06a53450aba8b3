//! Content-addressed object store over the disk placer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::instrument;
use walkdir::WalkDir;

use crate::events::{EventSink, StoreEvent};
use crate::index::DiskIndex;
use crate::placement::{hash_prefix, DiskId, DiskPlacer};
use crate::{Result, StoreError};

/// Byte range of a download. `end` is inclusive; `None` reads to EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn inclusive(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn to_eof(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes this range selects from an object of `size` bytes.
    fn resolve(&self, size: u64) -> Result<u64> {
        let unsatisfiable = || StoreError::RangeNotSatisfiable {
            start: self.start,
            end: self.end,
            size,
        };
        match self.end {
            Some(end) if end >= size || self.start > end => Err(unsatisfiable()),
            Some(end) => Ok(end - self.start + 1),
            None if self.start > size => Err(unsatisfiable()),
            None => Ok(size - self.start),
        }
    }
}

/// Result of [`ContentStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Stored { disk_id: DiskId, path: PathBuf },
    /// The key was already present, or another writer stored it first.
    AlreadyExists { disk_id: DiskId },
}

/// Result of [`ContentStore::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed { disk_id: DiskId },
    AlreadyGone,
}

/// Bounded reader over a stored object.
#[derive(Debug)]
pub struct ObjectReader {
    inner: io::Take<File>,
    len: u64,
    object_size: u64,
    disk_id: DiskId,
}

impl ObjectReader {
    /// Bytes this reader yields in total.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the whole stored object.
    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    pub fn disk_id(&self) -> DiskId {
        self.disk_id
    }
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Durable, deduplicated object storage keyed by `(bucket, key)`.
///
/// Objects are immutable once renamed into place. Writers for the same key
/// are not serialized; the rename is atomic and last-writer-wins in the
/// index is harmless because equal keys mean equal content.
pub struct ContentStore {
    placer: Arc<DiskPlacer>,
    index: Arc<dyn DiskIndex>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("placer", &self.placer)
            .field("indexed", &self.index.len())
            .finish()
    }
}

impl ContentStore {
    pub fn new(
        placer: Arc<DiskPlacer>,
        index: Arc<dyn DiskIndex>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            placer,
            index,
            events,
        }
    }

    pub fn placer(&self) -> &Arc<DiskPlacer> {
        &self.placer
    }

    pub fn index(&self) -> &Arc<dyn DiskIndex> {
        &self.index
    }

    /// Find the disk and path of `key`, healing a dangling index entry.
    ///
    /// An index miss falls back to probing every disk, so objects written
    /// before the index was rebuilt are still found.
    pub fn locate(&self, bucket: &str, key: &str) -> Result<Option<(DiskId, PathBuf)>> {
        hash_prefix(key)?;
        if let Some(disk_id) = self.index.get(key)? {
            let path = self.placer.path_for(disk_id, bucket, key)?;
            if path.is_file() {
                return Ok(Some((disk_id, path)));
            }
            tracing::warn!(key, disk_id, "index entry points at missing object, removing");
            self.index.remove(key)?;
        }

        for disk_id in self.placer.disk_ids() {
            let path = self.placer.path_for(disk_id, bucket, key)?;
            if path.is_file() {
                self.index.add(key, disk_id)?;
                return Ok(Some((disk_id, path)));
            }
        }
        Ok(None)
    }

    pub fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.locate(bucket, key)?.is_some())
    }

    /// Store `size` bytes from `reader` under `key`.
    ///
    /// Existing keys short-circuit without reading the body.
    #[instrument(skip(self, reader), level = "debug")]
    pub fn put<R: Read>(
        &self,
        bucket: &str,
        key: &str,
        reader: R,
        size: u64,
    ) -> Result<PutOutcome> {
        if let Some((disk_id, _)) = self.locate(bucket, key)? {
            return Ok(PutOutcome::AlreadyExists { disk_id });
        }

        let placement = self.placer.choose_placement(bucket, key, size)?;
        let path = placement.dir.join(key);
        let tmp_path = placement.dir.join(format!("{}.tmp", key));

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // The other writer may have finished in the meantime
                if let Some((disk_id, _)) = self.locate(bucket, key)? {
                    return Ok(PutOutcome::AlreadyExists { disk_id });
                }
                tracing::debug!(key, "concurrent writer owns temp file");
                return Err(StoreError::WriteInProgress {
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = write_body(&mut file, reader, size) {
            drop(file);
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        self.register(placement.disk_id, bucket, key, &path, size)?;
        Ok(PutOutcome::Stored {
            disk_id: placement.disk_id,
            path,
        })
    }

    /// Open `key` for reading, optionally restricted to `range`.
    #[instrument(skip(self), level = "debug")]
    pub fn get(&self, bucket: &str, key: &str, range: Option<ByteRange>) -> Result<ObjectReader> {
        let (disk_id, path) = self
            .locate(bucket, key)?
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;

        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.index.remove(key)?;
                return Err(StoreError::NotFound {
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let object_size = file.metadata()?.len();

        let (start, len) = match range {
            Some(range) => (range.start, range.resolve(object_size)?),
            None => (0, object_size),
        };
        if start > 0 {
            file.seek(SeekFrom::Start(start))?;
        }

        Ok(ObjectReader {
            inner: file.take(len),
            len,
            object_size,
            disk_id,
        })
    }

    /// Remove `key`. Deleting a missing object succeeds with
    /// [`DeleteOutcome::AlreadyGone`].
    #[instrument(skip(self), level = "debug")]
    pub fn delete(&self, bucket: &str, key: &str) -> Result<DeleteOutcome> {
        let located = self.locate(bucket, key)?;
        self.index.remove(key)?;

        let Some((disk_id, path)) = located else {
            return Ok(DeleteOutcome::AlreadyGone);
        };
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(DeleteOutcome::AlreadyGone);
            }
            Err(e) => return Err(e.into()),
        }

        self.events.emit(StoreEvent::Delete {
            key: key.to_string(),
            bucket: bucket.to_string(),
        });
        Ok(DeleteOutcome::Removed { disk_id })
    }

    /// Rename a fully assembled staging file into its content-addressed
    /// home on `disk_id`. The staging file must live on that disk.
    #[instrument(skip(self), level = "debug")]
    pub fn move_into_store(
        &self,
        staging: &Path,
        disk_id: DiskId,
        bucket: &str,
        key: &str,
    ) -> Result<PathBuf> {
        let dir = self.placer.object_dir(disk_id, bucket, key, true)?;
        let path = dir.join(key);
        let size = fs::metadata(staging)?.len();

        if path.is_file() {
            tracing::debug!(key, "object already present, dropping staging copy");
            fs::remove_file(staging)?;
        } else {
            File::open(staging)?.sync_all()?;
            fs::rename(staging, &path)?;
        }

        self.register(disk_id, bucket, key, &path, size)?;
        Ok(path)
    }

    /// Re-register every finalized object of `bucket` found on disk.
    ///
    /// Temp files left by interrupted writers are deleted, so this must run
    /// before any `put`. Returns the number of indexed objects.
    pub fn rebuild_index(&self, bucket: &str) -> Result<usize> {
        self.index.clear()?;
        let mut count = 0;
        for disk_id in self.placer.disk_ids() {
            let root = self.placer.disk_path(disk_id)?.join(bucket);
            if !root.is_dir() {
                continue;
            }
            for entry in WalkDir::new(&root).min_depth(3).max_depth(3) {
                let entry = entry.map_err(|e| StoreError::Index(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.path().extension().is_some_and(|ext| ext == "tmp") {
                    tracing::warn!(
                        path = %entry.path().display(),
                        "removing temp file of interrupted write"
                    );
                    fs::remove_file(entry.path())?;
                    continue;
                }
                let Some(key) = entry.file_name().to_str() else {
                    continue;
                };
                self.index.add(key, disk_id)?;
                count += 1;
            }
        }
        tracing::info!(bucket, objects = count, "index rebuilt");
        Ok(count)
    }

    fn register(
        &self,
        disk_id: DiskId,
        bucket: &str,
        key: &str,
        path: &Path,
        size: u64,
    ) -> Result<()> {
        self.index.add(key, disk_id)?;
        let disk_root = self.placer.disk_path(disk_id)?;
        self.events.emit(StoreEvent::Put {
            key: key.to_string(),
            bucket: bucket.to_string(),
            object_path: self.placer.relative_path(path)?,
            disk_path: self.placer.relative_path(disk_root)?,
            size,
        });
        Ok(())
    }
}

/// Copy exactly `size` bytes and flush them to stable storage.
fn write_body<R: Read>(file: &mut File, reader: R, size: u64) -> io::Result<()> {
    let copied = io::copy(&mut reader.take(size), file)?;
    if copied != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("body ended after {} of {} bytes", copied, size),
        ));
    }
    file.flush()?;
    file.sync_all()
}
