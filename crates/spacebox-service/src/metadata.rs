//! File-record metadata collaborator.
//!
//! The service only needs a handful of lookups from the metadata database.
//! [`MetadataStore`] names them; [`MemoryMetadata`] keeps everything in a
//! map for tests and single-process deployments.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const ROOT_PATH: &str = "/";
pub const DEFAULT_MIME: &str = "application/octet-stream";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error("Metadata backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Trash state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TrashState {
    #[default]
    Normal,
    Trashed,
    /// Inside a trashed folder.
    SubTrashed,
}

/// One file or folder visible to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub parent_id: String,
    pub user_id: u64,
    pub is_dir: bool,
    pub name: String,
    /// Folder path the record lives in, always ending in `/`.
    pub path: String,
    /// Canonical fingerprint; empty for folders.
    pub betag: String,
    pub size: u64,
    pub category: String,
    pub mime: String,
    pub bucket: String,
    /// Unix millis.
    pub create_time: i64,
    pub modify_time: i64,
    pub operation_time: i64,
    pub trash: TrashState,
}

impl FileRecord {
    /// A new file record with a fresh id and type fields derived from `name`.
    pub fn file(user_id: u64, parent: &FileRecord, name: &str, betag: &str, size: u64) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: parent.id.clone(),
            user_id,
            is_dir: false,
            name: name.to_string(),
            path: parent.full_path(),
            betag: betag.to_string(),
            size,
            category: category_of(name).to_string(),
            mime: mime_of(name),
            bucket: String::new(),
            create_time: now,
            modify_time: now,
            operation_time: now,
            trash: TrashState::Normal,
        }
    }

    fn folder(user_id: u64, parent_id: &str, path: &str, name: &str) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: parent_id.to_string(),
            user_id,
            is_dir: true,
            name: name.to_string(),
            path: path.to_string(),
            betag: String::new(),
            size: 0,
            category: String::new(),
            mime: String::new(),
            bucket: String::new(),
            create_time: now,
            modify_time: now,
            operation_time: now,
            trash: TrashState::Normal,
        }
    }

    fn root(user_id: u64) -> Self {
        let mut root = Self::folder(user_id, "", "", "");
        root.id = String::new();
        root
    }

    /// Path of this folder's children. Only meaningful for folders.
    pub fn full_path(&self) -> String {
        if self.name.is_empty() {
            ROOT_PATH.to_string()
        } else {
            format!("{}{}/", self.path, self.name)
        }
    }
}

/// Lookups the upload service needs from the metadata database.
pub trait MetadataStore: Send + Sync {
    fn lookup_file_by_path(
        &self,
        user_id: u64,
        parent_path: &str,
        name: &str,
        trash: TrashState,
    ) -> Result<FileRecord>;

    fn insert_file_record(&self, record: FileRecord, parent_id: &str) -> Result<()>;

    fn get_record_by_id(&self, id: &str) -> Result<FileRecord>;

    fn update_operation_time(&self, id: &str, time: i64) -> Result<()>;

    /// Return the folder at `path`, creating missing ancestors.
    fn ensure_folder(&self, user_id: u64, path: &str) -> Result<FileRecord>;
}

/// In-memory [`MetadataStore`].
#[derive(Debug, Default)]
pub struct MemoryMetadata {
    records: RwLock<HashMap<String, FileRecord>>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(
        records: &HashMap<String, FileRecord>,
        user_id: u64,
        parent_path: &str,
        name: &str,
        trash: TrashState,
    ) -> Option<FileRecord> {
        records
            .values()
            .find(|r| {
                r.user_id == user_id && r.path == parent_path && r.name == name && r.trash == trash
            })
            .cloned()
    }
}

impl MetadataStore for MemoryMetadata {
    fn lookup_file_by_path(
        &self,
        user_id: u64,
        parent_path: &str,
        name: &str,
        trash: TrashState,
    ) -> Result<FileRecord> {
        let records = self.records.read().unwrap();
        Self::find(&records, user_id, parent_path, name, trash)
            .ok_or_else(|| MetadataError::NotFound(format!("{}{}", parent_path, name)))
    }

    fn insert_file_record(&self, mut record: FileRecord, parent_id: &str) -> Result<()> {
        let mut records = self.records.write().unwrap();
        if !parent_id.is_empty() && !records.get(parent_id).is_some_and(|p| p.is_dir) {
            return Err(MetadataError::NotFound(parent_id.to_string()));
        }
        if records.contains_key(&record.id)
            || Self::find(&records, record.user_id, &record.path, &record.name, record.trash)
                .is_some()
        {
            return Err(MetadataError::Conflict(format!(
                "{}{}",
                record.path, record.name
            )));
        }
        record.parent_id = parent_id.to_string();
        records.insert(record.id.clone(), record);
        Ok(())
    }

    fn get_record_by_id(&self, id: &str) -> Result<FileRecord> {
        self.records
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))
    }

    fn update_operation_time(&self, id: &str, time: i64) -> Result<()> {
        let mut records = self.records.write().unwrap();
        let record = records
            .get_mut(id)
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))?;
        record.operation_time = time;
        Ok(())
    }

    fn ensure_folder(&self, user_id: u64, path: &str) -> Result<FileRecord> {
        let mut records = self.records.write().unwrap();
        let mut current = FileRecord::root(user_id);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(MetadataError::Backend(format!("invalid folder path {:?}", path)));
            }
            let parent_path = current.full_path();
            current = match Self::find(&records, user_id, &parent_path, segment, TrashState::Normal)
            {
                Some(found) if found.is_dir => found,
                Some(_) => {
                    return Err(MetadataError::Conflict(format!(
                        "{}{} is a file",
                        parent_path, segment
                    )))
                }
                None => {
                    let folder = FileRecord::folder(user_id, &current.id, &parent_path, segment);
                    records.insert(folder.id.clone(), folder.clone());
                    folder
                }
            };
        }
        Ok(current)
    }
}

/// Mime type guessed from the file name.
pub fn mime_of(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or(DEFAULT_MIME)
        .to_string()
}

/// Coarse category shown in file listings.
pub fn category_of(name: &str) -> &'static str {
    let Some(mime) = mime_guess::from_path(name).first() else {
        return "other";
    };
    match mime.type_().as_str() {
        "image" => "picture",
        "video" => "video",
        "audio" => "audio",
        "text" => "document",
        "application" if is_document(mime.subtype().as_str()) => "document",
        _ => "other",
    }
}

fn is_document(subtype: &str) -> bool {
    subtype == "pdf"
        || subtype == "msword"
        || subtype == "rtf"
        || subtype.starts_with("vnd.openxmlformats-officedocument")
        || subtype.starts_with("vnd.ms-")
        || subtype.starts_with("vnd.oasis.opendocument")
}

/// The `n`th collision-free variant of `name`: `stem(n).ext`.
pub fn numbered_name(name: &str, n: u32) -> String {
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if !stem.is_empty() => format!("{}({}).{}", stem, n, ext),
        _ => format!("{}({})", name, n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_of() {
        assert_eq!(category_of(""), "other");
        assert_eq!(category_of("x.jpg"), "picture");
        assert_eq!(category_of("x.avi"), "video");
        assert_eq!(category_of("x.pptx"), "document");
        assert_eq!(category_of("x.docx"), "document");
        assert_eq!(category_of("x.mp3"), "audio");
        assert_eq!(category_of("x.jpgxxxxx"), "other");
    }

    #[test]
    fn test_mime_of() {
        assert_eq!(mime_of(""), DEFAULT_MIME);
        assert_eq!(mime_of("x.jpg"), "image/jpeg");
        assert_eq!(mime_of("noext"), DEFAULT_MIME);
    }

    #[test]
    fn test_numbered_name() {
        assert_eq!(numbered_name("a.txt", 1), "a(1).txt");
        assert_eq!(numbered_name("a.tar.gz", 2), "a.tar(2).gz");
        assert_eq!(numbered_name("README", 3), "README(3)");
        assert_eq!(numbered_name(".bashrc", 1), ".bashrc(1)");
    }

    #[test]
    fn test_ensure_folder_creates_ancestors_once() {
        let meta = MemoryMetadata::new();
        let leaf = meta.ensure_folder(7, "/photos/2024").unwrap();
        assert!(leaf.is_dir);
        assert_eq!(leaf.path, "/photos/");
        assert_eq!(leaf.full_path(), "/photos/2024/");
        assert_eq!(meta.len(), 2);

        let again = meta.ensure_folder(7, "photos/2024/").unwrap();
        assert_eq!(again.id, leaf.id);
        assert_eq!(meta.len(), 2);

        let parent = meta.get_record_by_id(&leaf.parent_id).unwrap();
        assert_eq!(parent.name, "photos");

        let root = meta.ensure_folder(7, "/").unwrap();
        assert_eq!(root.full_path(), ROOT_PATH);
    }

    #[test]
    fn test_insert_and_lookup() {
        let meta = MemoryMetadata::new();
        let folder = meta.ensure_folder(1, "/docs").unwrap();
        let record = FileRecord::file(1, &folder, "a.pdf", "ab", 10);
        meta.insert_file_record(record.clone(), &folder.id).unwrap();

        let found = meta
            .lookup_file_by_path(1, "/docs/", "a.pdf", TrashState::Normal)
            .unwrap();
        assert_eq!(found.id, record.id);
        assert_eq!(found.category, "document");
        assert!(matches!(
            meta.lookup_file_by_path(2, "/docs/", "a.pdf", TrashState::Normal),
            Err(MetadataError::NotFound(_))
        ));

        let dup = FileRecord::file(1, &folder, "a.pdf", "cd", 10);
        assert!(matches!(
            meta.insert_file_record(dup, &folder.id),
            Err(MetadataError::Conflict(_))
        ));

        meta.update_operation_time(&record.id, 42).unwrap();
        assert_eq!(meta.get_record_by_id(&record.id).unwrap().operation_time, 42);
    }

    #[test]
    fn test_insert_requires_existing_parent() {
        let meta = MemoryMetadata::new();
        let root = meta.ensure_folder(1, "/").unwrap();
        let record = FileRecord::file(1, &root, "a.txt", "ab", 1);
        assert!(matches!(
            meta.insert_file_record(record, "missing"),
            Err(MetadataError::NotFound(_))
        ));
    }
}
