//! Disk topology and placement.
//!
//! The disk table is loaded once from the `disk_info.json` descriptor and is
//! read-only afterwards. Free space is always probed live.
//!
//! ## Layout per disk
//!
//! ```text
//! {data_root}/{prefix}{data_folder_root}/
//! ├── .disk.info
//! ├── multipart/                 # staging data + hash files
//! └── {bucket}/ab/cd/abcd...     # finalized objects
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// Name of the per-disk staging directory for multipart uploads.
pub const STAGING_DIR: &str = "multipart";

/// Name of the per-disk mount info copy.
pub const DISK_INFO_FILE: &str = ".disk.info";

/// Stable disk identifier (the device sequence number).
pub type DiskId = u32;

/// One mounted volume, as described by the topology descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskMount {
    /// Hardware ids; unchanged by reformatting.
    #[serde(default)]
    pub hw_ids: Vec<String>,
    #[serde(default)]
    pub mount_device: String,
    /// Changes on reformat.
    #[serde(default)]
    pub device_uuid: String,
    #[serde(alias = "dviceSequenceNumber")]
    pub device_sequence_number: DiskId,
    #[serde(default)]
    pub mount_path: String,
    pub data_folder_root: String,
    #[serde(default)]
    pub mapper_name: String,
    #[serde(default, rename = "fSType")]
    pub fs_type: String,
    #[serde(default)]
    pub is_primary_storage: bool,
}

/// Topology descriptor (`disk_info.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskTopology {
    #[serde(default)]
    pub file_storage_volume_path_prefix: String,
    #[serde(default)]
    pub disk_mount_infos: Vec<DiskMount>,
}

impl DiskTopology {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let topology: DiskTopology = serde_json::from_slice(&data)?;
        if topology.disk_mount_infos.is_empty() {
            return Err(StoreError::NoDisks(path.to_path_buf()));
        }
        Ok(topology)
    }

    /// Root directory of `mount` under `data_root`.
    pub fn disk_root(&self, data_root: &Path, mount: &DiskMount) -> PathBuf {
        data_root.join(format!(
            "{}{}",
            self.file_storage_volume_path_prefix, mount.data_folder_root
        ))
    }
}

/// Source of filesystem free-space figures.
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> io::Result<u64>;

    fn total_space(&self, path: &Path) -> io::Result<u64>;
}

/// Probe backed by `statvfs` through `fs2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fs2Probe;

impl SpaceProbe for Fs2Probe {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }

    fn total_space(&self, path: &Path) -> io::Result<u64> {
        fs2::total_space(path)
    }
}

/// Probe reporting fixed figures per disk root; paths under an unknown
/// root report `default`.
#[derive(Debug, Default, Clone)]
pub struct FixedSpace {
    roots: Vec<(PathBuf, u64)>,
    default: u64,
}

impl FixedSpace {
    pub fn new(default: u64) -> Self {
        Self {
            roots: Vec::new(),
            default,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>, available: u64) -> Self {
        self.roots.push((root.into(), available));
        self
    }

    fn lookup(&self, path: &Path) -> u64 {
        self.roots
            .iter()
            .find(|(root, _)| path.starts_with(root))
            .map(|(_, v)| *v)
            .unwrap_or(self.default)
    }
}

impl SpaceProbe for FixedSpace {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        Ok(self.lookup(path))
    }

    fn total_space(&self, path: &Path) -> io::Result<u64> {
        Ok(self.lookup(path))
    }
}

/// Chosen home for a new object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub disk_id: DiskId,
    /// Two-level hashed directory, already created.
    pub dir: PathBuf,
}

/// Live usage figures for one disk.
#[derive(Debug, Clone, Serialize)]
pub struct DiskUsage {
    pub disk_id: DiskId,
    pub path: PathBuf,
    pub available: u64,
    pub total: u64,
}

/// Maps disk ids to mount roots and picks disks for new content.
pub struct DiskPlacer {
    data_root: PathBuf,
    disks: BTreeMap<DiskId, PathBuf>,
    reserved_space: u64,
    probe: Arc<dyn SpaceProbe>,
}

impl std::fmt::Debug for DiskPlacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskPlacer")
            .field("data_root", &self.data_root)
            .field("disks", &self.disks)
            .field("reserved_space", &self.reserved_space)
            .finish()
    }
}

impl DiskPlacer {
    /// Build the disk table and prepare every disk root (staging directory
    /// and `.disk.info`).
    pub fn new(
        data_root: impl Into<PathBuf>,
        topology: &DiskTopology,
        reserved_space: u64,
        probe: Arc<dyn SpaceProbe>,
    ) -> Result<Self> {
        let data_root = data_root.into();
        let mut disks = BTreeMap::new();

        for mount in &topology.disk_mount_infos {
            let root = topology.disk_root(&data_root, mount);
            fs::create_dir_all(root.join(STAGING_DIR))?;
            let info = serde_json::to_vec_pretty(mount)?;
            fs::write(root.join(DISK_INFO_FILE), info)?;
            tracing::debug!(
                disk_id = mount.device_sequence_number,
                root = %root.display(),
                primary = mount.is_primary_storage,
                "disk registered"
            );
            disks.insert(mount.device_sequence_number, root);
        }

        if disks.is_empty() {
            return Err(StoreError::NoDisks(data_root));
        }

        Ok(Self {
            data_root,
            disks,
            reserved_space,
            probe,
        })
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn reserved_space(&self) -> u64 {
        self.reserved_space
    }

    /// Disk ids in placement order.
    pub fn disk_ids(&self) -> impl Iterator<Item = DiskId> + '_ {
        self.disks.keys().copied()
    }

    pub fn disk_path(&self, disk_id: DiskId) -> Result<&Path> {
        self.disks
            .get(&disk_id)
            .map(PathBuf::as_path)
            .ok_or(StoreError::UnknownDisk(disk_id))
    }

    /// Staging directory for multipart data on `disk_id`.
    pub fn staging_dir(&self, disk_id: DiskId) -> Result<PathBuf> {
        Ok(self.disk_path(disk_id)?.join(STAGING_DIR))
    }

    /// `{disk}/{bucket}/{key[0:2]}/{key[2:4]}`, optionally created.
    pub fn object_dir(
        &self,
        disk_id: DiskId,
        bucket: &str,
        key: &str,
        create: bool,
    ) -> Result<PathBuf> {
        let (h1, h2) = hash_prefix(key)?;
        let dir = self.disk_path(disk_id)?.join(bucket).join(h1).join(h2);
        if create {
            fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }

    /// Absolute path of object `key` on `disk_id`.
    pub fn path_for(&self, disk_id: DiskId, bucket: &str, key: &str) -> Result<PathBuf> {
        Ok(self.object_dir(disk_id, bucket, key, false)?.join(key))
    }

    /// `path` with the data root stripped, for subsystems that must not see
    /// the mount layout.
    pub fn relative_path(&self, path: &Path) -> Result<PathBuf> {
        path.strip_prefix(&self.data_root)
            .map(Path::to_path_buf)
            .map_err(|_| StoreError::OutsideDataRoot(path.to_path_buf()))
    }

    /// Pick the first disk whose free space minus the reserved floor can
    /// hold `estimated_size` bytes.
    pub fn choose_placement(
        &self,
        bucket: &str,
        key: &str,
        estimated_size: u64,
    ) -> Result<Placement> {
        hash_prefix(key)?;
        for &disk_id in self.disks.keys() {
            let dir = self.object_dir(disk_id, bucket, key, true)?;
            let available = match self.probe.available_space(&dir) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(disk_id, error = %e, "free space probe failed, skipping disk");
                    continue;
                }
            };
            let usable = available.saturating_sub(self.reserved_space);
            tracing::debug!(disk_id, available, usable, estimated_size, "placement candidate");
            if usable >= estimated_size {
                return Ok(Placement { disk_id, dir });
            }
        }
        Err(StoreError::InsufficientSpace {
            requested: estimated_size,
        })
    }

    /// Live usage of every disk.
    pub fn disk_usage(&self) -> Vec<DiskUsage> {
        self.disks
            .iter()
            .map(|(&disk_id, path)| DiskUsage {
                disk_id,
                path: path.clone(),
                available: self.probe.available_space(path).unwrap_or(0),
                total: self.probe.total_space(path).unwrap_or(0),
            })
            .collect()
    }
}

/// Two-level directory names derived from a key.
pub fn hash_prefix(key: &str) -> Result<(&str, &str)> {
    if key.len() < 4 || !key.is_char_boundary(4) {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok((&key[..2], &key[2..4]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn topology(n: u32) -> DiskTopology {
        DiskTopology {
            file_storage_volume_path_prefix: "bp_part_".to_string(),
            disk_mount_infos: (1..=n)
                .map(|i| DiskMount {
                    hw_ids: vec![format!("hw{:04}", i)],
                    mount_device: format!("/dev/sd{}", i),
                    device_uuid: format!("uuid-{}", i),
                    device_sequence_number: i,
                    mount_path: String::new(),
                    data_folder_root: format!("disk{}", i),
                    mapper_name: String::new(),
                    fs_type: "ext4".to_string(),
                    is_primary_storage: i == 1,
                })
                .collect(),
        }
    }

    #[test]
    fn test_new_prepares_disk_roots() {
        let temp = TempDir::new().unwrap();
        let placer =
            DiskPlacer::new(temp.path(), &topology(2), 0, Arc::new(FixedSpace::new(u64::MAX)))
                .unwrap();

        for id in placer.disk_ids() {
            let root = placer.disk_path(id).unwrap();
            assert!(root.starts_with(temp.path()));
            assert!(root.join(STAGING_DIR).is_dir());
            let info: DiskMount =
                serde_json::from_slice(&fs::read(root.join(DISK_INFO_FILE)).unwrap()).unwrap();
            assert_eq!(info.device_sequence_number, id);
        }
        assert_eq!(
            placer.disk_path(1).unwrap(),
            temp.path().join("bp_part_disk1")
        );
    }

    #[test]
    fn test_path_for_layout() {
        let temp = TempDir::new().unwrap();
        let placer =
            DiskPlacer::new(temp.path(), &topology(1), 0, Arc::new(FixedSpace::new(u64::MAX)))
                .unwrap();
        let path = placer.path_for(1, "files", "16abcdef").unwrap();
        assert_eq!(
            path,
            temp.path().join("bp_part_disk1/files/16/ab/16abcdef")
        );
        assert_eq!(
            placer.relative_path(&path).unwrap(),
            PathBuf::from("bp_part_disk1/files/16/ab/16abcdef")
        );
    }

    #[test]
    fn test_short_key_rejected() {
        let temp = TempDir::new().unwrap();
        let placer =
            DiskPlacer::new(temp.path(), &topology(1), 0, Arc::new(FixedSpace::new(u64::MAX)))
                .unwrap();
        assert!(matches!(
            placer.path_for(1, "files", "abc"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(
            placer.choose_placement("files", "ab", 1),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_choose_first_disk_with_room() {
        let temp = TempDir::new().unwrap();
        let probe = FixedSpace::new(0)
            .with_root(temp.path().join("bp_part_disk1"), 1000)
            .with_root(temp.path().join("bp_part_disk2"), 10_000);
        let placer = DiskPlacer::new(temp.path(), &topology(2), 500, Arc::new(probe)).unwrap();

        let small = placer.choose_placement("files", "0aabbccdd", 400).unwrap();
        assert_eq!(small.disk_id, 1);
        assert!(small.dir.ends_with("files/0a/ab"));
        assert!(small.dir.is_dir());

        let large = placer.choose_placement("files", "0aabbccdd", 600).unwrap();
        assert_eq!(large.disk_id, 2);
    }

    #[test]
    fn test_insufficient_space_everywhere() {
        let temp = TempDir::new().unwrap();
        let placer =
            DiskPlacer::new(temp.path(), &topology(3), 4096, Arc::new(FixedSpace::new(5000)))
                .unwrap();
        let err = placer.choose_placement("files", "0aabbccdd", 905).unwrap_err();
        assert!(matches!(err, StoreError::InsufficientSpace { requested: 905 }));
        assert!(placer.choose_placement("files", "0aabbccdd", 904).is_ok());
    }

    #[test]
    fn test_topology_accepts_legacy_sequence_field() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("disk_info.json");
        fs::write(
            &path,
            r#"{
                "fileStorageVolumePathPrefix": "bp_part_",
                "diskMountInfos": [
                    {"hwIds": ["52fa9e6c"], "dviceSequenceNumber": 3, "dataFolderRoot": "nvme_1",
                     "fSType": "ext4", "isPrimaryStorage": true}
                ]
            }"#,
        )
        .unwrap();
        let topo = DiskTopology::load(&path).unwrap();
        assert_eq!(topo.disk_mount_infos[0].device_sequence_number, 3);
        assert_eq!(topo.disk_mount_infos[0].fs_type, "ext4");
    }

    #[test]
    fn test_empty_topology_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("disk_info.json");
        fs::write(&path, r#"{"diskMountInfos": []}"#).unwrap();
        assert!(matches!(
            DiskTopology::load(&path),
            Err(StoreError::NoDisks(_))
        ));
    }
}
