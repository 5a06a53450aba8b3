//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary data root with N disk folders
//! - A matching `disk_info.json` topology descriptor
//! - A `Config` pointing at both
//!
//! # Usage
//!
//! ```ignore
//! use spacebox_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::with_disks(2).unwrap();
//!     // env.data_root, env.topology_file, env.config() are all isolated
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Prefix used for disk folders in generated topologies
pub const VOLUME_PREFIX: &str = "bp_part_";

/// Isolated data root with a generated disk topology
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Data root holding every disk folder
    pub data_root: PathBuf,
    /// Shared directory holding the topology descriptor
    pub shared_root: PathBuf,
    /// Generated `disk_info.json`
    pub topology_file: PathBuf,
    /// Sequence numbers of the generated disks (1..=N)
    pub disk_ids: Vec<u32>,
    /// Scratch directory for input files
    pub scratch: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create an environment with a single disk
    pub fn new() -> anyhow::Result<Self> {
        Self::with_disks(1)
    }

    /// Create an environment with `disks` disk folders
    pub fn with_disks(disks: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(disks > 0, "at least one disk is required");

        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let data_root = root.join("data");
        let shared_root = root.join("shared");
        let scratch = root.join("scratch");
        std::fs::create_dir_all(&data_root)?;
        std::fs::create_dir_all(&shared_root)?;
        std::fs::create_dir_all(&scratch)?;

        let disk_ids: Vec<u32> = (1..=disks).collect();
        let mounts: Vec<serde_json::Value> = disk_ids
            .iter()
            .map(|&id| {
                serde_json::json!({
                    "hwIds": [format!("test{:04}-{}", test_id, id)],
                    "mountDevice": format!("/dev/test{}", id),
                    "deviceUuid": format!("uuid-{}-{}", test_id, id),
                    "deviceSequenceNumber": id,
                    "mountPath": data_root.join(format!("{}disk{}", VOLUME_PREFIX, id)),
                    "dataFolderRoot": format!("disk{}", id),
                    "mapperName": "",
                    "fSType": "ext4",
                    "isPrimaryStorage": id == 1,
                })
            })
            .collect();
        let topology = serde_json::json!({
            "fileStorageVolumePathPrefix": VOLUME_PREFIX,
            "diskMountInfos": mounts,
        });
        let topology_file = shared_root.join("disk_info.json");
        std::fs::write(&topology_file, serde_json::to_vec_pretty(&topology)?)?;

        Ok(Self {
            _temp_dir: temp_dir,
            data_root,
            shared_root,
            topology_file,
            disk_ids,
            scratch,
            test_id,
        })
    }

    /// Config pointing at this environment, with no reserved space
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.data_root = self.data_root.clone();
        cfg.storage.shared_root = self.shared_root.clone();
        cfg.storage.topology_file = Some(self.topology_file.clone());
        cfg.storage.reserved_space = 0;
        cfg
    }

    /// Root folder of disk `id`
    pub fn disk_root(&self, id: u32) -> PathBuf {
        self.data_root.join(format!("{}disk{}", VOLUME_PREFIX, id))
    }

    /// Directory holding multipart task snapshots
    pub fn meta_dir(&self) -> PathBuf {
        self.data_root.join("multipart-meta")
    }

    /// Create an input file in the scratch directory
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.scratch.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn root(&self) -> &Path {
        self._temp_dir.path()
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
