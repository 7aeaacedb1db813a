//! Well-known locations used by the engine.
//!
//! Everything is anchored below a single overridable root directory so that
//! tests can point the whole engine at a scratch tree.

use std::path::PathBuf;

use lazy_static::lazy_static;
use tokio::sync::RwLock;

/// Relative path of the gadget description inside a gadget root.
pub const GADGET_YAML: &str = "meta/gadget.yaml";

/// Scratch mount namespace used while filesystems receive their content.
pub const GADGET_INSTALL_DIR: &str = "run/gadgetpilot/gadget-install";

/// Where the caller has the fresh data filesystem mounted at install time.
pub const HOST_DATA_MOUNT: &str = "run/mnt/ubuntu-data/system-data";

/// Where the caller has the save filesystem mounted at install time.
pub const HOST_SAVE_MOUNT: &str = "run/mnt/ubuntu-save";

/// Device-identity directory inside the data filesystem. Boot-time code
/// reads the disk mapping back from here to re-identify the install disk.
pub const DATA_DEVICE_DIR: &str = "run/mnt/ubuntu-data/system-data/var/lib/snapd/device";

/// Device-identity directory inside the save filesystem, kept byte-identical
/// with the copy on data.
pub const SAVE_DEVICE_DIR: &str = "run/mnt/ubuntu-save/device";

/// File name of the persisted disk mapping.
pub const DISK_MAPPING_FILE: &str = "disk-mapping.json";

lazy_static! {
    static ref ROOT_DIR: RwLock<PathBuf> = RwLock::new(PathBuf::from("/"));
}

/// Override the root directory all well-known paths hang off. Tests only.
pub async fn set_root_dir(root: impl Into<PathBuf>) {
    *ROOT_DIR.write().await = root.into();
}

pub async fn root_dir() -> PathBuf {
    ROOT_DIR.read().await.clone()
}

pub async fn gadget_install_dir() -> PathBuf {
    root_dir().await.join(GADGET_INSTALL_DIR)
}

pub async fn data_device_dir() -> PathBuf {
    root_dir().await.join(DATA_DEVICE_DIR)
}

pub async fn save_device_dir() -> PathBuf {
    root_dir().await.join(SAVE_DEVICE_DIR)
}

pub async fn by_partlabel_dir() -> PathBuf {
    root_dir().await.join("dev/disk/by-partlabel")
}

/// Scratch mount directory name for a device node, flattening the path:
/// `/dev/mapper/ubuntu-data` becomes `dev-mapper-ubuntu-data`.
pub fn mount_dir_name_for_node(node: &str) -> String {
    node.trim_start_matches('/').replace('/', "-")
}
