//! Persists the fingerprint of the installed disk so that every subsequent
//! boot can re-identify the install disk even if kernel device numbering
//! changes.
//!
//! The document is written twice, to the data and save filesystems, and the
//! two copies must be byte-identical. Its schema must round-trip without
//! loss across every engine revision that can produce or consume it.

use std::path::Path;

use anyhow::{Context as _, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    disk::ProbedDisk,
    error::InstallError,
    gadget::{layout::LaidOutVolume, Role},
    install::encrypt::EncryptionSetupData,
    paths,
    types::PartitionTableSchema,
};

/// Current revision of the persisted document.
pub const DISK_MAPPING_VERSION: u32 = 1;

/// Identity of one structure as installed on the disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct DiskStructureDeviceTraits {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Device node the kernel assigned at install time.
    pub kernel_path: String,
    pub offset: u64,
    pub size: u64,
    pub partition_type: String,
    #[serde(default)]
    pub partition_label: String,
    #[serde(default)]
    pub partition_uuid: String,
    #[serde(default)]
    pub filesystem_label: String,
    #[serde(default)]
    pub filesystem_uuid: String,
}

/// How a structure's contents are protected on disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StructureEncryptionParameters {
    pub method: String,
}

/// Identity of one installed volume and the disk carrying it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct DiskVolumeDeviceTraits {
    pub kernel_path: String,
    /// Resolved sysfs path of the disk, stable across device renames.
    pub device_path: String,
    pub disk_id: String,
    pub size: u64,
    pub sector_size: u64,
    pub schema: PartitionTableSchema,
    pub structure: Vec<DiskStructureDeviceTraits>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub structure_encryption: IndexMap<String, StructureEncryptionParameters>,
}

/// The persisted document: a versioned map keyed by volume name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DiskVolumesMapping {
    pub version: u32,
    pub volumes: IndexMap<String, DiskVolumeDeviceTraits>,
}

/// Merge the laid-out declarations with the re-probed disk state. Must run
/// after partitioning and formatting so filesystem UUIDs are populated.
pub fn build_volume_traits(
    volume: &LaidOutVolume,
    disk: &ProbedDisk,
    encryption: Option<&EncryptionSetupData>,
) -> Result<DiskVolumeDeviceTraits> {
    let mut structures = Vec::new();
    for s in volume.partitions() {
        let p = disk.partition_at_start(s.start_offset).ok_or_else(|| {
            InstallError::IncompatibleLayout {
                device: disk.dev_node.clone(),
                reason: format!(
                    "no partition at offset {} for structure {:?}",
                    s.start_offset,
                    s.name()
                ),
            }
        })?;
        structures.push(DiskStructureDeviceTraits {
            name: s.name().to_owned(),
            role: s.role(),
            kernel_path: p.dev_node.clone(),
            offset: p.start,
            size: p.size,
            partition_type: p.partition_type.clone(),
            partition_label: p.partition_label.clone().unwrap_or_default(),
            partition_uuid: p.partition_uuid.clone().unwrap_or_default(),
            filesystem_label: p.filesystem_label.clone().unwrap_or_default(),
            filesystem_uuid: p.filesystem_uuid.clone().unwrap_or_default(),
        });
    }

    // A structure is encrypted if this operation just set it up, or if the
    // re-probe shows its container label (a preserved system-save on
    // factory reset).
    let mut structure_encryption = IndexMap::new();
    for s in volume.partitions() {
        let Some(label) = s.fs_label() else { continue };
        let container_label = format!("{label}-enc");
        let container = disk
            .partition_at_start(s.start_offset)
            .and_then(|p| p.filesystem_label.as_deref())
            == Some(container_label.as_str());
        let set_up = encryption.is_some_and(|setup| setup.get(&label).is_some());
        if container || set_up {
            structure_encryption.insert(
                label,
                StructureEncryptionParameters {
                    method: "luks".to_owned(),
                },
            );
        }
    }

    Ok(DiskVolumeDeviceTraits {
        kernel_path: disk.dev_node.clone(),
        device_path: disk.dev_path.clone(),
        disk_id: disk.disk_id.clone(),
        size: disk.size,
        sector_size: disk.sector_size,
        schema: disk.schema,
        structure: structures,
        structure_encryption,
    })
}

/// Serialise the mapping to the device directory on the data filesystem
/// and, when a save filesystem exists, a byte-identical copy next to the
/// secrets on save.
pub async fn save_storage_traits(mapping: &DiskVolumesMapping, with_save: bool) -> Result<()> {
    let bytes = serde_json::to_vec(mapping).context("cannot serialise disk mapping")?;

    let mut dirs = vec![paths::data_device_dir().await];
    if with_save {
        dirs.push(paths::save_device_dir().await);
    }
    for dir in dirs {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create device directory {dir:?}"))?;
        let path = dir.join(paths::DISK_MAPPING_FILE);
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("cannot write disk mapping {path:?}"))?;
    }
    Ok(())
}

/// Read a mapping back from a device directory.
pub async fn load_disk_volumes_mapping(dir: &Path) -> Result<DiskVolumesMapping> {
    let path = dir.join(paths::DISK_MAPPING_FILE);
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("cannot read disk mapping {path:?}"))?;
    serde_json::from_slice(&bytes).with_context(|| format!("cannot parse disk mapping {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mapping() -> DiskVolumesMapping {
        let mut volumes = IndexMap::new();
        volumes.insert(
            "pi".to_owned(),
            DiskVolumeDeviceTraits {
                kernel_path: "/dev/mmcblk0".to_owned(),
                device_path: "/sys/devices/platform/emmc2bus/block/mmcblk0".to_owned(),
                disk_id: "0x7c301cbd".to_owned(),
                size: 32010928128,
                sector_size: 512,
                schema: PartitionTableSchema::Mbr,
                structure: vec![DiskStructureDeviceTraits {
                    name: "ubuntu-seed".to_owned(),
                    role: Some(Role::SystemSeed),
                    kernel_path: "/dev/mmcblk0p1".to_owned(),
                    offset: 1048576,
                    size: 1258291200,
                    partition_type: "0c".to_owned(),
                    partition_label: String::new(),
                    partition_uuid: "7c301cbd-01".to_owned(),
                    filesystem_label: "ubuntu-seed".to_owned(),
                    filesystem_uuid: "0E09-0822".to_owned(),
                }],
                structure_encryption: IndexMap::new(),
            },
        );
        DiskVolumesMapping {
            version: DISK_MAPPING_VERSION,
            volumes,
        }
    }

    // The serialised form is an interchange format with boot-time code;
    // this literal pins it against accidental schema drift.
    const SAMPLE_JSON: &str = concat!(
        r#"{"version":1,"volumes":{"pi":{"#,
        r#""kernel-path":"/dev/mmcblk0","#,
        r#""device-path":"/sys/devices/platform/emmc2bus/block/mmcblk0","#,
        r#""disk-id":"0x7c301cbd","#,
        r#""size":32010928128,"#,
        r#""sector-size":512,"#,
        r#""schema":"mbr","#,
        r#""structure":[{"#,
        r#""name":"ubuntu-seed","#,
        r#""role":"system-seed","#,
        r#""kernel-path":"/dev/mmcblk0p1","#,
        r#""offset":1048576,"#,
        r#""size":1258291200,"#,
        r#""partition-type":"0c","#,
        r#""partition-label":"","#,
        r#""partition-uuid":"7c301cbd-01","#,
        r#""filesystem-label":"ubuntu-seed","#,
        r#""filesystem-uuid":"0E09-0822"}]}}}"#,
    );

    #[test]
    fn test_mapping_serialises_to_stable_json() {
        let rendered = serde_json::to_string(&sample_mapping()).unwrap();
        assert_eq!(rendered, SAMPLE_JSON);
    }

    #[test]
    fn test_mapping_round_trips_from_static_json() {
        let parsed: DiskVolumesMapping = serde_json::from_str(SAMPLE_JSON).unwrap();
        assert_eq!(parsed, sample_mapping());
    }

    #[test]
    fn test_encryption_parameters_round_trip() {
        let mut mapping = sample_mapping();
        mapping.volumes["pi"].structure_encryption.insert(
            "ubuntu-data".to_owned(),
            StructureEncryptionParameters {
                method: "luks".to_owned(),
            },
        );
        let rendered = serde_json::to_string(&mapping).unwrap();
        assert!(rendered.contains(r#""structure-encryption":{"ubuntu-data":{"method":"luks"}}"#));
        let parsed: DiskVolumesMapping = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed, mapping);
    }
}
