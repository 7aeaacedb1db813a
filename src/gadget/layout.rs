//! Resolves a declared volume into concrete byte offsets and locates the
//! disk carrying the seed partition on the running system.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context as _, Result};
use indexmap::IndexMap;

use crate::{
    disk::DiskProbe,
    error::InstallError,
    gadget::{self, ContentEntry, Filesystem, Role, Volume, VolumeStructure, MIB},
    paths,
    types::PartitionTableSchema,
};

/// A structure with its byte geometry resolved. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct LaidOutStructure {
    pub structure: VolumeStructure,

    /// Absolute start offset on the disk, in bytes.
    pub start_offset: u64,

    /// Declared size in bytes. Zero for a fill-remainder system-data
    /// structure; the planner resolves the actual extent against the disk.
    pub size: u64,

    /// One-based slot in the partition table, zero for raw structures.
    pub partition_index: u32,
}

impl LaidOutStructure {
    pub fn name(&self) -> &str {
        &self.structure.name
    }

    pub fn role(&self) -> Option<Role> {
        self.structure.role
    }

    pub fn filesystem(&self) -> Filesystem {
        self.structure.filesystem()
    }

    pub fn fs_label(&self) -> Option<String> {
        self.structure.fs_label()
    }

    pub fn content(&self) -> &[ContentEntry] {
        &self.structure.content
    }
}

/// A volume with every structure's geometry resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct LaidOutVolume {
    pub name: String,
    pub schema: PartitionTableSchema,
    pub structures: Vec<LaidOutStructure>,
}

impl LaidOutVolume {
    pub fn structure_with_role(&self, role: Role) -> Option<&LaidOutStructure> {
        self.structures.iter().find(|s| s.role() == Some(role))
    }

    /// Structures occupying partition table slots, in table order.
    pub fn partitions(&self) -> impl Iterator<Item = &LaidOutStructure> {
        self.structures.iter().filter(|s| s.structure.is_partition())
    }
}

/// Lay out and validate a single declared volume.
pub fn lay_out_volume(name: &str, volume: &Volume) -> Result<LaidOutVolume> {
    let mut structures = Vec::with_capacity(volume.structure.len());
    let mut seen_roles: HashSet<Role> = HashSet::new();
    let mut cursor = 0u64;
    let mut partition_index = 0u32;

    for (i, s) in volume.structure.iter().enumerate() {
        if let Some(role) = s.role {
            if !seen_roles.insert(role) {
                bail!(InstallError::LayoutInvalid(format!(
                    "volume {name}: role {role} declared more than once"
                )));
            }
        }
        if s.filesystem_label.is_some() && s.filesystem() == Filesystem::None {
            bail!(InstallError::LayoutInvalid(format!(
                "volume {name}: structure {:?} sets filesystem-label without a filesystem",
                s.name
            )));
        }
        if s.is_partition() && s.partition_type.is_none() {
            bail!(InstallError::LayoutInvalid(format!(
                "volume {name}: structure {:?} has no partition type",
                s.name
            )));
        }
        if s.size.bytes() == 0 {
            if s.role != Some(Role::SystemData) {
                bail!(InstallError::LayoutInvalid(format!(
                    "volume {name}: structure {:?} declares size 0",
                    s.name
                )));
            }
            if i != volume.structure.len() - 1 {
                bail!(InstallError::LayoutInvalid(format!(
                    "volume {name}: fill-remainder system-data must be the last structure"
                )));
            }
        }

        // Partitions are never placed inside the first MiB; the partition
        // table and the raw MBR blob live there.
        let start = match s.offset {
            Some(offset) => offset.bytes(),
            None if s.is_partition() && cursor < MIB => MIB,
            None => cursor,
        };
        if start < cursor {
            bail!(InstallError::LayoutInvalid(format!(
                "volume {name}: structure {:?} overlaps its predecessor",
                s.name
            )));
        }

        if s.is_partition() {
            partition_index += 1;
        }
        structures.push(LaidOutStructure {
            structure: s.clone(),
            start_offset: start,
            size: s.size.bytes(),
            partition_index: if s.is_partition() { partition_index } else { 0 },
        });
        cursor = start + s.size.bytes();
    }

    Ok(LaidOutVolume {
        name: name.to_owned(),
        schema: volume.schema(),
        structures,
    })
}

/// Parse the gadget description and lay out every declared volume.
pub async fn lay_out_gadget(gadget_root: &Path) -> Result<IndexMap<String, LaidOutVolume>> {
    let info = gadget::read_info(gadget_root).await?;
    let mut laid_out = IndexMap::with_capacity(info.volumes.len());
    for (name, volume) in &info.volumes {
        laid_out.insert(name.clone(), lay_out_volume(name, volume)?);
    }
    Ok(laid_out)
}

/// Locate the disk whose partition carries the system-seed role, by
/// following the by-partlabel symlink udev maintains for the seed's
/// filesystem label and resolving upward to the parent disk.
pub async fn disk_with_system_seed(
    volume: &LaidOutVolume,
    probe: &dyn DiskProbe,
) -> Result<String> {
    let seed = volume
        .structure_with_role(Role::SystemSeed)
        .ok_or_else(|| {
            InstallError::BadInput("cannot find role system-seed in gadget".into())
        })?;
    let label = seed.fs_label().ok_or_else(|| {
        InstallError::LayoutInvalid(format!(
            "system-seed structure {:?} has no filesystem label",
            seed.name()
        ))
    })?;

    let link = paths::by_partlabel_dir().await.join(&label);
    let part_node = tokio::fs::canonicalize(&link)
        .await
        .map_err(|_| anyhow::Error::new(InstallError::DeviceNotFound(link.display().to_string())))
        .context("cannot find device for role system-seed")?;

    let disk = probe
        .disk_from_partition(&part_node.to_string_lossy())
        .await
        .context("cannot find device for role system-seed")?;
    Ok(disk.dev_node)
}
