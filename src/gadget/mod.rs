//! The declarative gadget data model and its YAML representation.

pub mod layout;

use std::fmt::{self, Display};
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context as _, Result};
use indexmap::IndexMap;
use serde::{de, Deserialize, Serialize};

use crate::{error::InstallError, paths, types::PartitionTableSchema};

pub const MIB: u64 = 1024 * 1024;

/// Semantic tag identifying a partition across installs regardless of
/// physical device naming.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Mbr,
    SystemSeed,
    SystemSeedNull,
    SystemBoot,
    SystemSave,
    SystemData,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Mbr => "mbr",
            Role::SystemSeed => "system-seed",
            Role::SystemSeedNull => "system-seed-null",
            Role::SystemBoot => "system-boot",
            Role::SystemSave => "system-save",
            Role::SystemData => "system-data",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem declared for a structure.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    #[default]
    None,
    Vfat,
    Ext4,
}

impl Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filesystem::None => f.write_str("none"),
            Filesystem::Vfat => f.write_str("vfat"),
            Filesystem::Ext4 => f.write_str("ext4"),
        }
    }
}

/// Byte count parsed from either a bare integer or a suffixed string such
/// as `1200M` or `1G`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Size(pub u64);

impl Size {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for Size {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let suffixes: &[(&str, u64)] = &[
            ("KiB", 1024),
            ("K", 1024),
            ("MiB", MIB),
            ("M", MIB),
            ("GiB", 1024 * MIB),
            ("G", 1024 * MIB),
        ];
        for (suffix, mul) in suffixes {
            if let Some(v) = s.strip_suffix(suffix) {
                let v = v
                    .parse::<u64>()
                    .with_context(|| format!("cannot parse size {s:?}"))?;
                return Ok(Size(v * mul));
            }
        }
        let v = s
            .parse::<u64>()
            .with_context(|| format!("cannot parse size {s:?}"))?;
        Ok(Size(v))
    }
}

impl Serialize for Size {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        struct SizeVisitor;

        impl de::Visitor<'_> for SizeVisitor {
            type Value = Size;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a size string like \"1200M\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Size, E> {
                Ok(Size(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Size, E> {
                u64::try_from(v)
                    .map(Size)
                    .map_err(|_| E::custom("size cannot be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Size, E> {
                v.parse().map_err(|e| E::custom(format!("{e:#}")))
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

/// One source-to-target copy instruction for a structure's filesystem.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ContentEntry {
    /// Path relative to the gadget root.
    pub source: String,
    /// Path inside the structure's filesystem. A trailing slash keeps the
    /// source file name.
    pub target: String,
}

/// One entry of the declared disk layout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VolumeStructure {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// Partition type: an MBR byte, a GPT GUID, or the hybrid
    /// `<byte>,<guid>` form resolved against the volume schema.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub partition_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<Filesystem>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem_label: Option<String>,

    /// Declared size in bytes. A system-data structure may declare zero,
    /// meaning "fill the remainder of the disk".
    pub size: Size,

    /// Explicit start offset. When absent the structure is placed right
    /// after its predecessor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<Size>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentEntry>,
}

impl VolumeStructure {
    /// Whether this structure occupies a partition table slot. The raw MBR
    /// blob lives outside the table.
    pub fn is_partition(&self) -> bool {
        self.role != Some(Role::Mbr) && self.partition_type.as_deref() != Some("mbr")
    }

    pub fn filesystem(&self) -> Filesystem {
        self.filesystem.unwrap_or(Filesystem::None)
    }

    /// The filesystem label, defaulting to the structure name when a
    /// filesystem is declared without one.
    pub fn fs_label(&self) -> Option<String> {
        if self.filesystem() == Filesystem::None {
            return None;
        }
        Some(
            self.filesystem_label
                .clone()
                .unwrap_or_else(|| self.name.clone()),
        )
    }

    /// Resolve the declared partition type against the table schema.
    pub fn partition_type_for_schema(&self, schema: PartitionTableSchema) -> Option<String> {
        let declared = self.partition_type.as_deref()?;
        match declared.split_once(',') {
            Some((mbr_byte, guid)) => match schema {
                PartitionTableSchema::Mbr => Some(mbr_byte.to_owned()),
                PartitionTableSchema::Gpt => Some(guid.to_owned()),
            },
            None => Some(declared.to_owned()),
        }
    }
}

/// An ordered sequence of structures plus the bootloader that boots them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Volume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<PartitionTableSchema>,

    pub bootloader: String,

    pub structure: Vec<VolumeStructure>,
}

impl Volume {
    pub fn schema(&self) -> PartitionTableSchema {
        self.schema.unwrap_or(PartitionTableSchema::Gpt)
    }
}

/// The parsed gadget description: one or more named volumes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GadgetInfo {
    pub volumes: IndexMap<String, Volume>,
}

/// Read and parse `meta/gadget.yaml` below the gadget root.
pub async fn read_info(gadget_root: &Path) -> Result<GadgetInfo> {
    let path = gadget_root.join(paths::GADGET_YAML);
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("cannot read gadget description {path:?}"))?;
    let info: GadgetInfo = serde_yaml::from_str(&raw)
        .map_err(|e| InstallError::LayoutInvalid(format!("{e}")))
        .with_context(|| format!("cannot parse gadget description {path:?}"))?;
    if info.volumes.is_empty() {
        bail!(InstallError::LayoutInvalid(
            "gadget declares no volumes".into()
        ));
    }
    Ok(info)
}
