//! Translates a block device path into an abstract description of the
//! containing disk: sector size, partition table schema and the identifying
//! attributes of every partition currently on it.
//!
//! Probing shells out to `lsblk`, `sfdisk` and `blockdev` and parses their
//! JSON or numeric output. It is idempotent and side-effect free.

use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::{
    error::InstallError, fs::cmd::CheckToolOutput as _, types::PartitionTableSchema,
};

/// One partition as observed on a disk. Sizes and offsets are bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbedPartition {
    /// One-based slot in the partition table.
    pub index: u32,
    pub dev_node: String,
    pub start: u64,
    pub size: u64,
    pub partition_type: String,
    pub partition_label: Option<String>,
    pub partition_uuid: Option<String>,
    pub filesystem_label: Option<String>,
    pub filesystem_uuid: Option<String>,
}

/// Observed state of a whole disk immediately before planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedDisk {
    pub dev_node: String,
    /// Kernel major:minor of the disk device.
    pub dev_num: String,
    /// Resolved sysfs path of the disk device.
    pub dev_path: String,
    pub size: u64,
    pub sector_size: u64,
    pub schema: PartitionTableSchema,
    /// Partition table identifier: the GPT disk GUID or the 32-bit MBR id.
    pub disk_id: String,
    pub partitions: Vec<ProbedPartition>,
}

impl ProbedDisk {
    pub fn partition_at_start(&self, start: u64) -> Option<&ProbedPartition> {
        self.partitions.iter().find(|p| p.start == start)
    }
}

/// Kernel device node of partition `index` on `disk_dev`, following the
/// kernel's naming rule for disks whose name ends in a digit.
pub fn partition_node(disk_dev: &str, index: u32) -> String {
    if disk_dev.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{disk_dev}p{index}")
    } else {
        format!("{disk_dev}{index}")
    }
}

/// Disk interrogation seam. The production implementation shells out to the
/// block tooling; tests substitute canned descriptions.
#[async_trait]
pub trait DiskProbe: Send + Sync {
    /// Resolve a partition device node to a description of its parent disk.
    async fn disk_from_partition(&self, part_dev: &str) -> Result<ProbedDisk>;

    /// Describe the given disk device.
    async fn disk_from_name(&self, dev: &str) -> Result<ProbedDisk>;
}

#[derive(Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(rename = "maj:min", default)]
    maj_min: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    children: Option<Vec<LsblkDevice>>,
}

impl LsblkDevice {
    fn path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/dev/{}", self.name))
    }
}

#[derive(Deserialize)]
struct SfdiskOutput {
    partitiontable: SfdiskTable,
}

#[derive(Deserialize)]
struct SfdiskTable {
    label: String,
    id: String,
    partitions: Vec<SfdiskPartition>,
}

#[derive(Deserialize)]
struct SfdiskPartition {
    node: String,
    /// Sectors.
    start: u64,
    /// Sectors.
    size: u64,
    #[serde(rename = "type")]
    partition_type: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

pub struct SystemDiskProbe;

#[async_trait]
impl DiskProbe for SystemDiskProbe {
    async fn disk_from_partition(&self, part_dev: &str) -> Result<ProbedDisk> {
        let raw = Command::new("lsblk")
            .args(["-J", "-b", "--paths", "--inverse", "-o", "NAME,TYPE"])
            .arg(part_dev)
            .run_tool()
            .await
            .with_context(|| format!("cannot list parents of {part_dev}"))?;
        let parsed: LsblkOutput =
            serde_json::from_slice(&raw).context("cannot parse lsblk output")?;

        // In inverse mode the partition comes first and its ancestors hang
        // off it as children.
        let mut cursor = parsed.blockdevices.into_iter().next();
        while let Some(dev) = cursor {
            if matches!(dev.kind.as_deref(), Some("disk") | Some("loop") | Some("mpath")) {
                return self.disk_from_name(&dev.path()).await;
            }
            cursor = dev.children.and_then(|c| c.into_iter().next());
        }
        bail!(InstallError::DeviceNotFound(format!(
            "no parent disk for partition {part_dev}"
        )))
    }

    async fn disk_from_name(&self, dev: &str) -> Result<ProbedDisk> {
        let raw = Command::new("sfdisk")
            .args(["-J", dev])
            .run_tool()
            .await
            .with_context(|| format!("cannot read partition table of {dev}"))?;
        let table: SfdiskOutput =
            serde_json::from_slice(&raw).context("cannot parse sfdisk output")?;
        let table = table.partitiontable;

        let schema = match table.label.as_str() {
            "gpt" => PartitionTableSchema::Gpt,
            "dos" => PartitionTableSchema::Mbr,
            other => bail!(InstallError::UnsupportedSchema(other.to_owned())),
        };

        let raw = Command::new("lsblk")
            .args(["-J", "-b", "-O"])
            .arg(dev)
            .run_tool()
            .await
            .with_context(|| format!("cannot list block device {dev}"))?;
        let listed: LsblkOutput =
            serde_json::from_slice(&raw).context("cannot parse lsblk output")?;
        let listed = listed
            .blockdevices
            .into_iter()
            .next()
            .ok_or_else(|| InstallError::DeviceNotFound(dev.to_owned()))?;

        let sector_size = sector_size_of(dev).await?;
        let dev_num = listed
            .maj_min
            .clone()
            .ok_or_else(|| InstallError::DeviceNotFound(format!("no device number for {dev}")))?;
        let dev_path = sysfs_path_for_block_device(&dev_num).await?;

        let children = listed.children.unwrap_or_default();
        let mut partitions = Vec::with_capacity(table.partitions.len());
        for p in &table.partitions {
            let child = children.iter().find(|c| c.path() == p.node);
            partitions.push(ProbedPartition {
                index: partition_index_of_node(&p.node)?,
                dev_node: p.node.clone(),
                start: p.start * sector_size,
                size: p.size * sector_size,
                partition_type: p.partition_type.clone(),
                partition_label: p.name.clone(),
                partition_uuid: p.uuid.clone(),
                filesystem_label: child.and_then(|c| c.label.clone()),
                filesystem_uuid: child.and_then(|c| c.uuid.clone()),
            });
        }

        Ok(ProbedDisk {
            dev_node: dev.to_owned(),
            dev_num,
            dev_path,
            size: listed
                .size
                .ok_or_else(|| InstallError::DeviceNotFound(format!("no size for {dev}")))?,
            sector_size,
            schema,
            disk_id: table.id,
            partitions,
        })
    }
}

async fn sector_size_of(dev: &str) -> Result<u64> {
    let out = Command::new("blockdev")
        .args(["--getss", dev])
        .run_tool()
        .await
        .with_context(|| format!("cannot query sector size of {dev}"))?;
    String::from_utf8_lossy(&out)
        .trim()
        .parse()
        .context("cannot parse blockdev output")
}

/// Resolve a major:minor pair to its sysfs device directory.
async fn sysfs_path_for_block_device(dev_num: &str) -> Result<String> {
    let link = PathBuf::from("/sys/dev/block").join(dev_num);
    let resolved = tokio::fs::canonicalize(&link)
        .await
        .with_context(|| format!("cannot resolve sysfs path {link:?}"))?;
    Ok(resolved.to_string_lossy().into_owned())
}

fn partition_index_of_node(node: &str) -> Result<u32> {
    let digits: String = node
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits
        .parse()
        .with_context(|| format!("cannot derive partition index from node {node}"))
}
