//! Thin wrappers around the external block-layer tools: the partitioner,
//! the filesystem builders, udev settlement, the mounter and cryptsetup.
//!
//! Everything goes through the [`BlockTools`] trait so the orchestration
//! above can be exercised against recording doubles.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::{
    error::InstallError,
    fs::cmd::CheckToolOutput as _,
    gadget::Filesystem,
    types::{EncryptionKey, EncryptionType},
};

/// How long to wait for the kernel to publish freshly created partition
/// nodes.
pub const DEFAULT_NODES_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound handed to `udevadm settle` after a partition table rewrite.
pub const SETTLE_TIMEOUT_SECS: u32 = 180;

#[async_trait]
pub trait BlockTools: Send + Sync {
    /// Delete the given partition indices, then append the partitions
    /// described by `script` (sfdisk input format, sector units), refreshing
    /// the kernel's view of the table after each change.
    async fn apply_partition_changes(
        &self,
        disk_dev: &str,
        deletes: &[u32],
        script: &str,
    ) -> Result<()>;

    /// Block until every listed node exists, or fail with a timeout.
    async fn ensure_nodes_exist(&self, nodes: &[String], timeout: Duration) -> Result<()>;

    /// Trigger and settle udev for one node so its by-label symlinks are in
    /// place before the node is used.
    async fn settle(&self, node: &str) -> Result<()>;

    async fn make_filesystem(
        &self,
        fs: Filesystem,
        node: &str,
        label: &str,
        size: u64,
        sector_size: u64,
    ) -> Result<()>;

    async fn mount(&self, source: &str, target: &Path, fs: Filesystem) -> Result<()>;

    async fn unmount(&self, target: &Path) -> Result<()>;

    /// LUKS-format `node` with `key` in keyslot 0 at priority `prefer`.
    async fn format_encrypted_device(
        &self,
        key: &EncryptionKey,
        encryption_type: EncryptionType,
        label: &str,
        node: &str,
    ) -> Result<()>;

    /// Open a formatted container under `/dev/mapper/<name>`.
    async fn open_encrypted_device(
        &self,
        key: &EncryptionKey,
        node: &str,
        name: &str,
    ) -> Result<()>;

    /// Logical sector size the block layer reports for `node`.
    async fn sector_size(&self, node: &str) -> Result<u64>;
}

/// Ask the kernel to re-read the partition table.
async fn refresh_partition_table(disk_dev: &str) -> Result<()> {
    Command::new("partx")
        .args(["-u", disk_dev])
        .run_tool()
        .await
        .with_context(|| format!("cannot refresh partition table of {disk_dev}"))?;
    Ok(())
}

pub struct SystemBlockTools;

#[async_trait]
impl BlockTools for SystemBlockTools {
    async fn apply_partition_changes(
        &self,
        disk_dev: &str,
        deletes: &[u32],
        script: &str,
    ) -> Result<()> {
        if !deletes.is_empty() {
            let mut cmd = Command::new("sfdisk");
            cmd.args(["--no-reread", "--delete", disk_dev]);
            for index in deletes {
                cmd.arg(index.to_string());
            }
            cmd.run_tool()
                .await
                .with_context(|| format!("cannot delete partitions on {disk_dev}"))?;
            refresh_partition_table(disk_dev).await?;
        }

        if !script.is_empty() {
            Command::new("sfdisk")
                .args(["--append", "--no-reread", disk_dev])
                .run_tool_with_input(script.as_bytes())
                .await
                .with_context(|| format!("cannot create partitions on {disk_dev}"))?;
            refresh_partition_table(disk_dev).await?;
        }

        let timeout_arg = format!("--timeout={SETTLE_TIMEOUT_SECS}");
        Command::new("udevadm")
            .args(["settle", timeout_arg.as_str()])
            .run_tool()
            .await
            .context("cannot settle udev after repartitioning")?;
        Ok(())
    }

    async fn ensure_nodes_exist(&self, nodes: &[String], timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let missing: Vec<&str> = nodes
                .iter()
                .map(String::as_str)
                .filter(|n| !Path::new(n).exists())
                .collect();
            if missing.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(InstallError::Timeout(timeout))
                    .with_context(|| format!("device nodes missing: {}", missing.join(", ")));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn settle(&self, node: &str) -> Result<()> {
        Command::new("udevadm")
            .args(["trigger", "--settle", node])
            .run_tool()
            .await
            .with_context(|| format!("cannot settle {node}"))?;
        Ok(())
    }

    async fn make_filesystem(
        &self,
        fs: Filesystem,
        node: &str,
        label: &str,
        _size: u64,
        sector_size: u64,
    ) -> Result<()> {
        let sector_arg = sector_size.to_string();
        match fs {
            Filesystem::Vfat => {
                Command::new("mkfs.vfat")
                    .args(["-S", sector_arg.as_str(), "-n", label, node])
                    .run_tool()
                    .await
            }
            Filesystem::Ext4 => {
                let mut cmd = Command::new("mkfs.ext4");
                cmd.args(["-F", "-L", label]);
                // An ext4 block must cover the logical sector of the backing
                // device; LUKS containers report 4096.
                if sector_size > 512 {
                    cmd.args(["-b", sector_arg.as_str()]);
                }
                cmd.arg(node).run_tool().await
            }
            Filesystem::None => bail!(InstallError::BadInput(format!(
                "no filesystem declared for {node}"
            ))),
        }
        .with_context(|| format!("cannot create {fs} filesystem on {node}"))?;
        Ok(())
    }

    async fn mount(&self, source: &str, target: &Path, fs: Filesystem) -> Result<()> {
        if fs == Filesystem::None {
            bail!(InstallError::BadInput(format!(
                "cannot mount {source} without a filesystem"
            )));
        }
        let fs_arg = fs.to_string();
        Command::new("mount")
            .args(["-t", fs_arg.as_str(), source])
            .arg(target)
            .run_tool()
            .await
            .with_context(|| format!("cannot mount {source}"))?;
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        Command::new("umount")
            .arg(target)
            .run_tool()
            .await
            .with_context(|| format!("cannot unmount {target:?}"))?;
        Ok(())
    }

    async fn format_encrypted_device(
        &self,
        key: &EncryptionKey,
        encryption_type: EncryptionType,
        label: &str,
        node: &str,
    ) -> Result<()> {
        match encryption_type {
            EncryptionType::Luks => {}
            other => bail!(InstallError::UnsupportedEncryption(other.to_string())),
        }

        // Slot 0 holds a random 32-byte key, not a passphrase; the sealing
        // layer above provides the actual hardness, so the PBKDF runs at
        // minimum cost.
        Command::new("cryptsetup")
            .args([
                "-q",
                "luksFormat",
                "--type",
                "luks2",
                "--key-file",
                "-",
                "--cipher",
                "aes-xts-plain64",
                "--key-size",
                "512",
                "--label",
                label,
                "--pbkdf",
                "argon2i",
                "--pbkdf-force-iterations",
                "4",
                "--pbkdf-memory",
                "32",
                "--luks2-metadata-size",
                "2048k",
                "--luks2-keyslots-size",
                "2560k",
                node,
            ])
            .run_tool_with_input(key.as_bytes())
            .await
            .with_context(|| format!("cannot format LUKS container on {node}"))?;

        Command::new("cryptsetup")
            .args(["config", "--priority", "prefer", "--key-slot", "0", node])
            .run_tool()
            .await
            .with_context(|| format!("cannot configure keyslot priority on {node}"))?;
        Ok(())
    }

    async fn open_encrypted_device(
        &self,
        key: &EncryptionKey,
        node: &str,
        name: &str,
    ) -> Result<()> {
        Command::new("cryptsetup")
            .args(["open", "--key-file", "-", node, name])
            .run_tool_with_input(key.as_bytes())
            .await
            .with_context(|| format!("cannot open LUKS container {node} as {name}"))?;
        Ok(())
    }

    async fn sector_size(&self, node: &str) -> Result<u64> {
        let out = Command::new("blockdev")
            .args(["--getss", node])
            .run_tool()
            .await
            .with_context(|| format!("cannot query sector size of {node}"))?;
        String::from_utf8_lossy(&out)
            .trim()
            .parse()
            .context("cannot parse blockdev output")
    }
}
