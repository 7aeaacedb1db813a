use std::fmt::{self, Debug, Display};

use anyhow::{Context as _, Result};
use clap::ValueEnum;
use rand::{rngs::OsRng, RngCore as _};
use serde::{Deserialize, Serialize};

/// Length in bytes of every per-role volume key.
pub const ENCRYPTION_KEY_SIZE: usize = 32;

/// A symmetric volume key.
///
/// Exists only in process memory until handed to the caller for sealing. The
/// Debug impl never prints the key material.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; ENCRYPTION_KEY_SIZE]);

impl EncryptionKey {
    /// Draw a fresh key from the system entropy source.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; ENCRYPTION_KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut bytes)
            .context("cannot generate encryption key")?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Encryption scheme for the system-save and system-data partitions.
#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionType {
    /// Software LUKS2 containers opened through device-mapper.
    #[value(name = "luks")]
    Luks,

    /// LUKS2 metadata with the cipher offloaded to an inline crypto engine.
    /// Accepted on the command line for forward compatibility, rejected by
    /// the engine.
    #[value(name = "luks-with-ice")]
    LuksWithIce,
}

impl Display for EncryptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionType::Luks => f.write_str("luks"),
            EncryptionType::LuksWithIce => f.write_str("luks-with-ice"),
        }
    }
}

/// Layout of the partition table found on, or declared for, a disk.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableSchema {
    Gpt,
    Mbr,
}

impl Display for PartitionTableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionTableSchema::Gpt => f.write_str("gpt"),
            PartitionTableSchema::Mbr => f.write_str("mbr"),
        }
    }
}

/// The model characteristics this engine cares about. The full model
/// assertion lives with the outer orchestration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Model {
    /// Whether the target system boots through recovery modes. Pre-modes
    /// systems are provisioned by entirely different machinery.
    pub has_modes: bool,
}
