//! Generates per-role volume keys, formats the LUKS containers and opens
//! them under their deterministic mapper names.
//!
//! Keys never touch the disk from this layer; they are returned to the
//! orchestrator, which hands them to the external sealing service.

use anyhow::{bail, Context as _, Result};
use indexmap::IndexMap;

use crate::{
    error::InstallError,
    fs::tools::BlockTools,
    gadget::{
        layout::{LaidOutStructure, LaidOutVolume},
        Role,
    },
    types::{EncryptionKey, EncryptionType},
};

/// One encrypted partition: the raw node it lives on, the mapper node the
/// filesystem goes to, and the key that opened it.
#[derive(Debug, Clone)]
pub struct EncryptedPartition {
    pub role: Role,
    pub raw_node: String,
    pub mapper_node: String,
    pub key: EncryptionKey,
}

/// Result of encrypting the writable partitions, keyed by filesystem label.
/// Consumed by the content writer to redirect mounts to the mapper nodes.
#[derive(Debug, Default)]
pub struct EncryptionSetupData {
    parts: IndexMap<String, EncryptedPartition>,
}

impl EncryptionSetupData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: String, part: EncryptedPartition) {
        self.parts.insert(label, part);
    }

    pub fn get(&self, label: &str) -> Option<&EncryptedPartition> {
        self.parts.get(label)
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EncryptedPartition)> {
        self.parts.iter()
    }

    /// Key material per role, for the caller to hand to the sealing service.
    pub fn key_for_role(&self) -> IndexMap<Role, EncryptionKey> {
        self.parts
            .values()
            .map(|p| (p.role, p.key.clone()))
            .collect()
    }
}

/// Roles whose partitions are encrypted on an encrypted install.
const ENCRYPTED_ROLES: [Role; 2] = [Role::SystemSave, Role::SystemData];

/// Encrypt the writable partitions of the volume, system-save and
/// system-data. `devices` maps structure name to the raw partition node; a
/// missing assignment for either role is an error.
pub async fn encrypt_partitions(
    volume: &LaidOutVolume,
    devices: &IndexMap<String, String>,
    encryption_type: EncryptionType,
    tools: &dyn BlockTools,
) -> Result<EncryptionSetupData> {
    let targets: Vec<&LaidOutStructure> = volume
        .structures
        .iter()
        .filter(|s| s.role().is_some_and(|r| ENCRYPTED_ROLES.contains(&r)))
        .collect();
    encrypt_structures(&targets, devices, encryption_type, tools).await
}

/// Encrypt exactly the given structures. Factory reset uses this to rekey
/// system-data alone while system-save keeps its existing container.
pub(crate) async fn encrypt_structures(
    targets: &[&LaidOutStructure],
    devices: &IndexMap<String, String>,
    encryption_type: EncryptionType,
    tools: &dyn BlockTools,
) -> Result<EncryptionSetupData> {
    match encryption_type {
        EncryptionType::Luks => {}
        other => bail!(InstallError::UnsupportedEncryption(other.to_string())),
    }

    let mut setup = EncryptionSetupData::new();
    for s in targets {
        let role = s.role().ok_or_else(|| {
            InstallError::LayoutInvalid(format!("structure {:?} has no role", s.name()))
        })?;
        let raw_node = devices.get(s.name()).cloned().ok_or_else(|| {
            InstallError::BadInput(format!(
                "device for volume structure {:?} cannot be empty",
                s.name()
            ))
        })?;
        let label = s.fs_label().ok_or_else(|| {
            InstallError::LayoutInvalid(format!(
                "structure {:?} declares no filesystem to encrypt",
                s.name()
            ))
        })?;

        tracing::info!("encrypting partition {raw_node} for role {role}");
        let key = EncryptionKey::generate()?;
        tools
            .format_encrypted_device(&key, encryption_type, &format!("{label}-enc"), &raw_node)
            .await
            .with_context(|| format!("cannot format encrypted partition {raw_node}"))?;
        tools
            .open_encrypted_device(&key, &raw_node, &label)
            .await
            .with_context(|| format!("cannot open encrypted partition {raw_node}"))?;

        setup.insert(
            label.clone(),
            EncryptedPartition {
                role,
                raw_node,
                mapper_node: format!("/dev/mapper/{label}"),
                key,
            },
        );
    }
    Ok(setup)
}

/// Sanity check that every expected label maps to the expected mapper node.
/// The write path runs this before mounting anything.
pub fn check_encryption_setup(
    setup: &EncryptionSetupData,
    expected: &IndexMap<String, String>,
) -> Result<()> {
    for (label, mapper_node) in expected {
        let part = setup.get(label).ok_or_else(|| {
            InstallError::BadInput(format!("no encryption setup for label {label:?}"))
        })?;
        if part.mapper_node != *mapper_node {
            bail!(InstallError::BadInput(format!(
                "encryption setup for label {label:?} maps to {} instead of {mapper_node}",
                part.mapper_node
            )));
        }
    }
    Ok(())
}
