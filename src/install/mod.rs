//! Top-level install, factory-reset, write-content and encrypt-partitions
//! entry points.
//!
//! One operation runs single-threaded on the caller's task; the only
//! suspension points are the external tool invocations. The traits file is
//! deliberately the last side effect, so its presence marks a completed
//! operation. A killed install is recovered by simply re-running it: the
//! planner diffs against whatever state the disk was left in.

pub mod content;
pub mod encrypt;
pub mod plan;
pub mod traits;

use std::path::Path;

use anyhow::{bail, Context as _, Result};
use indexmap::IndexMap;

use crate::{
    disk::{DiskProbe, ProbedDisk},
    error::InstallError,
    fs::tools::{BlockTools, DEFAULT_NODES_TIMEOUT},
    gadget::{
        layout::{self, LaidOutStructure, LaidOutVolume},
        Role,
    },
    types::{EncryptionKey, EncryptionType, Model},
};

pub use content::{write_content, ContentObserver, OnDiskStructure};
pub use encrypt::{
    check_encryption_setup, encrypt_partitions, EncryptedPartition, EncryptionSetupData,
};
pub use plan::{PartitionPlan, PlanMode};
pub use traits::{DiskVolumeDeviceTraits, DiskVolumesMapping};

/// Caller-selected behaviour of one operation.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Encrypt the writable role partitions with the given scheme.
    pub encryption_type: Option<EncryptionType>,

    /// Explicit target disk, bypassing seed-partition discovery.
    pub boot_device: Option<String>,
}

/// What the operation produced, for the sealing and boot-config layers.
#[derive(Debug)]
pub struct InstalledSystemSideData {
    /// Raw partition node per installed role.
    pub device_for_role: IndexMap<Role, String>,

    /// Freshly generated volume keys, present only on encrypted operations.
    pub key_for_role: Option<IndexMap<Role, EncryptionKey>>,
}

/// Materialise the declared layout onto the target disk and write its
/// content, optionally under full-disk encryption.
pub async fn install(
    model: &Model,
    gadget_root: &Path,
    options: &Options,
    observer: Option<&dyn ContentObserver>,
    probe: &dyn DiskProbe,
    tools: &dyn BlockTools,
) -> Result<InstalledSystemSideData> {
    run(PlanMode::Install, model, gadget_root, options, observer, probe, tools).await
}

/// Recreate boot state and user data while preserving the per-device
/// secrets held in system-save.
pub async fn factory_reset(
    model: &Model,
    gadget_root: &Path,
    options: &Options,
    observer: Option<&dyn ContentObserver>,
    probe: &dyn DiskProbe,
    tools: &dyn BlockTools,
) -> Result<InstalledSystemSideData> {
    run(PlanMode::FactoryReset, model, gadget_root, options, observer, probe, tools).await
}

async fn run(
    mode: PlanMode,
    model: &Model,
    gadget_root: &Path,
    options: &Options,
    observer: Option<&dyn ContentObserver>,
    probe: &dyn DiskProbe,
    tools: &dyn BlockTools,
) -> Result<InstalledSystemSideData> {
    if gadget_root.as_os_str().is_empty() {
        bail!(InstallError::BadInput(
            "cannot use empty gadget root directory".into()
        ));
    }
    if !model.has_modes {
        bail!(InstallError::BadInput(format!(
            "cannot run {mode} mode on pre-modes system"
        )));
    }

    let volumes = layout::lay_out_gadget(gadget_root).await?;
    let (volume_name, volume) = volumes
        .iter()
        .find(|(_, v)| v.structure_with_role(Role::SystemSeed).is_some())
        .ok_or_else(|| {
            InstallError::BadInput("cannot find role system-seed in gadget".into())
        })?;

    let disk_dev = match &options.boot_device {
        Some(dev) => dev.clone(),
        None => layout::disk_with_system_seed(volume, probe).await?,
    };
    tracing::info!("performing {mode} on {disk_dev}");

    let mut disk = probe.disk_from_name(&disk_dev).await?;
    let plan = plan::plan(volume, &disk, mode)?;

    if mode == PlanMode::Install && !(plan.creates.is_empty() && plan.deletes.is_empty()) {
        let script = plan.sfdisk_script(disk.schema, disk.sector_size);
        tools
            .apply_partition_changes(&disk.dev_node, &plan.deletes, &script)
            .await?;
        tools
            .ensure_nodes_exist(&plan.created_nodes(), DEFAULT_NODES_TIMEOUT)
            .await?;
        // capture the kernel's view of the new table
        disk = probe.disk_from_name(&disk_dev).await?;
    }

    // Raw partition node per structure name, for everything this operation
    // is going to touch.
    let devices: IndexMap<String, String> = plan
        .formats
        .iter()
        .map(|f| (f.structure_name.clone(), f.node.clone()))
        .collect();

    let encryption = match options.encryption_type {
        Some(encryption_type) => {
            let setup =
                encrypt_for_mode(mode, volume, &devices, encryption_type, tools).await?;
            // every label the layout expects must have come out of the
            // setup with its deterministic mapper node
            let expected: IndexMap<String, String> = encryption_targets(mode, volume)
                .filter_map(|s| s.fs_label())
                .map(|label| {
                    let mapper = format!("/dev/mapper/{label}");
                    (label, mapper)
                })
                .collect();
            encrypt::check_encryption_setup(&setup, &expected)?;
            Some(setup)
        }
        None => None,
    };

    // Mapper nodes depend on settled raw partitions, and mounting depends
    // on formatted filesystems; the order here is load-bearing.
    for f in &plan.formats {
        let structure = volume
            .structures
            .iter()
            .find(|s| s.name() == f.structure_name)
            .ok_or_else(|| {
                InstallError::LayoutInvalid(format!("unknown structure {:?}", f.structure_name))
            })?;
        let node = content::target_node(structure, &f.node, encryption.as_ref());
        tools.settle(&node).await?;
        let sector_size = if node == f.node {
            disk.sector_size
        } else {
            // LUKS containers publish their own logical sector size
            tools.sector_size(&node).await?
        };
        tools
            .make_filesystem(f.filesystem, &node, &f.label, f.size, sector_size)
            .await?;
    }

    content::write_content(
        gadget_root,
        volume,
        &devices,
        encryption.as_ref(),
        observer,
        tools,
    )
    .await?;

    // Re-probe so the freshly assigned filesystem UUIDs make it into the
    // persisted mapping, then record it as the final, committing step.
    let disk = probe.disk_from_name(&disk_dev).await?;
    let volume_traits = traits::build_volume_traits(volume, &disk, encryption.as_ref())?;
    let mut mapping_volumes = IndexMap::new();
    mapping_volumes.insert(volume_name.clone(), volume_traits);
    let mapping = DiskVolumesMapping {
        version: traits::DISK_MAPPING_VERSION,
        volumes: mapping_volumes,
    };
    let with_save = volume.structure_with_role(Role::SystemSave).is_some();
    traits::save_storage_traits(&mapping, with_save).await?;

    Ok(InstalledSystemSideData {
        device_for_role: device_for_role(volume, &devices, &disk),
        key_for_role: encryption.map(|setup| setup.key_for_role()),
    })
}

/// The structures an encrypted operation re-keys: on install both writable
/// roles get fresh containers; factory reset only rekeys system-data,
/// system-save keeps its existing key.
fn encryption_targets(
    mode: PlanMode,
    volume: &LaidOutVolume,
) -> impl Iterator<Item = &LaidOutStructure> {
    let roles: &'static [Role] = match mode {
        PlanMode::Install => &[Role::SystemSave, Role::SystemData],
        PlanMode::FactoryReset => &[Role::SystemData],
    };
    volume
        .structures
        .iter()
        .filter(move |s| s.role().is_some_and(|r| roles.contains(&r)))
}

async fn encrypt_for_mode(
    mode: PlanMode,
    volume: &LaidOutVolume,
    devices: &IndexMap<String, String>,
    encryption_type: EncryptionType,
    tools: &dyn BlockTools,
) -> Result<EncryptionSetupData> {
    let targets: Vec<&LaidOutStructure> = encryption_targets(mode, volume).collect();
    encrypt::encrypt_structures(&targets, devices, encryption_type, tools)
        .await
        .context("cannot set up encryption for partitions")
}

fn device_for_role(
    volume: &LaidOutVolume,
    devices: &IndexMap<String, String>,
    disk: &ProbedDisk,
) -> IndexMap<Role, String> {
    let mut map = IndexMap::new();
    for s in &volume.structures {
        let role = match s.role() {
            Some(role @ (Role::SystemBoot | Role::SystemSave | Role::SystemData)) => role,
            _ => continue,
        };
        // preserved partitions (system-save on factory reset) were never
        // assigned a device, their node comes from the probe
        let node = devices.get(s.name()).cloned().or_else(|| {
            disk.partition_at_start(s.start_offset)
                .map(|p| p.dev_node.clone())
        });
        if let Some(node) = node {
            map.insert(role, node);
        }
    }
    map
}
