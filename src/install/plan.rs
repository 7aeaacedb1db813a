//! Diffs a laid-out volume against the probed disk and decides which
//! partitions to create, delete, or (re)format.

use std::collections::HashSet;
use std::fmt::{self, Display};

use anyhow::{bail, Result};

use crate::{
    disk::{partition_node, ProbedDisk, ProbedPartition},
    error::InstallError,
    gadget::{
        layout::{LaidOutStructure, LaidOutVolume},
        Filesystem, Role,
    },
    types::PartitionTableSchema,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    Install,
    FactoryReset,
}

impl Display for PlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanMode::Install => f.write_str("install"),
            PlanMode::FactoryReset => f.write_str("factory-reset"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionToCreate {
    /// Slot the partition will take in the table.
    pub index: u32,
    /// Node the kernel will assign once the table is re-read.
    pub node: String,
    pub start: u64,
    pub size: u64,
    pub partition_type: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionToFormat {
    pub structure_name: String,
    pub role: Option<Role>,
    pub filesystem: Filesystem,
    pub label: String,
    /// Raw partition node; encryption may later redirect the filesystem to
    /// a mapper node.
    pub node: String,
    pub size: u64,
}

/// Ordered outcome of planning: partitions to delete, to create, and to
/// (re)format.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PartitionPlan {
    pub deletes: Vec<u32>,
    pub creates: Vec<PartitionToCreate>,
    pub formats: Vec<PartitionToFormat>,
}

impl PartitionPlan {
    pub fn created_nodes(&self) -> Vec<String> {
        self.creates.iter().map(|c| c.node.clone()).collect()
    }

    /// Render the creation records as sfdisk input, sector units.
    pub fn sfdisk_script(&self, schema: PartitionTableSchema, sector_size: u64) -> String {
        let mut script = String::new();
        for c in &self.creates {
            script.push_str(&format!(
                "start={}, size={}, type={}",
                c.start / sector_size,
                c.size / sector_size,
                c.partition_type
            ));
            if schema == PartitionTableSchema::Gpt {
                script.push_str(&format!(", name=\"{}\"", c.name));
            }
            script.push('\n');
        }
        script
    }
}

/// Whether the labels found on a probed partition identify it as the given
/// declared structure. Encrypted containers carry the label with an `-enc`
/// suffix.
fn identity_matches(p: &ProbedPartition, s: &LaidOutStructure) -> bool {
    if p.partition_label.as_deref() == Some(s.name()) {
        return true;
    }
    match (&p.filesystem_label, s.fs_label()) {
        (Some(found), Some(expected)) => {
            *found == expected || *found == format!("{expected}-enc")
        }
        _ => false,
    }
}

/// Labels either identify the structure or are absent entirely; a partition
/// labelled as something else never matches.
fn labels_agree(p: &ProbedPartition, s: &LaidOutStructure) -> bool {
    if p.partition_label.is_none() && p.filesystem_label.is_none() {
        return true;
    }
    identity_matches(p, s)
}

fn size_matches(p: &ProbedPartition, s: &LaidOutStructure) -> bool {
    // system-data fills the remainder of the disk, so anything at least as
    // large as declared is acceptable.
    if s.role() == Some(Role::SystemData) {
        p.size >= s.size
    } else {
        p.size == s.size
    }
}

fn matches_structure(p: &ProbedPartition, s: &LaidOutStructure) -> bool {
    p.start == s.start_offset && size_matches(p, s) && labels_agree(p, s)
}

/// Size the partition will be created with: system-data swallows the
/// remainder of the disk.
fn creation_size(s: &LaidOutStructure, disk: &ProbedDisk) -> u64 {
    if s.role() == Some(Role::SystemData) {
        disk.size - s.start_offset
    } else {
        s.size
    }
}

pub fn plan(volume: &LaidOutVolume, disk: &ProbedDisk, mode: PlanMode) -> Result<PartitionPlan> {
    let partitions: Vec<&LaidOutStructure> = volume.partitions().collect();

    // Pair every declared partition with a probed one where possible.
    let mut used: HashSet<u32> = HashSet::new();
    let mut matched: Vec<Option<&ProbedPartition>> = vec![None; partitions.len()];
    for (i, s) in partitions.iter().enumerate() {
        if let Some(p) = disk
            .partitions
            .iter()
            .find(|p| !used.contains(&p.index) && matches_structure(p, s))
        {
            matched[i] = Some(p);
            used.insert(p.index);
        }
    }

    match mode {
        PlanMode::Install => plan_install(disk, &partitions, &matched, &used),
        PlanMode::FactoryReset => plan_factory_reset(disk, &partitions, &matched),
    }
}

fn plan_install(
    disk: &ProbedDisk,
    partitions: &[&LaidOutStructure],
    matched: &[Option<&ProbedPartition>],
    used: &HashSet<u32>,
) -> Result<PartitionPlan> {
    let mut plan = PartitionPlan::default();

    for (i, s) in partitions.iter().enumerate() {
        if matched[i].is_some() {
            continue;
        }
        // A partition that identifies as this structure but sits at the
        // wrong place cannot be reconciled, only a fresh install medium can.
        if let Some(p) = disk
            .partitions
            .iter()
            .find(|p| !used.contains(&p.index) && identity_matches(p, s))
        {
            bail!(InstallError::IncompatibleLayout {
                device: disk.dev_node.clone(),
                reason: format!(
                    "declared structure {:?} found at offset {} with incompatible geometry",
                    s.name(),
                    p.start
                ),
            });
        }
        if s.role() == Some(Role::SystemSeed) {
            bail!(InstallError::IncompatibleLayout {
                device: disk.dev_node.clone(),
                reason: format!("cannot find declared structure {:?} on disk", s.name()),
            });
        }

        let size = creation_size(s, disk);
        if s.start_offset + size > disk.size {
            bail!(InstallError::IncompatibleLayout {
                device: disk.dev_node.clone(),
                reason: format!(
                    "declared structure {:?} does not fit on a {} byte disk",
                    s.name(),
                    disk.size
                ),
            });
        }
        let partition_type = s
            .structure
            .partition_type_for_schema(disk.schema)
            .ok_or_else(|| {
                InstallError::LayoutInvalid(format!(
                    "structure {:?} has no partition type",
                    s.name()
                ))
            })?;
        plan.creates.push(PartitionToCreate {
            index: s.partition_index,
            node: partition_node(&disk.dev_node, s.partition_index),
            start: s.start_offset,
            size,
            partition_type,
            name: s.name().to_owned(),
        });
    }

    // On-disk partitions that answer to no declared structure make way, but
    // only from the first creation point onward; anything before that,
    // the seed partition included, is preserved.
    if let Some(first_create) = plan.creates.iter().map(|c| c.start).min() {
        for p in &disk.partitions {
            if !used.contains(&p.index) && p.start >= first_create {
                plan.deletes.push(p.index);
            }
        }
        plan.deletes.sort_unstable();
    }

    for (i, s) in partitions.iter().enumerate() {
        if s.filesystem() == Filesystem::None {
            continue;
        }
        let created = matched[i].is_none();
        let reformat_role = matches!(
            s.role(),
            Some(Role::SystemBoot) | Some(Role::SystemSave) | Some(Role::SystemData)
        );
        if !(created || reformat_role) {
            continue;
        }
        let (node, size) = match matched[i] {
            Some(p) => (p.dev_node.clone(), p.size),
            None => (
                partition_node(&disk.dev_node, s.partition_index),
                creation_size(s, disk),
            ),
        };
        plan.formats.push(PartitionToFormat {
            structure_name: s.name().to_owned(),
            role: s.role(),
            filesystem: s.filesystem(),
            label: s.fs_label().unwrap_or_else(|| s.name().to_owned()),
            node,
            size,
        });
    }

    Ok(plan)
}

fn plan_factory_reset(
    disk: &ProbedDisk,
    partitions: &[&LaidOutStructure],
    matched: &[Option<&ProbedPartition>],
) -> Result<PartitionPlan> {
    let mut plan = PartitionPlan::default();

    for (i, s) in partitions.iter().enumerate() {
        let p = match matched[i] {
            Some(p) => p,
            None => bail!(InstallError::IncompatibleLayout {
                device: disk.dev_node.clone(),
                reason: format!("cannot find declared structure {:?} on disk", s.name()),
            }),
        };
        // Boot state and user data are recreated; system-save holds
        // per-device secrets and is preserved as-is.
        let reformat = matches!(s.role(), Some(Role::SystemBoot) | Some(Role::SystemData));
        if reformat && s.filesystem() != Filesystem::None {
            plan.formats.push(PartitionToFormat {
                structure_name: s.name().to_owned(),
                role: s.role(),
                filesystem: s.filesystem(),
                label: s.fs_label().unwrap_or_else(|| s.name().to_owned()),
                node: p.dev_node.clone(),
                size: p.size,
            });
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::gadget::{layout, GadgetInfo, MIB};

    const RASPI_YAML: &str = r#"
volumes:
  pi:
    schema: mbr
    bootloader: u-boot
    structure:
      - name: ubuntu-seed
        role: system-seed
        filesystem: vfat
        type: "0C"
        size: 1200M
      - name: ubuntu-boot
        role: system-boot
        filesystem: vfat
        type: "0C"
        size: 750M
      - name: ubuntu-save
        role: system-save
        filesystem: ext4
        type: "83"
        size: 16M
      - name: ubuntu-data
        role: system-data
        filesystem: ext4
        type: "83"
        size: 1500M
"#;

    const DISK_SIZE: u64 = 30528 * MIB;

    fn raspi_volume() -> LaidOutVolume {
        let info: GadgetInfo = serde_yaml::from_str(RASPI_YAML).unwrap();
        layout::lay_out_volume("pi", &info.volumes["pi"]).unwrap()
    }

    fn part(
        index: u32,
        start_mib: u64,
        size_mib: u64,
        fs_label: Option<&str>,
    ) -> ProbedPartition {
        ProbedPartition {
            index,
            dev_node: format!("/dev/mmcblk0p{index}"),
            start: start_mib * MIB,
            size: size_mib * MIB,
            partition_type: (if index <= 2 { "0c" } else { "83" }).to_owned(),
            partition_label: None,
            partition_uuid: Some(format!("7c301cbd-{index:02}")),
            filesystem_label: fs_label.map(str::to_owned),
            filesystem_uuid: fs_label.map(|l| format!("uuid-{l}")),
        }
    }

    fn disk_with(partitions: Vec<ProbedPartition>) -> ProbedDisk {
        ProbedDisk {
            dev_node: "/dev/mmcblk0".to_owned(),
            dev_num: "179:0".to_owned(),
            dev_path: "/sys/devices/platform/emmc2bus/block/mmcblk0".to_owned(),
            size: DISK_SIZE,
            sector_size: 512,
            schema: PartitionTableSchema::Mbr,
            disk_id: "0x7c301cbd".to_owned(),
            partitions,
        }
    }

    fn seed_only_disk() -> ProbedDisk {
        disk_with(vec![part(1, 1, 1200, Some("ubuntu-seed"))])
    }

    fn full_disk() -> ProbedDisk {
        disk_with(vec![
            part(1, 1, 1200, Some("ubuntu-seed")),
            part(2, 1201, 750, Some("ubuntu-boot")),
            part(3, 1951, 16, Some("ubuntu-save")),
            part(4, 1967, 30528 - 1967, Some("ubuntu-data")),
        ])
    }

    #[test]
    fn test_install_plan_creates_missing_partitions() {
        let plan = plan(&raspi_volume(), &seed_only_disk(), PlanMode::Install).unwrap();

        assert!(plan.deletes.is_empty());
        let created: Vec<_> = plan
            .creates
            .iter()
            .map(|c| (c.index, c.node.as_str(), c.start, c.size))
            .collect();
        assert_eq!(
            created,
            vec![
                (2, "/dev/mmcblk0p2", 1201 * MIB, 750 * MIB),
                (3, "/dev/mmcblk0p3", 1951 * MIB, 16 * MIB),
                (4, "/dev/mmcblk0p4", 1967 * MIB, (30528 - 1967) * MIB),
            ]
        );
        let formatted: Vec<_> = plan
            .formats
            .iter()
            .map(|f| (f.role, f.filesystem, f.label.as_str(), f.node.as_str()))
            .collect();
        assert_eq!(
            formatted,
            vec![
                (
                    Some(Role::SystemBoot),
                    Filesystem::Vfat,
                    "ubuntu-boot",
                    "/dev/mmcblk0p2"
                ),
                (
                    Some(Role::SystemSave),
                    Filesystem::Ext4,
                    "ubuntu-save",
                    "/dev/mmcblk0p3"
                ),
                (
                    Some(Role::SystemData),
                    Filesystem::Ext4,
                    "ubuntu-data",
                    "/dev/mmcblk0p4"
                ),
            ]
        );
    }

    #[test]
    fn test_sfdisk_script() {
        let plan = plan(&raspi_volume(), &seed_only_disk(), PlanMode::Install).unwrap();
        let script = plan.sfdisk_script(PartitionTableSchema::Mbr, 512);
        assert_eq!(
            script,
            "start=2461696, size=1536000, type=0C\n\
             start=3995648, size=32768, type=83\n\
             start=4028416, size=58492928, type=83\n"
        );
    }

    #[test]
    fn test_sfdisk_script_gpt_carries_names() {
        let mut plan = PartitionPlan::default();
        plan.creates.push(PartitionToCreate {
            index: 2,
            node: "/dev/vda2".into(),
            start: MIB,
            size: MIB,
            partition_type: "0FC63DAF-8483-4772-8E79-3D69D8477DE4".into(),
            name: "ubuntu-boot".into(),
        });
        let script = plan.sfdisk_script(PartitionTableSchema::Gpt, 512);
        assert_eq!(
            script,
            "start=2048, size=2048, type=0FC63DAF-8483-4772-8E79-3D69D8477DE4, name=\"ubuntu-boot\"\n"
        );
    }

    #[rstest]
    #[case::install(PlanMode::Install, vec![Some(Role::SystemBoot), Some(Role::SystemSave), Some(Role::SystemData)])]
    #[case::factory_reset(PlanMode::FactoryReset, vec![Some(Role::SystemBoot), Some(Role::SystemData)])]
    fn test_plan_on_matching_disk_only_formats(
        #[case] mode: PlanMode,
        #[case] expected_roles: Vec<Option<Role>>,
    ) {
        let plan = plan(&raspi_volume(), &full_disk(), mode).unwrap();
        assert!(plan.deletes.is_empty());
        assert!(plan.creates.is_empty());
        let roles: Vec<_> = plan.formats.iter().map(|f| f.role).collect();
        assert_eq!(roles, expected_roles);
    }

    #[test]
    fn test_factory_reset_never_formats_save() {
        let plan = plan(&raspi_volume(), &full_disk(), PlanMode::FactoryReset).unwrap();
        assert!(plan
            .formats
            .iter()
            .all(|f| f.role != Some(Role::SystemSave)));
    }

    #[test]
    fn test_factory_reset_matches_encrypted_containers() {
        let disk = disk_with(vec![
            part(1, 1, 1200, Some("ubuntu-seed")),
            part(2, 1201, 750, Some("ubuntu-boot")),
            part(3, 1951, 16, Some("ubuntu-save-enc")),
            part(4, 1967, 30528 - 1967, Some("ubuntu-data-enc")),
        ]);
        let plan = plan(&raspi_volume(), &disk, PlanMode::FactoryReset).unwrap();
        let nodes: Vec<_> = plan.formats.iter().map(|f| f.node.as_str()).collect();
        assert_eq!(nodes, vec!["/dev/mmcblk0p2", "/dev/mmcblk0p4"]);
    }

    #[test]
    fn test_install_replaces_foreign_partitions() {
        // Leftovers of some other operating system at the offsets the
        // declared structures want.
        let disk = disk_with(vec![
            part(1, 1, 1200, Some("ubuntu-seed")),
            part(2, 1201, 512, Some("rootfs-a")),
            part(3, 1713, 512, Some("rootfs-b")),
            part(4, 2225, 1024, None),
        ]);
        let plan = plan(&raspi_volume(), &disk, PlanMode::Install).unwrap();
        assert_eq!(plan.deletes, vec![2, 3, 4]);
        assert_eq!(plan.creates.len(), 3);
        assert_eq!(plan.formats.len(), 3);
    }

    #[test]
    fn test_install_keeps_foreign_partitions_before_first_create() {
        let mut firmware = part(5, 0, 1, None);
        // vendor firmware blob parked below the seed partition
        firmware.start = 512 * 1024;
        firmware.size = 256 * 1024;
        firmware.dev_node = "/dev/mmcblk0p5".to_owned();
        let disk = disk_with(vec![part(1, 1, 1200, Some("ubuntu-seed")), firmware]);
        let plan = plan(&raspi_volume(), &disk, PlanMode::Install).unwrap();
        assert!(plan.deletes.is_empty());
        assert_eq!(plan.creates.len(), 3);
    }

    #[test]
    fn test_install_rejects_incompatible_geometry() {
        // ubuntu-boot identifies itself but sits at the wrong offset
        let disk = disk_with(vec![
            part(1, 1, 1200, Some("ubuntu-seed")),
            part(2, 1301, 750, Some("ubuntu-boot")),
        ]);
        let err = plan(&raspi_volume(), &disk, PlanMode::Install).unwrap_err();
        match err.downcast_ref::<InstallError>() {
            Some(InstallError::IncompatibleLayout { device, reason }) => {
                assert_eq!(device, "/dev/mmcblk0");
                assert!(reason.contains("ubuntu-boot"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_install_requires_seed_on_disk() {
        let disk = disk_with(vec![]);
        let err = plan(&raspi_volume(), &disk, PlanMode::Install).unwrap_err();
        assert!(err.to_string().contains("ubuntu-seed"));
    }

    #[test]
    fn test_factory_reset_requires_all_structures() {
        let err = plan(&raspi_volume(), &seed_only_disk(), PlanMode::FactoryReset).unwrap_err();
        match err.downcast_ref::<InstallError>() {
            Some(InstallError::IncompatibleLayout { reason, .. }) => {
                assert!(reason.contains("ubuntu-boot"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
