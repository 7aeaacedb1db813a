//! Mounts each freshly created filesystem under a per-structure scratch
//! path, copies the gadget-supplied content into it and unmounts again.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use indexmap::IndexMap;

use crate::{
    async_defer,
    fs::tools::BlockTools,
    gadget::{
        layout::{LaidOutStructure, LaidOutVolume},
        Filesystem, Role,
    },
    install::encrypt::EncryptionSetupData,
    paths,
};

/// Side-channel for external measurement of the copied assets. Invoked once
/// per copied file with the resolved source and target paths.
#[async_trait]
pub trait ContentObserver: Send + Sync {
    async fn content_written(&self, source: &Path, target: &Path) -> Result<()>;
}

/// A structure whose filesystem has been populated, and the device node the
/// content actually went to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnDiskStructure {
    pub name: String,
    pub role: Option<Role>,
    pub node: String,
}

/// Write the gadget content into every structure that declares a filesystem
/// and has a device assigned. Encrypted structures receive their content
/// through the mapper node recorded in `encryption`.
pub async fn write_content(
    gadget_root: &Path,
    volume: &LaidOutVolume,
    devices: &IndexMap<String, String>,
    encryption: Option<&EncryptionSetupData>,
    observer: Option<&dyn ContentObserver>,
    tools: &dyn BlockTools,
) -> Result<Vec<OnDiskStructure>> {
    let mut written = Vec::new();

    for s in &volume.structures {
        if s.filesystem() == Filesystem::None {
            continue;
        }
        let Some(raw_node) = devices.get(s.name()) else {
            continue;
        };
        let node = target_node(s, raw_node, encryption);

        let mount_point = paths::gadget_install_dir()
            .await
            .join(paths::mount_dir_name_for_node(&node));
        tokio::fs::create_dir_all(&mount_point)
            .await
            .with_context(|| format!("cannot create mount point {mount_point:?}"))?;

        tracing::info!("writing content for {} to {node}", s.name());
        tools.mount(&node, &mount_point, s.filesystem()).await?;
        let copied = {
            async_defer! {
                async {
                    let _ = tools.unmount(&mount_point).await;
                }
            }
            copy_structure_content(gadget_root, s, &mount_point, observer).await
        };
        copied.with_context(|| format!("cannot write content for structure {:?}", s.name()))?;

        written.push(OnDiskStructure {
            name: s.name().to_owned(),
            role: s.role(),
            node,
        });
    }

    Ok(written)
}

/// The node the filesystem actually lives on: the mapper node when the
/// structure was encrypted, the raw partition otherwise.
pub fn target_node(
    s: &LaidOutStructure,
    raw_node: &str,
    encryption: Option<&EncryptionSetupData>,
) -> String {
    encryption
        .zip(s.fs_label())
        .and_then(|(setup, label)| setup.get(&label))
        .map(|p| p.mapper_node.clone())
        .unwrap_or_else(|| raw_node.to_owned())
}

async fn copy_structure_content(
    gadget_root: &Path,
    s: &LaidOutStructure,
    mount_point: &Path,
    observer: Option<&dyn ContentObserver>,
) -> Result<()> {
    for entry in s.content() {
        let source = gadget_root.join(&entry.source);
        let meta = tokio::fs::metadata(&source)
            .await
            .with_context(|| format!("cannot access content source {source:?}"))?;

        let target_rel = entry.target.trim_start_matches('/');
        let mut target = mount_point.join(target_rel);
        if meta.is_dir() {
            copy_tree(&source, &target, observer).await?;
        } else {
            if entry.target.ends_with('/') || entry.target.is_empty() {
                let file_name = source
                    .file_name()
                    .with_context(|| format!("content source {source:?} has no file name"))?;
                target = target.join(file_name);
            }
            copy_file(&source, &target, observer).await?;
        }
    }
    Ok(())
}

async fn copy_file(
    source: &Path,
    target: &Path,
    observer: Option<&dyn ContentObserver>,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("cannot create target directory {parent:?}"))?;
    }
    tokio::fs::copy(source, target)
        .await
        .with_context(|| format!("cannot copy {source:?} to {target:?}"))?;
    if let Some(observer) = observer {
        observer.content_written(source, target).await?;
    }
    Ok(())
}

async fn copy_tree(
    source_root: &Path,
    target_root: &Path,
    observer: Option<&dyn ContentObserver>,
) -> Result<()> {
    let mut pending: Vec<(PathBuf, PathBuf)> =
        vec![(source_root.to_path_buf(), target_root.to_path_buf())];
    while let Some((source_dir, target_dir)) = pending.pop() {
        tokio::fs::create_dir_all(&target_dir)
            .await
            .with_context(|| format!("cannot create target directory {target_dir:?}"))?;
        let mut entries = tokio::fs::read_dir(&source_dir)
            .await
            .with_context(|| format!("cannot read content directory {source_dir:?}"))?;
        while let Some(entry) = entries.next_entry().await? {
            let source = entry.path();
            let target = target_dir.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((source, target));
            } else {
                copy_file(&source, &target, observer).await?;
            }
        }
    }
    Ok(())
}
