use anyhow::Result;
use async_trait::async_trait;

use crate::{
    cli::InstallOptions,
    disk::SystemDiskProbe,
    fs::tools::SystemBlockTools,
    install,
    types::Model,
};

pub struct InstallCommand {
    pub install_options: InstallOptions,
}

#[async_trait]
impl crate::cmd::Command for InstallCommand {
    async fn run(&self) -> Result<()> {
        // Installer images for pre-modes systems never ship this binary;
        // the outer service has already verified the model assertion.
        let model = Model { has_modes: true };
        let options = install::Options {
            encryption_type: self.install_options.encryption,
            boot_device: self.install_options.device.clone(),
        };

        let installed = install::install(
            &model,
            &self.install_options.gadget_root,
            &options,
            None,
            &SystemDiskProbe,
            &SystemBlockTools,
        )
        .await?;

        for (role, node) in &installed.device_for_role {
            tracing::info!("{role} installed on {node}");
        }
        if let Some(keys) = &installed.key_for_role {
            tracing::info!("generated {} volume keys, handing over for sealing", keys.len());
        }
        Ok(())
    }
}
