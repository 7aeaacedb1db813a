use anyhow::Result;
use async_trait::async_trait;

use crate::{
    cli::InstallOptions,
    disk::SystemDiskProbe,
    fs::tools::SystemBlockTools,
    install,
    types::Model,
};

pub struct FactoryResetCommand {
    pub install_options: InstallOptions,
}

#[async_trait]
impl crate::cmd::Command for FactoryResetCommand {
    async fn run(&self) -> Result<()> {
        let model = Model { has_modes: true };
        let options = install::Options {
            encryption_type: self.install_options.encryption,
            boot_device: self.install_options.device.clone(),
        };

        let installed = install::factory_reset(
            &model,
            &self.install_options.gadget_root,
            &options,
            None,
            &SystemDiskProbe,
            &SystemBlockTools,
        )
        .await?;

        for (role, node) in &installed.device_for_role {
            tracing::info!("{role} reset on {node}");
        }
        Ok(())
    }
}
