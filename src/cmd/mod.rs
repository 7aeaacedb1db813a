pub mod factory_reset;
pub mod install;

use anyhow::Result;
use async_trait::async_trait;

use factory_reset::FactoryResetCommand;
use install::InstallCommand;

#[async_trait]
pub trait Command {
    async fn run(&self) -> Result<()>;
}

pub trait IntoCommand {
    fn into_command(self) -> Box<dyn Command>;
}

impl IntoCommand for crate::cli::Command {
    fn into_command(self) -> Box<dyn Command> {
        match self {
            crate::cli::Command::Install(install_options) => {
                Box::new(InstallCommand { install_options })
            }
            crate::cli::Command::FactoryReset(install_options) => {
                Box::new(FactoryResetCommand { install_options })
            }
        }
    }
}
