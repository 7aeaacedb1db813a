use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::types::EncryptionType;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Materialise the gadget layout onto the target disk.
    #[command(name = "install")]
    Install(InstallOptions),

    /// Recreate boot state and user data, preserving system-save.
    #[command(name = "factory-reset")]
    FactoryReset(InstallOptions),
}

#[derive(Parser, Debug)]
pub struct InstallOptions {
    /// Path to the unpacked gadget directory containing meta/gadget.yaml.
    #[clap(long)]
    pub gadget_root: PathBuf,

    /// Target disk device. Discovered through the seed partition when not
    /// given.
    #[clap(long)]
    pub device: Option<String>,

    /// Encrypt the system-save and system-data partitions.
    #[clap(long)]
    #[arg(value_enum)]
    pub encryption: Option<EncryptionType>,
}
