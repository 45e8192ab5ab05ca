//! Device identity commands.

use clap::{Args, Subcommand};

use adameter_core::context::SETTINGS_FILE;
use adameter_core::{get_device_id, FileKvStore, KeyValueStore};

use crate::config::Config;

/// Show this device's identity
#[derive(Args)]
pub struct DeviceCommand {
    #[command(subcommand)]
    command: DeviceSubcommand,
}

#[derive(Subcommand)]
enum DeviceSubcommand {
    /// Show the id records written on this device are tagged with
    Show,
}

impl DeviceCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            DeviceSubcommand::Show => self.show(config),
        }
    }

    fn show(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        std::fs::create_dir_all(&config.data_dir.value)?;
        let store = FileKvStore::open(config.data_dir.value.join(SETTINGS_FILE))?;
        let device_id = get_device_id(Some(&store as &dyn KeyValueStore));

        println!("Device");
        println!("======");
        println!();
        println!("ID:       {}", device_id);
        println!("Settings: {}", store.path().display());

        Ok(())
    }
}
