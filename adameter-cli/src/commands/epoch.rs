//! Epoch commands.

use clap::{Args, Subcommand};

use adameter_core::{AppContext, Mode};

use super::{open_context, runtime};
use crate::config::Config;

/// Manage sync epochs
#[derive(Args)]
pub struct EpochCommand {
    #[command(subcommand)]
    pub command: EpochSubcommand,
}

#[derive(Subcommand)]
pub enum EpochSubcommand {
    /// Show the current mode and epochs
    Show,

    /// Start a fresh epoch, carrying the current data along
    Reset,

    /// Switch between production and test data
    Mode {
        /// production or test
        mode: Mode,
    },
}

impl EpochCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let rt = runtime()?;
        rt.block_on(async {
            let mut ctx = open_context(config).await?;
            let result = self.execute(&mut ctx).await;
            ctx.shutdown().await;
            result
        })
    }

    async fn execute(&self, ctx: &mut AppContext) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            EpochSubcommand::Show => {
                let settings = ctx.settings();
                let mode = settings.mode();
                println!("Mode:             {}", mode);
                println!("Production epoch: {}", settings.epoch(Mode::Production));
                println!("Test epoch:       {}", settings.epoch(Mode::Test));
                println!("Local store:      {}", ctx.local_store_name());
                let tiers = ctx.snapshots().tier_names();
                if tiers.is_empty() {
                    println!("Snapshot storage: unavailable");
                } else {
                    println!("Snapshot storage: {}", tiers.join(", "));
                }
                Ok(())
            }
            EpochSubcommand::Reset => {
                let epoch = ctx.reset_epoch().await?;
                println!("Moved to {} epoch {}", ctx.settings().mode(), epoch);
                if let Some(room) = ctx.effective_room()? {
                    println!("Room is now {}", room);
                    println!("Other devices join it with: ada room join {}", room);
                }
                Ok(())
            }
            EpochSubcommand::Mode { mode } => {
                ctx.set_mode(*mode).await?;
                println!(
                    "Switched to {} (epoch {})",
                    mode,
                    ctx.settings().epoch(*mode)
                );
                Ok(())
            }
        }
    }
}
