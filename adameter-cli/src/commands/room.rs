//! Room commands.

use clap::{Args, Subcommand};

use adameter_core::room::generate_room_name;
use adameter_core::{AppContext, JoinStrategy};

use super::{connector, open_context, runtime, wait_until_syncing};
use crate::config::Config;

/// Manage the shared room
#[derive(Args)]
pub struct RoomCommand {
    #[command(subcommand)]
    pub command: RoomSubcommand,
}

#[derive(Subcommand)]
pub enum RoomSubcommand {
    /// Show the stored room and what it resolves to
    Show,

    /// Join a room and reconcile local data with it
    Join {
        /// Room name, optionally with an epoch suffix
        room: String,

        /// What to keep when both sides hold data (remote, local, merge)
        #[arg(long, short)]
        strategy: Option<JoinStrategy>,
    },

    /// Create a new room with a generated name and join it
    New {
        /// What to keep when both sides hold data (remote, local, merge)
        #[arg(long, short)]
        strategy: Option<JoinStrategy>,
    },

    /// Stop syncing and forget the room (local data is kept)
    Leave,
}

impl RoomCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let rt = runtime()?;
        rt.block_on(async {
            let mut ctx = open_context(config).await?;
            let result = self.execute(&mut ctx, config).await;
            ctx.shutdown().await;
            result
        })
    }

    async fn execute(
        &self,
        ctx: &mut AppContext,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            RoomSubcommand::Show => show(ctx),
            RoomSubcommand::Join { room, strategy } => join(ctx, config, room, *strategy).await,
            RoomSubcommand::New { strategy } => {
                let room = generate_room_name();
                println!("Created room {}", room);
                join(ctx, config, &room, *strategy).await
            }
            RoomSubcommand::Leave => {
                ctx.leave_room().await?;
                println!("Left room. Local data is kept.");
                Ok(())
            }
        }
    }
}

fn show(ctx: &AppContext) -> Result<(), Box<dyn std::error::Error>> {
    let settings = ctx.settings();
    let mode = settings.mode();

    println!("Room");
    println!("====");
    println!();
    match settings.stored_base_room()? {
        Some(base) => {
            println!("Base room:      {}", base);
            if let Some(effective) = ctx.effective_room()? {
                println!("Effective room: {}", effective);
                let bootstrapped = ctx.bootstrapped_room().as_deref() == Some(effective.as_str());
                println!(
                    "Reconciled:     {}",
                    if bootstrapped { "yes" } else { "not yet" }
                );
            }
        }
        None => {
            println!("No room set.");
            println!();
            println!("Run 'ada room join <room>' or 'ada room new' to start sharing.");
        }
    }
    println!();
    println!("Mode:  {}", mode);
    println!("Epoch: {}", settings.epoch(mode));
    println!("Local: {}", ctx.local_store_name());
    Ok(())
}

async fn join(
    ctx: &mut AppContext,
    config: &Config,
    input: &str,
    strategy: Option<JoinStrategy>,
) -> Result<(), Box<dyn std::error::Error>> {
    let selection = ctx.select_room(input).await?;
    println!("Room set to {}", selection.effective_room());

    let connector = match connector(config) {
        Ok(connector) => connector,
        Err(e) => {
            println!("{}", e);
            println!("The room will be reconciled on the next 'ada sync'.");
            return Ok(());
        }
    };

    let session = ctx.connect(strategy, connector).await?;
    wait_until_syncing(&session).await?;
    match session.last_decision() {
        Some(decision) => println!("Joined ({})", decision),
        None => println!("Resumed"),
    }
    Ok(())
}
