//! Sync CLI commands for syncing with the relay.

use std::time::Duration;

use clap::{Args, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use adameter_core::{check_relay, AppContext, JoinStrategy, Origin, SessionState};

use super::{connector, open_context, runtime};
use crate::config::Config;

/// Sync with the stored room
#[derive(Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,

    /// Reconcile with this strategy even if the room was joined before
    /// (remote, local, merge)
    #[arg(long, short)]
    strategy: Option<JoinStrategy>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long, short, value_name = "SECS")]
    duration: Option<u64>,
}

#[derive(Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration and relay status
    Status,
}

async fn elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SyncCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let rt = runtime()?;
        match &self.command {
            None => rt.block_on(async {
                let mut ctx = open_context(config).await?;
                let result = self.sync(&mut ctx, config).await;
                ctx.shutdown().await;
                result
            }),
            Some(SyncSubcommand::Status) => rt.block_on(self.status(config)),
        }
    }

    async fn sync(
        &self,
        ctx: &mut AppContext,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let connector = connector(config)?;
        let session = ctx.connect(self.strategy, connector).await?;
        let mut states = session.subscribe_state();
        let mut events = ctx.replica().subscribe();

        println!("Syncing room {} (Ctrl-C to stop)", session.room());
        println!();

        let deadline = self
            .duration
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let stop = elapsed(deadline);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(stop, ctrl_c);

        let mut reported_decision = false;
        loop {
            tokio::select! {
                _ = &mut ctrl_c => break,
                _ = &mut stop => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    println!("  {}", state);
                    if state == SessionState::Syncing && !reported_decision {
                        if let Some(decision) = session.last_decision() {
                            println!("  bootstrap: {}", decision);
                        }
                        reported_decision = true;
                    }
                    if state == SessionState::Disconnected {
                        println!("  relay unreachable; retrying on the next run");
                    }
                }
                event = events.recv() => match event {
                    Ok(event) if event.origin == Origin::Remote => match event.node {
                        Some(node) => println!("  received {} changes", node),
                        None => println!("  received changes"),
                    },
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }

        println!();
        println!("Stopped syncing.");
        Ok(())
    }

    async fn status(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        match open_context(config).await {
            Ok(mut ctx) => {
                let room = ctx.effective_room();
                ctx.shutdown().await;
                match room? {
                    Some(room) => println!("Room:  {}", room),
                    None => println!("Room:  (none)"),
                }
            }
            Err(e) => println!("Room:  unavailable ({})", e),
        }

        let Some(relay_url) = config.relay_url.value.as_ref() else {
            println!("Relay: Not configured");
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  relay_url: \"ws://localhost:8080\"");
            println!();
            println!("Or set environment variable:");
            println!("  ADAMETER_RELAY_URL");
            return Ok(());
        };

        println!("Relay: {}", relay_url);
        println!();

        print!("Relay status: ");
        match check_relay(relay_url).await {
            Ok(health) => println!("✓ {} (version {})", health.status, health.version),
            Err(e) => println!("✗ {}", e),
        }

        Ok(())
    }
}
