//! Long-running daemon: auto-stop deadlines and health sweeps.

use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use warden_core::Reachability;

use super::context::CommandContext;

#[derive(Args)]
pub struct ServeArgs {
    /// Seconds between health sweeps (overrides configuration)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub health_interval: Option<u64>,

    /// Skip periodic health sweeps
    #[arg(long)]
    pub no_health: bool,
}

pub async fn execute(ctx: &CommandContext, args: ServeArgs) -> Result<()> {
    let orchestrator = ctx.orchestrator.clone();

    let report = orchestrator.recover()?;
    if report.parked > 0 {
        warn!(
            "{} application(s) were mid-operation at last shutdown and are now in error",
            report.parked
        );
    }
    if report.in_flight > 0 {
        info!(
            "{} application(s) are mid-operation in another process",
            report.in_flight
        );
    }
    let worker = orchestrator.spawn_deadline_worker();
    info!(
        scheduled = report.scheduled,
        data_dir = %ctx.config.data_dir.display(),
        "Warden serving"
    );
    if !ctx.json {
        println!(
            "🛡️  Warden is watching {} running application(s). Press Ctrl+C to stop.",
            report.scheduled
        );
    }

    let health_every = args
        .health_interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| ctx.config.health_interval());
    let mut health = interval(health_every);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut resync = interval(ctx.config.deadline_resync_interval());
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            result = &mut interrupt => {
                if let Err(e) = result {
                    warn!("Failed to listen for interrupt: {}", e);
                }
                info!("Interrupt received, shutting down");
                break;
            }
            _ = health.tick(), if !args.no_health => {
                match orchestrator.refresh_all().await {
                    Ok(reports) => {
                        let offline = reports
                            .iter()
                            .filter(|r| r.reachability() == Reachability::Offline)
                            .count();
                        debug!(servers = reports.len(), offline, "Health sweep finished");
                    }
                    Err(e) => warn!("Health sweep failed: {}", e),
                }
            }
            _ = resync.tick() => {
                match orchestrator.reap_abandoned() {
                    Ok(reaped) if reaped.parked > 0 => {
                        warn!("{} abandoned operation(s) parked in error", reaped.parked);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Reaping abandoned operations failed: {}", e),
                }
                if let Err(e) = orchestrator.resync_deadlines() {
                    warn!("Deadline resync failed: {}", e);
                }
            }
        }
    }

    let parked = orchestrator.shutdown().await?;
    worker.abort();
    if !ctx.json {
        println!("👋 Warden stopped ({} operation(s) interrupted)", parked);
    }
    Ok(())
}
