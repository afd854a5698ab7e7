use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mjf_sync::{SyncConfig, SyncService};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mjf-cli")]
#[command(about = "Manfred job offer poller")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler and the HTTP surface until Ctrl-C.
    Serve,
    /// Run a single cycle and exit.
    Cycle,
    /// Force a build token refresh from the landing page.
    RefreshToken,
    /// Retire notifications of inactive offers and delete their messages.
    Retract,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(connect().await?).await?,
        Commands::Cycle => {
            let report = mjf_sync::run_cycle_once_from_env().await?;
            println!(
                "cycle complete: run_id={} listed={} created={} deactivated={} details={} notified={} retired={}",
                report.run_id,
                report.listed,
                report.upsert.created,
                report.upsert.deactivated,
                report.details_fetched,
                report.notified,
                report.reconcile.retired
            );
        }
        Commands::RefreshToken => {
            let token = connect().await?.runner().pipeline().refresh_token().await?;
            println!("build token: {}", token.value);
        }
        Commands::Retract => {
            let report = connect().await?.runner().retract().await?;
            println!(
                "retract complete: retired={} retracted={} failed={}",
                report.retired, report.retracted, report.failed
            );
        }
    }

    Ok(())
}

async fn connect() -> Result<SyncService> {
    SyncService::from_config(SyncConfig::from_env()).await
}

async fn serve(service: SyncService) -> Result<()> {
    let scheduler = service.start().await?;
    let cancel = service.cancel_token();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler failed");
            }
            info!("shutdown requested");
            cancel.cancel();
        });
    }

    let state = mjf_web::AppState::from_service(&service);
    mjf_web::serve(state, service.config().web_port, cancel).await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    while service.runner().is_running() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("stopped");
    Ok(())
}
