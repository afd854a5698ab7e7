//! Cycle orchestration: wiring, scheduling and the notification side of the poller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mjf_adapters::{ManfredClient, OfferSource};
use mjf_core::CycleReport;
use mjf_storage::{HttpFetcher, Store};
use tokio_cron_scheduler::JobScheduler;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod config;
pub mod notify;
pub mod pipeline;
pub mod runner;

pub use config::{SyncConfig, DEFAULT_OFFER_URL_PATTERN};
pub use notify::{render_embed, Delivery, DiscordWebhookNotifier, Notifier, NotifyError, OfferMessage};
pub use pipeline::{CyclePipeline, CycleSettings, RetractReport};
pub use runner::{build_scheduler, CycleGate, CycleRunner, GateGuard, LastCycle, TriggerError};

pub const CRATE_NAME: &str = "mjf-sync";

/// A fully wired poller: store, upstream client, notifier and the gated runner.
pub struct SyncService {
    config: SyncConfig,
    store: Store,
    client: Arc<ManfredClient>,
    runner: Arc<CycleRunner>,
    cancel: CancellationToken,
}

impl SyncService {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = Store::connect(&config.db_path, config.reset_db)
            .await
            .with_context(|| format!("opening database {}", config.db_path.display()))?;

        if let Some(seed) = &config.build_id_seed {
            if store.seed_token(seed).await.context("seeding build token")? {
                info!("seeded build token from environment");
            }
        }

        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let client = Arc::new(
            ManfredClient::connect(http, store.clone(), config.endpoints())
                .await
                .context("loading persisted build token")?,
        );

        let notifier = match &config.discord_webhook_url {
            Some(url) => Some(Arc::new(DiscordWebhookNotifier::new(
                url.clone(),
                Duration::from_secs(config.http_timeout_secs),
            )?) as Arc<dyn Notifier>),
            None => {
                info!("DISCORD_WEBHOOK_URL not set; notifications disabled");
                None
            }
        };

        let cancel = CancellationToken::new();
        let pipeline = CyclePipeline::new(
            store.clone(),
            client.clone() as Arc<dyn OfferSource>,
            notifier,
            CycleSettings::from(&config),
        );
        let runner = Arc::new(CycleRunner::new(pipeline, cancel.clone()));

        Ok(Self {
            config,
            store,
            client,
            runner,
            cancel,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn client(&self) -> &Arc<ManfredClient> {
        &self.client
    }

    pub fn runner(&self) -> &Arc<CycleRunner> {
        &self.runner
    }

    /// Cancelling this stops new work; an in-flight cycle finishes its current unit.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Kick off an immediate cycle in the background and return the started interval
    /// scheduler, if scheduling is enabled.
    pub async fn start(&self) -> Result<Option<JobScheduler>> {
        let runner = self.runner.clone();
        tokio::spawn(async move { runner.on_tick().await });

        if !self.config.scheduler_enabled {
            info!("scheduler disabled; cycles run on demand only");
            return Ok(None);
        }

        let sched = build_scheduler(self.runner.clone(), self.config.fetch_interval).await?;
        sched.start().await.context("starting scheduler")?;
        info!(interval_secs = self.config.fetch_interval.as_secs(), "scheduler started");
        Ok(Some(sched))
    }
}

pub async fn run_cycle_once_from_env() -> Result<CycleReport> {
    let service = SyncService::from_config(SyncConfig::from_env()).await?;
    service.runner().trigger().await.map_err(anyhow::Error::from)
}
