use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use mjf_adapters::OfferSource;
use mjf_core::{BuildToken, CycleReport, Offer, ReconcileSummary};
use mjf_storage::{NotificationOutcome, Store, StorageError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{render_offer_url, SyncConfig};
use crate::notify::{Notifier, OfferMessage};

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub detail_concurrency: usize,
    pub notify_batch_size: u32,
    pub notify_delay: Duration,
    pub offer_url_pattern: String,
}

impl From<&SyncConfig> for CycleSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            detail_concurrency: config.detail_concurrency.max(1),
            notify_batch_size: config.notify_batch_size,
            notify_delay: config.notify_delay,
            offer_url_pattern: config.offer_url_pattern.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RetractReport {
    pub retired: usize,
    pub retracted: usize,
    pub failed: usize,
}

enum DetailUnit {
    Fetched,
    Failed,
    Skipped,
}

/// One fetch → details → notify → reconcile pass over the store.
pub struct CyclePipeline {
    store: Store,
    source: Arc<dyn OfferSource>,
    notifier: Option<Arc<dyn Notifier>>,
    settings: CycleSettings,
}

impl CyclePipeline {
    pub fn new(
        store: Store,
        source: Arc<dyn OfferSource>,
        notifier: Option<Arc<dyn Notifier>>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            store,
            source,
            notifier,
            settings,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn has_notifier(&self) -> bool {
        self.notifier.is_some()
    }

    pub async fn refresh_token(&self) -> Result<BuildToken> {
        self.source.refresh_token().await.context("refreshing build token")
    }

    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", %run_id);
        self.run_cycle(run_id, cancel).instrument(span).await
    }

    async fn run_cycle(&self, run_id: Uuid, cancel: &CancellationToken) -> Result<CycleReport> {
        let started_at = Utc::now();
        info!("cycle started");

        let summaries = self.source.list_offers().await.context("fetching active offers list")?;
        let upsert = self
            .store
            .upsert_from_list(&summaries)
            .await
            .context("upserting offers")?;
        info!(
            listed = summaries.len(),
            created = upsert.created,
            updated = upsert.updated,
            deactivated = upsert.deactivated,
            "offers upserted"
        );

        let mut report = CycleReport {
            run_id,
            started_at,
            finished_at: started_at,
            listed: summaries.len(),
            upsert,
            details_fetched: 0,
            details_failed: 0,
            notified: 0,
            notify_failed: 0,
            reconcile: ReconcileSummary::default(),
            cancelled: false,
        };

        let (fetched, failed) = self.fetch_details(cancel).await?;
        report.details_fetched = fetched;
        report.details_failed = failed;

        if !cancel.is_cancelled() {
            let (notified, notify_failed) = self.notify(cancel).await?;
            report.notified = notified;
            report.notify_failed = notify_failed;
        }

        if !cancel.is_cancelled() {
            report.reconcile = self.store.reconcile().await.context("reconciling notifications")?;
        }

        report.cancelled = cancel.is_cancelled();
        report.finished_at = Utc::now();
        info!(
            details_fetched = report.details_fetched,
            details_failed = report.details_failed,
            notified = report.notified,
            notify_failed = report.notify_failed,
            retired = report.reconcile.retired,
            cancelled = report.cancelled,
            "cycle finished"
        );
        Ok(report)
    }

    /// Fetch detail for every pending offer on a bounded pool. Per-offer upstream failures are
    /// logged and skipped. A storage failure stops the batch: units already in flight finish,
    /// no further unit starts, and the cycle fails.
    async fn fetch_details(&self, cancel: &CancellationToken) -> Result<(usize, usize)> {
        let pending = self
            .store
            .pending_detail_offers(None)
            .await
            .context("loading offers pending detail")?;
        if pending.is_empty() {
            return Ok((0, 0));
        }
        debug!(pending = pending.len(), "fetching offer details");

        let abort = cancel.child_token();
        let outcomes: Vec<Result<DetailUnit, StorageError>> = stream::iter(pending)
            .map(|offer| self.detail_unit(offer, &abort))
            .buffer_unordered(self.settings.detail_concurrency)
            .collect()
            .await;

        let (mut fetched, mut failed) = (0, 0);
        for outcome in outcomes {
            match outcome.context("recording offer detail")? {
                DetailUnit::Fetched => fetched += 1,
                DetailUnit::Failed => failed += 1,
                DetailUnit::Skipped => {}
            }
        }
        Ok((fetched, failed))
    }

    /// `abort` is a child of the cycle token; it is also cancelled when storing a detail fails.
    async fn detail_unit(&self, offer: Offer, abort: &CancellationToken) -> Result<DetailUnit, StorageError> {
        if abort.is_cancelled() {
            return Ok(DetailUnit::Skipped);
        }

        match self.source.fetch_detail(&offer.offer_id, &offer.slug).await {
            Ok(detail) => {
                if let Err(err) = self.store.record_detail(&offer.offer_id, &detail).await {
                    abort.cancel();
                    return Err(err);
                }
                debug!(offer_id = %offer.offer_id, skills = detail.skills.len(), "offer detail stored");
                Ok(DetailUnit::Fetched)
            }
            Err(err) => {
                warn!(offer_id = %offer.offer_id, error = %err, "skipping offer detail");
                Ok(DetailUnit::Failed)
            }
        }
    }

    /// Announce qualifying offers one at a time, recording each outcome before the next send.
    async fn notify(&self, cancel: &CancellationToken) -> Result<(usize, usize)> {
        let Some(notifier) = &self.notifier else {
            debug!("no webhook configured; skipping notifications");
            return Ok((0, 0));
        };

        let offers = self
            .store
            .qualifying(Some(self.settings.notify_batch_size))
            .await
            .context("loading qualifying offers")?;

        let (mut delivered, mut failed) = (0, 0);
        for (index, offer) in offers.into_iter().enumerate() {
            if index > 0 && !self.settings.notify_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.notify_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            let offer_id = offer.offer_id.clone();
            self.store
                .open_notification(&offer_id)
                .await
                .with_context(|| format!("opening notification for {offer_id}"))?;
            let detail = self
                .store
                .skills_for_offer(&offer_id)
                .await
                .with_context(|| format!("loading skills for {offer_id}"))?;

            let message = OfferMessage {
                url: render_offer_url(&self.settings.offer_url_pattern, &offer.offer_id, &offer.slug),
                offer,
                detail,
            };

            let outcome = match notifier.send(&message).await {
                Ok(delivery) => {
                    delivered += 1;
                    NotificationOutcome::Delivered {
                        message_id: delivery.message_id,
                    }
                }
                Err(err) => {
                    warn!(offer_id = %offer_id, error = %err, "notification failed; will retry next cycle");
                    failed += 1;
                    NotificationOutcome::Failed { error: err.to_string() }
                }
            };
            self.store
                .record_outcome(&offer_id, &outcome)
                .await
                .with_context(|| format!("recording notification outcome for {offer_id}"))?;
        }

        Ok((delivered, failed))
    }

    /// Retire notifications of inactive offers and delete their external messages.
    pub async fn retract_stale_notifications(&self) -> Result<RetractReport> {
        let reconcile = self.store.reconcile().await.context("reconciling notifications")?;
        let mut report = RetractReport {
            retired: reconcile.retired,
            ..RetractReport::default()
        };

        let Some(notifier) = &self.notifier else {
            return Ok(report);
        };

        for record in self.store.retractable().await.context("loading retractable notifications")? {
            let Some(message_id) = record.message_id.as_deref() else {
                continue;
            };
            match notifier.retract(message_id).await {
                Ok(()) => {
                    self.store
                        .clear_message_id(&record.offer_id)
                        .await
                        .with_context(|| format!("clearing message id for {}", record.offer_id))?;
                    report.retracted += 1;
                }
                Err(err) => {
                    warn!(offer_id = %record.offer_id, message_id, error = %err, "message retraction failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            retired = report.retired,
            retracted = report.retracted,
            failed = report.failed,
            "stale notifications retracted"
        );
        Ok(report)
    }
}
