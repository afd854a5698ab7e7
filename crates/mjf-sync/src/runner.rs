//! Idle/Running gate and the scheduler that drives cycles through it.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use mjf_core::CycleReport;
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pipeline::{CyclePipeline, RetractReport};

/// Two-state gate: at most one holder at a time, released when the guard drops.
///
/// The guard owns a handle to the gate so it can move into a spawned task and keep the gate
/// closed for as long as that task runs.
#[derive(Debug, Default)]
pub struct CycleGate {
    running: AtomicBool,
}

impl CycleGate {
    pub fn try_enter(self: &Arc<Self>) -> Option<GateGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard { gate: Arc::clone(self) })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<CycleGate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("a cycle is already running")]
    AlreadyRunning,
    #[error("shutting down; no new cycles start")]
    ShuttingDown,
    #[error("cycle failed: {0}")]
    Failed(String),
    #[error("cycle panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct LastCycle {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ok: bool,
    pub error: Option<String>,
    pub report: Option<CycleReport>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs cycles through the gate, whether triggered by the scheduler or on demand.
pub struct CycleRunner {
    pipeline: CyclePipeline,
    gate: Arc<CycleGate>,
    cancel: CancellationToken,
    last: Mutex<Option<LastCycle>>,
}

impl CycleRunner {
    pub fn new(pipeline: CyclePipeline, cancel: CancellationToken) -> Self {
        Self {
            pipeline,
            gate: Arc::default(),
            cancel,
            last: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &CyclePipeline {
        &self.pipeline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_running(&self) -> bool {
        self.gate.is_running()
    }

    pub fn last_cycle(&self) -> Option<LastCycle> {
        self.last.lock().map(|last| last.clone()).unwrap_or_default()
    }

    /// Run one cycle now. Refuses with `AlreadyRunning` while the gate is held and with
    /// `ShuttingDown` once the runner is cancelled.
    ///
    /// The cycle runs in its own task that owns the gate, so dropping the returned future (a
    /// client disconnect, a caller timeout) does not abandon a send half-recorded or reopen the
    /// gate early. Failures and panics are contained and recorded as the last cycle.
    pub async fn trigger(self: &Arc<Self>) -> Result<CycleReport, TriggerError> {
        self.run_detached(|runner| async move { runner.run_guarded().await })
            .await
    }

    async fn run_guarded(&self) -> Result<CycleReport, TriggerError> {
        let started_at = Utc::now();
        let outcome = AssertUnwindSafe(self.pipeline.run_once(&self.cancel))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(err)) => {
                let msg = format!("{err:#}");
                error!(error = %msg, "cycle failed");
                Err(TriggerError::Failed(msg))
            }
            Err(payload) => {
                let msg = panic_message(payload);
                error!(panic = %msg, "cycle panicked");
                Err(TriggerError::Panicked(msg))
            }
        };

        let last = LastCycle {
            started_at,
            finished_at: Utc::now(),
            ok: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
            report: result.as_ref().ok().cloned(),
        };
        if let Ok(mut slot) = self.last.lock() {
            *slot = Some(last);
        }
        result
    }

    /// Scheduler entry point: an overlapping tick is dropped, not queued.
    pub async fn on_tick(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        match self.trigger().await {
            Ok(_) => {}
            Err(TriggerError::AlreadyRunning) => info!("previous cycle still running; skipping tick"),
            Err(TriggerError::ShuttingDown) => {}
            Err(err) => warn!(error = %err, "scheduled cycle did not complete"),
        }
    }

    /// Retraction reconciles the ledger, so it shares the gate with cycles.
    pub async fn retract(self: &Arc<Self>) -> Result<RetractReport, TriggerError> {
        self.run_detached(|runner| async move {
            runner
                .pipeline
                .retract_stale_notifications()
                .await
                .map_err(|err| TriggerError::Failed(format!("{err:#}")))
        })
        .await
    }

    async fn run_detached<T, F, Fut>(self: &Arc<Self>, work: F) -> Result<T, TriggerError>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = Result<T, TriggerError>> + Send + 'static,
        T: Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(TriggerError::ShuttingDown);
        }
        let Some(guard) = self.gate.try_enter() else {
            return Err(TriggerError::AlreadyRunning);
        };

        let task = work(Arc::clone(self));
        let handle = tokio::spawn(async move {
            let _guard = guard;
            task.await
        });
        match handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                let msg = panic_message(err.into_panic());
                error!(panic = %msg, "gated task panicked");
                Err(TriggerError::Panicked(msg))
            }
            Err(_) => Err(TriggerError::Failed("gated task was aborted".to_string())),
        }
    }
}

/// Build (not start) a scheduler firing `runner.on_tick()` every `interval`.
pub async fn build_scheduler(runner: Arc<CycleRunner>, interval: Duration) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            runner.on_tick().await;
        })
    })
    .with_context(|| format!("creating scheduler job every {}s", interval.as_secs()))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
