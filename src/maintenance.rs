//! Periodic sweeps of expired and idle security state.
//!
//! Each sweep is a [`SweepJob`]: a named callback that deletes what has
//! expired and reports how many rows it removed. Whatever scheduler the host
//! uses only has to call `run`. [`MaintenanceRunner`] is a minimal scheduler
//! on a tokio interval for deployments without one.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SecurityConfig;
use crate::error::Result;
use crate::link::{LinkTokenIssuer, LinkTokenStore};
use crate::mfa::{MfaAttemptStore, MfaLockoutGuard, PendingLoginStore};
use crate::oauth::{OAuthStateManager, OAuthStateStore};
use crate::session::{ReuseDetector, SessionManager, SessionStore};

/// A periodic cleanup callback.
#[async_trait]
pub trait SweepJob: Send + Sync {
    fn name(&self) -> &'static str;

    /// Delete expired state. Returns the number of rows removed.
    async fn run(&self) -> Result<u64>;
}

/// Deletes refresh-token tombstones past their grace marker.
pub struct RotatedTokenSweep<S: SessionStore>(pub Arc<ReuseDetector<S>>);

#[async_trait]
impl<S: SessionStore + 'static> SweepJob for RotatedTokenSweep<S> {
    fn name(&self) -> &'static str {
        "rotated_tokens"
    }

    async fn run(&self) -> Result<u64> {
        Ok(self.0.cleanup_expired_rotated_tokens().await)
    }
}

/// Deletes expired OAuth states.
pub struct OAuthStateSweep<S: OAuthStateStore>(pub Arc<OAuthStateManager<S>>);

#[async_trait]
impl<S: OAuthStateStore + 'static> SweepJob for OAuthStateSweep<S> {
    fn name(&self) -> &'static str {
        "oauth_states"
    }

    async fn run(&self) -> Result<u64> {
        let now = self.0.clock().now();
        self.0.sweep_expired(now).await
    }
}

/// Deletes expired link tokens.
pub struct LinkTokenSweep<S: LinkTokenStore>(pub Arc<LinkTokenIssuer<S>>);

#[async_trait]
impl<S: LinkTokenStore + 'static> SweepJob for LinkTokenSweep<S> {
    fn name(&self) -> &'static str {
        "link_tokens"
    }

    async fn run(&self) -> Result<u64> {
        let now = self.0.clock().now();
        self.0.sweep_expired(now).await
    }
}

/// Deletes sessions idle past the configured timeout.
pub struct IdleSessionSweep<S: SessionStore>(pub Arc<SessionManager<S>>);

#[async_trait]
impl<S: SessionStore + 'static> SweepJob for IdleSessionSweep<S> {
    fn name(&self) -> &'static str {
        "idle_sessions"
    }

    async fn run(&self) -> Result<u64> {
        self.0.sweep_idle().await
    }
}

/// Deletes abandoned pending logins and idle attempt records.
pub struct StaleMfaSweep<A: MfaAttemptStore, P: PendingLoginStore>(pub Arc<MfaLockoutGuard<A, P>>);

#[async_trait]
impl<A, P> SweepJob for StaleMfaSweep<A, P>
where
    A: MfaAttemptStore + 'static,
    P: PendingLoginStore + 'static,
{
    fn name(&self) -> &'static str {
        "stale_mfa_entries"
    }

    async fn run(&self) -> Result<u64> {
        let now = self.0.clock().now();
        Ok(self.0.sweep_stale(now).await?.total())
    }
}

/// Outcome of one pass over every job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: u64,
    pub failed: Vec<&'static str>,
}

/// Runs a set of sweep jobs, once or on an interval.
pub struct MaintenanceRunner {
    jobs: Vec<Arc<dyn SweepJob>>,
    interval: Duration,
}

impl MaintenanceRunner {
    pub fn new(interval: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            interval,
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(config.sweep_interval())
    }

    #[must_use]
    pub fn with_job(mut self, job: impl SweepJob + 'static) -> Self {
        self.jobs.push(Arc::new(job));
        self
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.name()).collect()
    }

    /// Run every job once. A failing job is logged and the rest still run.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for job in &self.jobs {
            match job.run().await {
                Ok(deleted) => {
                    tracing::debug!(
                        target: "pacekeeper.maintenance",
                        job = job.name(),
                        deleted = deleted,
                        "Sweep job finished"
                    );
                    report.deleted += deleted;
                }
                Err(e) => {
                    tracing::error!(
                        target: "pacekeeper.maintenance",
                        job = job.name(),
                        error = %e,
                        "Sweep job failed"
                    );
                    report.failed.push(job.name());
                }
            }
        }
        report
    }

    /// Run all jobs now and then on every interval tick until shut down.
    pub fn spawn(self) -> MaintenanceHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            tracing::info!(
                target: "pacekeeper.maintenance",
                jobs = self.jobs.len(),
                interval_secs = self.interval.as_secs(),
                "Maintenance runner started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
            tracing::info!(target: "pacekeeper.maintenance", "Maintenance runner stopped");
        });

        MaintenanceHandle {
            handle,
            shutdown_tx,
        }
    }
}

/// Handle to a spawned [`MaintenanceRunner`].
pub struct MaintenanceHandle {
    handle: JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl MaintenanceHandle {
    /// Stop the loop and wait for the current pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}
