//! Reconciliation sweep.
//!
//! A crash or a timed-out provider wait leaves a record in a transient
//! state with its marker still held. This task periodically finds such
//! records, gives them a grace period to settle on their own, then asks the
//! controller to resolve them against the provider's authoritative status.
//! An unreachable provider gets a bounded number of in-sweep retries with
//! doubling backoff; state is never touched while the provider cannot be
//! asked.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::LifecycleConfig;
use crate::controller::{LifecycleController, ReconcileOutcome};
use crate::store::VmStore;

pub struct Reconciler {
    store: Arc<VmStore>,
    controller: Arc<LifecycleController>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

/// Counters from one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub resolved: usize,
    pub in_flight: usize,
    pub unreachable: usize,
}

impl Reconciler {
    pub fn new(
        store: Arc<VmStore>,
        controller: Arc<LifecycleController>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            controller,
            clock,
            config,
        }
    }

    /// Run the sweep on its configured interval until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            interval_secs = self.config.sweep_interval_secs,
            "reconciliation sweep started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("reconciliation sweep stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if report.examined > 0 {
                        tracing::info!(
                            examined = report.examined,
                            resolved = report.resolved,
                            in_flight = report.in_flight,
                            unreachable = report.unreachable,
                            "reconciliation sweep completed"
                        );
                    }
                }
            }
        }
    }

    /// One pass over every transient record past its grace period.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let grace = self.config.reconcile_grace();
        let mut report = SweepReport::default();

        for record in self.store.list_transient().await {
            if now - record.last_state_change < grace {
                continue;
            }
            report.examined += 1;

            match self.reconcile_with_retry(record.id).await {
                Ok(ReconcileOutcome::Resolved(resolved)) => {
                    report.resolved += 1;
                    tracing::info!(
                        vm_id = %record.id,
                        was = %record.status,
                        now = %resolved.status,
                        "stuck operation reconciled"
                    );
                }
                Ok(ReconcileOutcome::InFlight) => report.in_flight += 1,
                Ok(ReconcileOutcome::Unreachable) => report.unreachable += 1,
                Ok(ReconcileOutcome::Stable) => {}
                Err(e) => {
                    tracing::warn!(vm_id = %record.id, error = %e, "reconciliation failed");
                }
            }
        }

        report
    }

    /// Bounded retries while the provider is unreachable, backing off
    /// between attempts. Gives up until the next sweep once exhausted.
    async fn reconcile_with_retry(
        &self,
        vm_id: crate::types::VmId,
    ) -> crate::errors::Result<ReconcileOutcome> {
        let mut backoff = self.config.retry_backoff();
        let attempts = self.config.retry_limit.max(1);

        for attempt in 1..=attempts {
            let outcome = self.controller.reconcile(vm_id).await?;
            match outcome {
                ReconcileOutcome::Unreachable if attempt < attempts => {
                    tracing::debug!(
                        vm_id = %vm_id,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        "provider unreachable, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                outcome => return Ok(outcome),
            }
        }

        Ok(ReconcileOutcome::Unreachable)
    }
}
