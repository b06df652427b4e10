//! Idle-suspension policy engine.
//!
//! Runs on a fixed interval, independent of request traffic. ACTIVE VMs
//! idle past the configured threshold are shelved; SHELVED VMs older than
//! the retention threshold are deleted; SHELVED VMs approaching deletion
//! get a retention warning. Every action goes through the lifecycle
//! controller, so the sweep's enumeration snapshot is only a hint: the
//! controller re-validates state as part of its atomic precondition, and a
//! VM that changed state since enumeration simply yields `InvalidState` or
//! `Conflict`, which the sweep logs and skips.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::LifecycleConfig;
use crate::controller::LifecycleController;
use crate::errors::Error;
use crate::notify::{NotificationSink, RetentionWarning};
use crate::store::VmStore;
use crate::types::{Actor, EventOutcome, LifecycleAction, LifecycleEvent, VmRecord, VmStatus};

pub struct IdlePolicy {
    store: Arc<VmStore>,
    controller: Arc<LifecycleController>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

/// Counters from one policy pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PolicyReport {
    pub shelved: usize,
    pub deleted: usize,
    pub warned: usize,
    pub skipped: usize,
}

impl IdlePolicy {
    pub fn new(
        store: Arc<VmStore>,
        controller: Arc<LifecycleController>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            controller,
            notifier,
            clock,
            config,
        }
    }

    /// Run the policy on its configured interval until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            idle_threshold_secs = self.config.idle_threshold_secs,
            retention_threshold_secs = self.config.retention_threshold_secs,
            "idle-suspension policy started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("idle-suspension policy stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if report != PolicyReport::default() {
                        tracing::info!(
                            shelved = report.shelved,
                            deleted = report.deleted,
                            warned = report.warned,
                            skipped = report.skipped,
                            "policy sweep completed"
                        );
                    }
                }
            }
        }
    }

    /// One pass of the idle and retention checks.
    pub async fn sweep(&self) -> PolicyReport {
        let mut report = PolicyReport::default();
        let now = self.clock.now();

        for record in self.store.list_by_status(VmStatus::Active).await {
            if now - record.last_activity < self.config.idle_threshold() {
                continue;
            }
            match self
                .controller
                .transition(record.id, LifecycleAction::Shelve, Actor::Policy)
                .await
            {
                Ok(_) => {
                    report.shelved += 1;
                    tracing::info!(
                        vm_id = %record.id,
                        idle_secs = (now - record.last_activity).num_seconds(),
                        "idle VM shelved"
                    );
                }
                // The snapshot was stale or another operation won the
                // marker; the next sweep sees the fresh state.
                Err(Error::Conflict { .. } | Error::InvalidState { .. }) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(vm_id = %record.id, error = %e, "idle shelve failed");
                }
            }
        }

        for record in self.store.list_by_status(VmStatus::Shelved).await {
            let shelved_for = now - record.last_state_change;

            if shelved_for >= self.config.retention_threshold() {
                match self
                    .controller
                    .transition(record.id, LifecycleAction::Delete, Actor::Policy)
                    .await
                {
                    Ok(_) => {
                        report.deleted += 1;
                        tracing::info!(
                            vm_id = %record.id,
                            shelved_secs = shelved_for.num_seconds(),
                            "retention-expired VM deleted"
                        );
                    }
                    Err(Error::Conflict { .. } | Error::InvalidState { .. }) => report.skipped += 1,
                    Err(e) => {
                        tracing::warn!(vm_id = %record.id, error = %e, "retention delete failed");
                    }
                }
                continue;
            }

            let in_window = shelved_for >= self.config.warning_threshold()
                && shelved_for < self.config.warning_threshold() + self.config.notification_window();
            if in_window && !self.already_warned(&record) {
                self.warn(&record).await;
                report.warned += 1;
            }
        }

        report
    }

    /// A warning is sent at most once per shelving: the journal is checked
    /// for a WARNED entry newer than the record's last state change.
    fn already_warned(&self, record: &VmRecord) -> bool {
        match self.store.events_for(record.id) {
            Ok(events) => events
                .iter()
                .any(|e| e.outcome == EventOutcome::Warned && e.at >= record.last_state_change),
            Err(e) => {
                tracing::warn!(vm_id = %record.id, error = %e, "cannot read event journal");
                // Unknown history: do not spam the owner.
                true
            }
        }
    }

    async fn warn(&self, record: &VmRecord) {
        let warning = RetentionWarning {
            vm_id: record.id,
            owner: record.owner.clone(),
            shelved_since: record.last_state_change,
            delete_after: record.last_state_change + self.config.retention_threshold(),
        };
        self.notifier.retention_warning(&warning).await;

        let event = LifecycleEvent {
            vm_id: record.id,
            action: "retention-warning".to_string(),
            outcome: EventOutcome::Warned,
            actor: Actor::Policy,
            at: self.clock.now(),
            detail: Some(warning.message()),
        };
        if let Err(e) = self.store.append_event(&event) {
            tracing::error!(vm_id = %record.id, error = %e, "failed to record retention warning");
        }
    }
}
