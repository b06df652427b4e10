// Lifecycle controller - the single authority for sandbox state changes
//
// Every state change funnels through here: inbound requests, the idle
// policy and the reconciliation sweep all use the same entry points, so the
// exclusivity marker and the transition table are enforced in exactly one
// place.
//
// Discipline per operation: acquire the marker and write the transient
// state atomically, call the provider with no lock held, poll until the
// provider confirms completion, then commit the terminal state and release
// the marker. A bounded wait that expires leaves the transient state and
// marker in place for the reconciliation sweep; nothing is ever resolved
// optimistically.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::LifecycleConfig;
use crate::errors::{Error, ProviderError, Result};
use crate::gateway::{AccessBroker, ConnectionDescriptor};
use crate::notify::{NotificationSink, TransitionNotice};
use crate::provider::{ComputeProvider, InstanceStatus, ProviderOp};
use crate::state_machine::{FailureDisposition, TransitionPlan};
use crate::store::{BeginOutcome, VmStore};
use crate::types::{
    Actor, EventOutcome, InstanceId, LifecycleAction, LifecycleEvent, OpId, OwnerRef,
    ResourceSpec, VmId, VmRecord, VmStatus,
};

/// Result of reconciling one stuck record.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// The record was advanced, rolled back or faulted.
    Resolved(VmRecord),
    /// The operation is still settling at the provider; check again later.
    InFlight,
    /// The provider could not be reached; state left untouched.
    Unreachable,
    /// The record is not in a transient state; nothing to reconcile.
    Stable,
}

pub struct LifecycleController {
    store: Arc<VmStore>,
    provider: Arc<dyn ComputeProvider>,
    broker: Option<Arc<dyn AccessBroker>>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

/// Expected live status once `target` is reached. Deletion completes by
/// disappearing, so it has no expected status.
fn expected_status(target: VmStatus) -> Option<InstanceStatus> {
    match target {
        VmStatus::Active => Some(InstanceStatus::Active),
        VmStatus::Stopped => Some(InstanceStatus::Stopped),
        VmStatus::Shelved => Some(InstanceStatus::Shelved),
        _ => None,
    }
}

fn provider_op(action: LifecycleAction, spec: &ResourceSpec) -> ProviderOp {
    match action {
        LifecycleAction::Start => ProviderOp::Start,
        LifecycleAction::Stop => ProviderOp::Stop,
        LifecycleAction::Shelve => ProviderOp::Shelve,
        LifecycleAction::Unshelve => ProviderOp::Unshelve,
        LifecycleAction::Reset => ProviderOp::Rebuild {
            image: spec.image.clone(),
        },
        LifecycleAction::Delete => ProviderOp::Delete,
    }
}

/// Target state and failure disposition implied by a transient state, used
/// when reconciling records whose originating request is long gone.
fn reconcile_plan(transient: VmStatus) -> Option<(VmStatus, FailureDisposition)> {
    match transient {
        VmStatus::Provisioning => Some((VmStatus::Active, FailureDisposition::Fault)),
        VmStatus::Stopping => Some((VmStatus::Stopped, FailureDisposition::RollBack)),
        VmStatus::Shelving => Some((VmStatus::Shelved, FailureDisposition::RollBack)),
        VmStatus::Unshelving => Some((VmStatus::Active, FailureDisposition::RollBack)),
        VmStatus::Deleting => Some((VmStatus::Deleted, FailureDisposition::Fault)),
        _ => None,
    }
}

impl LifecycleController {
    pub fn new(
        store: Arc<VmStore>,
        provider: Arc<dyn ComputeProvider>,
        broker: Option<Arc<dyn AccessBroker>>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            provider,
            broker,
            notifier,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<VmStore> {
        &self.store
    }

    /// Create a sandbox VM. The record enters PROVISIONING before the
    /// provider is asked for anything; a reader immediately after this
    /// returns sees PROVISIONING or ACTIVE, never a tear-down state.
    pub async fn create(&self, owner: OwnerRef, spec: ResourceSpec) -> Result<VmRecord> {
        if owner.as_str().is_empty() {
            return Err(Error::Validation("owner reference must not be empty".into()));
        }
        if spec.flavor.is_empty() || spec.image.is_empty() {
            return Err(Error::Validation(
                "resource spec needs both a flavor and an image".into(),
            ));
        }

        let now = self.clock.now();
        let mut record = VmRecord::new(owner, spec, now);
        let op = OpId::new();
        record.pending_op = Some(op);
        let vm_id = record.id;
        self.store.insert(record.clone()).await?;
        self.log_event(vm_id, "create", EventOutcome::Started, Actor::User, None);
        tracing::info!(vm_id = %vm_id, flavor = %record.spec.flavor, "creating sandbox VM");

        let instance = match self.provider.provision(&record.spec).await {
            Ok(instance) => instance,
            Err(e) => {
                // Without an instance id there is nothing the sweep could
                // poll later, so any provisioning failure faults the record.
                self.fail_op(
                    vm_id,
                    op,
                    FailureDisposition::Fault,
                    "create",
                    Actor::User,
                    &e.to_string(),
                )
                .await?;
                return Err(e.into());
            }
        };
        self.store.set_instance_id(vm_id, instance.clone()).await?;

        let plan = TransitionPlan {
            transient: VmStatus::Provisioning,
            on_success: VmStatus::Active,
            on_failure: FailureDisposition::Fault,
        };
        self.wait_settle(vm_id, op, instance, "create", plan, Actor::User)
            .await
    }

    /// Request a lifecycle transition. Validation, marker acquisition and
    /// the transient-state write happen atomically in the store; a request
    /// against a VM with an operation in flight fails fast with `Conflict`.
    pub async fn transition(
        &self,
        vm_id: VmId,
        action: LifecycleAction,
        actor: Actor,
    ) -> Result<VmRecord> {
        let now = self.clock.now();
        let (op, plan, record) = match self.store.begin(vm_id, action, now).await? {
            BeginOutcome::Noop(record) => {
                tracing::debug!(vm_id = %vm_id, action = %action, "transition is a no-op");
                return Ok(record);
            }
            BeginOutcome::Started { op, plan, record } => (op, plan, record),
        };

        self.log_event(vm_id, action.as_str(), EventOutcome::Started, actor, None);
        if let Some(from) = record.prior_status {
            self.notify(vm_id, from, plan.transient, now).await;
        }

        // The compute allocation is about to go away; remote-desktop
        // connections must not outlive it.
        if matches!(plan.transient, VmStatus::Shelving | VmStatus::Deleting) {
            self.revoke_connections(&record).await;
        }

        let Some(instance) = record.instance_id.clone() else {
            // Creation faulted before an instance existed. Deleting such a
            // record is pure bookkeeping; resetting it provisions anew.
            return match action {
                LifecycleAction::Delete => {
                    self.finish_success(vm_id, op, plan, "delete", actor).await
                }
                LifecycleAction::Reset => self.reprovision(vm_id, op, &record, plan, actor).await,
                _ => {
                    let reason = "record has no provider instance";
                    self.fail_op(vm_id, op, FailureDisposition::Fault, action.as_str(), actor, reason)
                        .await?;
                    Err(ProviderError::Rejected(reason.to_string()).into())
                }
            };
        };

        match self.provider.submit(&instance, provider_op(action, &record.spec)).await {
            Ok(()) => {}
            Err(ProviderError::NotFound(_)) if action == LifecycleAction::Delete => {
                // Already gone underneath us: the desired outcome.
                return self.finish_success(vm_id, op, plan, "delete", actor).await;
            }
            Err(e @ ProviderError::NotFound(_)) => {
                self.fail_op(
                    vm_id,
                    op,
                    FailureDisposition::Fault,
                    action.as_str(),
                    actor,
                    "instance vanished at provider",
                )
                .await?;
                return Err(e.into());
            }
            Err(ProviderError::Unavailable(reason)) => {
                // State and marker stay; the reconciliation sweep owns the
                // operation from here.
                tracing::warn!(
                    vm_id = %vm_id,
                    action = %action,
                    %reason,
                    "provider unreachable, deferring to reconciliation"
                );
                return self.store.get(vm_id).await.ok_or(Error::NotFound(vm_id));
            }
            Err(e @ ProviderError::Rejected(_)) => {
                self.fail_op(vm_id, op, plan.on_failure, action.as_str(), actor, &e.to_string())
                    .await?;
                return Err(e.into());
            }
        }

        self.wait_settle(vm_id, op, instance, action.as_str(), plan, actor)
            .await
    }

    pub async fn get(&self, vm_id: VmId) -> Result<VmRecord> {
        self.store.get(vm_id).await.ok_or(Error::NotFound(vm_id))
    }

    pub async fn list(&self) -> Vec<VmRecord> {
        self.store.list().await
    }

    pub async fn list_suspended(&self) -> Vec<VmRecord> {
        self.store.list_by_status(VmStatus::Shelved).await
    }

    /// Record an activity signal for the VM. `last_activity` never moves
    /// backwards.
    pub async fn record_activity(&self, vm_id: VmId) -> Result<()> {
        self.store.record_activity(vm_id, self.clock.now()).await
    }

    /// Connection descriptor for an ACTIVE VM. Non-ACTIVE VMs never get
    /// connections created.
    pub async fn connection(&self, vm_id: VmId) -> Result<ConnectionDescriptor> {
        let record = self.get(vm_id).await?;
        if record.status != VmStatus::Active {
            return Err(Error::InvalidState {
                vm_id,
                current: record.status,
                requested: "connection".to_string(),
            });
        }
        let broker = self
            .broker
            .as_ref()
            .ok_or_else(|| Error::Validation("no remote-access broker configured".into()))?;
        Ok(broker.create_connection(&record).await?)
    }

    /// Resolve a record stuck in a transient state by asking the provider
    /// what actually happened. Used by the reconciliation sweep and safe to
    /// call on any record.
    pub async fn reconcile(&self, vm_id: VmId) -> Result<ReconcileOutcome> {
        let record = self.get(vm_id).await?;
        if record.status.is_stable() {
            return Ok(ReconcileOutcome::Stable);
        }
        let Some(op) = record.pending_op else {
            // Transient state and marker are written together, so this
            // would be an invariant breach. Refuse to guess.
            tracing::error!(vm_id = %vm_id, status = %record.status, "transient record without marker");
            return Ok(ReconcileOutcome::Stable);
        };
        let Some((target, on_failure)) = reconcile_plan(record.status) else {
            return Ok(ReconcileOutcome::Stable);
        };

        let Some(instance) = record.instance_id.clone() else {
            // Provisioning never yielded an instance; there is nothing to
            // poll. Deletion is trivially complete, anything else faults.
            let resolved = if record.status == VmStatus::Deleting {
                self.resolve(vm_id, op, record.status, VmStatus::Deleted, EventOutcome::Succeeded, None)
                    .await?
            } else {
                self.resolve(
                    vm_id,
                    op,
                    record.status,
                    VmStatus::Error,
                    EventOutcome::Failed,
                    Some("no provider instance to poll"),
                )
                .await?
            };
            return Ok(ReconcileOutcome::Resolved(resolved));
        };

        match self.provider.poll_status(&instance).await {
            Err(ProviderError::NotFound(_)) => {
                let resolved = if record.status == VmStatus::Deleting {
                    self.resolve(vm_id, op, record.status, VmStatus::Deleted, EventOutcome::Succeeded, None)
                        .await?
                } else {
                    self.resolve(
                        vm_id,
                        op,
                        record.status,
                        VmStatus::Error,
                        EventOutcome::Failed,
                        Some("instance vanished at provider"),
                    )
                    .await?
                };
                Ok(ReconcileOutcome::Resolved(resolved))
            }
            Err(ProviderError::Unavailable(reason)) => {
                tracing::debug!(vm_id = %vm_id, %reason, "provider unreachable during reconciliation");
                Ok(ReconcileOutcome::Unreachable)
            }
            Err(ProviderError::Rejected(reason)) => {
                tracing::warn!(vm_id = %vm_id, %reason, "status poll rejected during reconciliation");
                Ok(ReconcileOutcome::Unreachable)
            }
            Ok(live) => {
                if expected_status(target) == Some(live) {
                    let resolved = self
                        .resolve(vm_id, op, record.status, target, EventOutcome::Succeeded, None)
                        .await?;
                    if target == VmStatus::Active {
                        self.create_connection(&resolved).await;
                    }
                    return Ok(ReconcileOutcome::Resolved(resolved));
                }
                if live == InstanceStatus::Error {
                    let resolved = self
                        .resolve(
                            vm_id,
                            op,
                            record.status,
                            VmStatus::Error,
                            EventOutcome::Failed,
                            Some("instance entered ERROR"),
                        )
                        .await?;
                    return Ok(ReconcileOutcome::Resolved(resolved));
                }
                if record.status == VmStatus::Deleting {
                    // Deletion leaves the live status unchanged until the
                    // instance disappears. Retry it forward: the delete may
                    // have been lost, and re-issuing it is idempotent.
                    if let Err(e) = self.provider.submit(&instance, ProviderOp::Delete).await {
                        tracing::debug!(vm_id = %vm_id, error = %e, "delete re-issue not accepted");
                    }
                    return Ok(ReconcileOutcome::InFlight);
                }
                let never_started = record
                    .prior_status
                    .and_then(expected_status)
                    .is_some_and(|prior_live| prior_live == live);
                if never_started && on_failure == FailureDisposition::RollBack {
                    let now = self.clock.now();
                    let rolled = match self.store.roll_back(vm_id, op, now).await {
                        Ok(r) => r,
                        Err(Error::Conflict { .. }) => {
                            return Ok(ReconcileOutcome::Resolved(self.get(vm_id).await?))
                        }
                        Err(e) => return Err(e),
                    };
                    self.log_event(
                        vm_id,
                        "reconcile",
                        EventOutcome::Failed,
                        Actor::Reconciler,
                        Some(format!(
                            "operation never started, rolled back to {} (recoverable)",
                            rolled.status
                        )),
                    );
                    self.notify(vm_id, record.status, rolled.status, now).await;
                    return Ok(ReconcileOutcome::Resolved(rolled));
                }
                Ok(ReconcileOutcome::InFlight)
            }
        }
    }

    /// Commit a reconciliation verdict and emit the event and notice.
    async fn resolve(
        &self,
        vm_id: VmId,
        op: OpId,
        from: VmStatus,
        to: VmStatus,
        outcome: EventOutcome,
        detail: Option<&str>,
    ) -> Result<VmRecord> {
        let now = self.clock.now();
        let record = match self.store.commit(vm_id, op, to, now).await {
            Ok(record) => record,
            Err(Error::Conflict { .. }) => return self.get(vm_id).await,
            Err(e) => return Err(e),
        };
        self.log_event(
            vm_id,
            "reconcile",
            outcome,
            Actor::Reconciler,
            detail.map(str::to_string),
        );
        self.notify(vm_id, from, to, now).await;
        Ok(record)
    }

    async fn reprovision(
        &self,
        vm_id: VmId,
        op: OpId,
        record: &VmRecord,
        plan: TransitionPlan,
        actor: Actor,
    ) -> Result<VmRecord> {
        match self.provider.provision(&record.spec).await {
            Ok(instance) => {
                self.store.set_instance_id(vm_id, instance.clone()).await?;
                self.wait_settle(vm_id, op, instance, "reset", plan, actor).await
            }
            Err(e) => {
                self.fail_op(vm_id, op, FailureDisposition::Fault, "reset", actor, &e.to_string())
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Poll the provider until the operation settles, the instance errors
    /// out, or the bounded wait expires. Expiry leaves the transient state
    /// and marker in place for the reconciliation sweep.
    async fn wait_settle(
        &self,
        vm_id: VmId,
        op: OpId,
        instance: InstanceId,
        action: &str,
        plan: TransitionPlan,
        actor: Actor,
    ) -> Result<VmRecord> {
        let deadline = tokio::time::Instant::now() + self.config.operation_timeout();
        let expected = expected_status(plan.on_success);

        loop {
            match self.provider.poll_status(&instance).await {
                Ok(live) => {
                    if expected == Some(live) {
                        return self.finish_success(vm_id, op, plan, action, actor).await;
                    }
                    if live == InstanceStatus::Error {
                        self.fail_op(vm_id, op, plan.on_failure, action, actor, "instance entered ERROR")
                            .await?;
                        return Err(ProviderError::Rejected("instance entered ERROR".into()).into());
                    }
                }
                Err(ProviderError::NotFound(name)) => {
                    if plan.on_success == VmStatus::Deleted {
                        return self.finish_success(vm_id, op, plan, action, actor).await;
                    }
                    self.fail_op(
                        vm_id,
                        op,
                        FailureDisposition::Fault,
                        action,
                        actor,
                        "instance vanished at provider",
                    )
                    .await?;
                    return Err(ProviderError::NotFound(name).into());
                }
                // Transient poll trouble: keep trying until the deadline.
                Err(ProviderError::Unavailable(_)) | Err(ProviderError::Rejected(_)) => {}
            }

            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }

        tracing::warn!(
            vm_id = %vm_id,
            action,
            "operation did not settle within its bounded wait, deferring to reconciliation"
        );
        self.store.get(vm_id).await.ok_or(Error::NotFound(vm_id))
    }

    async fn finish_success(
        &self,
        vm_id: VmId,
        op: OpId,
        plan: TransitionPlan,
        action: &str,
        actor: Actor,
    ) -> Result<VmRecord> {
        let now = self.clock.now();
        let record = match self.store.commit(vm_id, op, plan.on_success, now).await {
            Ok(record) => record,
            // Resolved by the sweep while we were polling; its verdict wins.
            Err(Error::Conflict { .. }) => return self.get(vm_id).await,
            Err(e) => return Err(e),
        };
        self.log_event(vm_id, action, EventOutcome::Succeeded, actor, None);
        self.notify(vm_id, plan.transient, plan.on_success, now).await;
        if actor == Actor::User {
            self.store.record_activity(vm_id, now).await?;
        }
        if plan.on_success == VmStatus::Active {
            self.create_connection(&record).await;
        }
        tracing::info!(vm_id = %vm_id, action, status = %record.status, "operation completed");
        Ok(record)
    }

    async fn fail_op(
        &self,
        vm_id: VmId,
        op: OpId,
        disposition: FailureDisposition,
        action: &str,
        actor: Actor,
        detail: &str,
    ) -> Result<VmRecord> {
        let now = self.clock.now();
        let from = self.get(vm_id).await?.status;
        let attempt = match disposition {
            FailureDisposition::RollBack => self.store.roll_back(vm_id, op, now).await,
            FailureDisposition::Fault => self.store.commit(vm_id, op, VmStatus::Error, now).await,
        };
        let record = match attempt {
            Ok(record) => record,
            Err(Error::Conflict { .. }) => return self.get(vm_id).await,
            Err(e) => return Err(e),
        };
        self.log_event(
            vm_id,
            action,
            EventOutcome::Failed,
            actor,
            Some(detail.to_string()),
        );
        self.notify(vm_id, from, record.status, now).await;
        tracing::warn!(vm_id = %vm_id, action, status = %record.status, detail, "operation failed");
        Ok(record)
    }

    fn log_event(
        &self,
        vm_id: VmId,
        action: &str,
        outcome: EventOutcome,
        actor: Actor,
        detail: Option<String>,
    ) {
        let event = LifecycleEvent {
            vm_id,
            action: action.to_string(),
            outcome,
            actor,
            at: self.clock.now(),
            detail,
        };
        if let Err(e) = self.store.append_event(&event) {
            tracing::error!(vm_id = %vm_id, error = %e, "failed to append lifecycle event");
        }
    }

    async fn notify(&self, vm_id: VmId, from: VmStatus, to: VmStatus, at: chrono::DateTime<chrono::Utc>) {
        self.notifier
            .transition(&TransitionNotice { vm_id, from, to, at })
            .await;
    }

    async fn create_connection(&self, record: &VmRecord) {
        let Some(broker) = &self.broker else { return };
        if let Err(e) = broker.create_connection(record).await {
            tracing::warn!(vm_id = %record.id, error = %e, "failed to create remote-access connection");
        }
    }

    async fn revoke_connections(&self, record: &VmRecord) {
        let Some(broker) = &self.broker else { return };
        if let Err(e) = broker.revoke_connections(record).await {
            tracing::warn!(vm_id = %record.id, error = %e, "failed to revoke remote-access connections");
        }
    }
}
