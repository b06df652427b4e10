// Integration tests for the sandbox VM lifecycle
//
// Drives the controller, policy engine and reconciliation sweep end to end
// against the in-memory fake provider and a manually advanced clock.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use sandboxd::clock::ManualClock;
use sandboxd::config::LifecycleConfig;
use sandboxd::controller::{LifecycleController, ReconcileOutcome};
use sandboxd::errors::Error;
use sandboxd::gateway::AccessBroker;
use sandboxd::notify::NotificationSink;
use sandboxd::policy::IdlePolicy;
use sandboxd::provider::{ComputeProvider, InstanceStatus};
use sandboxd::reconciler::Reconciler;
use sandboxd::store::VmStore;
use sandboxd::testing::{FakeBroker, FakeProvider, RecordingSink};
use sandboxd::types::{
    Actor, EventOutcome, LifecycleAction, OwnerRef, ResourceSpec, VmRecord, VmStatus,
};

struct Harness {
    _dir: TempDir,
    store: Arc<VmStore>,
    provider: Arc<FakeProvider>,
    broker: Arc<FakeBroker>,
    sink: Arc<RecordingSink>,
    clock: ManualClock,
    controller: Arc<LifecycleController>,
    config: LifecycleConfig,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(VmStore::open(dir.path()).unwrap());
    let provider = Arc::new(FakeProvider::new());
    let broker = Arc::new(FakeBroker::new());
    let sink = Arc::new(RecordingSink::new());
    let clock = ManualClock::at(Utc::now());
    let config = LifecycleConfig::testing();

    let controller = Arc::new(LifecycleController::new(
        Arc::clone(&store),
        Arc::clone(&provider) as Arc<dyn ComputeProvider>,
        Some(Arc::clone(&broker) as Arc<dyn AccessBroker>),
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
        Arc::new(clock.clone()),
        config.clone(),
    ));

    Harness {
        _dir: dir,
        store,
        provider,
        broker,
        sink,
        clock,
        controller,
        config,
    }
}

impl Harness {
    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.controller),
            Arc::new(self.clock.clone()),
            self.config.clone(),
        )
    }

    fn policy(&self) -> IdlePolicy {
        IdlePolicy::new(
            Arc::clone(&self.store),
            Arc::clone(&self.controller),
            Arc::clone(&self.sink) as Arc<dyn NotificationSink>,
            Arc::new(self.clock.clone()),
            self.config.clone(),
        )
    }

    async fn create_active(&self) -> VmRecord {
        let record = self
            .controller
            .create(
                OwnerRef::new("project-42"),
                ResourceSpec {
                    flavor: "m1.medium".into(),
                    image: "sandbox-base".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(record.status, VmStatus::Active);
        record
    }
}

#[tokio::test]
async fn create_provisions_and_reaches_active() {
    let h = harness();
    let record = h.create_active().await;

    assert!(record.instance_id.is_some());
    assert!(record.pending_op.is_none());
    assert_eq!(h.provider.provision_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    let fetched = h.controller.get(record.id).await.unwrap();
    assert_eq!(fetched.status, VmStatus::Active);

    // Audit journal holds the attempt and its confirmation.
    let events = h.store.events_for(record.id).unwrap();
    assert!(events
        .iter()
        .any(|e| e.action == "create" && e.outcome == EventOutcome::Started));
    assert!(events
        .iter()
        .any(|e| e.action == "create" && e.outcome == EventOutcome::Succeeded));

    // An ACTIVE VM gets its remote-access connection.
    assert!(h.broker.created.lock().unwrap().contains(&record.id));
}

#[tokio::test]
async fn create_never_exposes_a_teardown_state() {
    let h = harness();
    let record = h.create_active().await;
    let fetched = h.controller.get(record.id).await.unwrap();
    assert!(matches!(
        fetched.status,
        VmStatus::Provisioning | VmStatus::Active
    ));
}

#[tokio::test]
async fn failed_provision_faults_the_record() {
    let h = harness();
    h.provider.reject_provision(Some("quota exceeded"));

    let result = h
        .controller
        .create(
            OwnerRef::new("project-42"),
            ResourceSpec {
                flavor: "m1.medium".into(),
                image: "sandbox-base".into(),
            },
        )
        .await;
    assert!(matches!(result, Err(Error::Provider(_))));

    let records = h.controller.list().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, VmStatus::Error);
    assert!(records[0].pending_op.is_none());
}

#[tokio::test]
async fn empty_spec_is_rejected_before_any_provider_call() {
    let h = harness();
    let result = h
        .controller
        .create(
            OwnerRef::new("project-42"),
            ResourceSpec {
                flavor: String::new(),
                image: "sandbox-base".into(),
            },
        )
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));
    assert_eq!(h.provider.provision_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stop_start_round_trip() {
    let h = harness();
    let record = h.create_active().await;

    let stopped = h
        .controller
        .transition(record.id, LifecycleAction::Stop, Actor::User)
        .await
        .unwrap();
    assert_eq!(stopped.status, VmStatus::Stopped);

    let started = h
        .controller
        .transition(record.id, LifecycleAction::Start, Actor::User)
        .await
        .unwrap();
    assert_eq!(started.status, VmStatus::Active);
}

#[tokio::test]
async fn rejected_stop_rolls_back_to_active() {
    let h = harness();
    let record = h.create_active().await;

    h.provider.reject_submits(Some("maintenance window"));
    let result = h
        .controller
        .transition(record.id, LifecycleAction::Stop, Actor::User)
        .await;
    assert!(matches!(result, Err(Error::Provider(_))));

    let fetched = h.controller.get(record.id).await.unwrap();
    assert_eq!(fetched.status, VmStatus::Active);
    assert!(fetched.pending_op.is_none());

    let events = h.store.events_for(record.id).unwrap();
    assert!(events
        .iter()
        .any(|e| e.action == "stop" && e.outcome == EventOutcome::Failed));
}

#[tokio::test]
async fn shelve_and_unshelve_round_trip() {
    let h = harness();
    let record = h.create_active().await;

    let shelved = h
        .controller
        .transition(record.id, LifecycleAction::Shelve, Actor::User)
        .await
        .unwrap();
    assert_eq!(shelved.status, VmStatus::Shelved);
    // Shelving tears remote-access connections down.
    assert!(h.broker.revoked.lock().unwrap().contains(&record.id));

    assert_eq!(h.controller.list_suspended().await.len(), 1);

    let active = h
        .controller
        .transition(record.id, LifecycleAction::Unshelve, Actor::User)
        .await
        .unwrap();
    assert_eq!(active.status, VmStatus::Active);
    // And reactivation recreates one.
    assert_eq!(
        h.broker
            .created
            .lock()
            .unwrap()
            .iter()
            .filter(|id| **id == record.id)
            .count(),
        2
    );
}

#[tokio::test]
async fn concurrent_duplicates_yield_one_provider_call() {
    let h = harness();
    let record = h.create_active().await;
    let submits_before = h.provider.submit_calls.load(std::sync::atomic::Ordering::SeqCst);

    // Hold the winning submit open so the second request overlaps it.
    h.provider.set_submit_delay(Some(StdDuration::from_millis(100)));

    let c1 = Arc::clone(&h.controller);
    let c2 = Arc::clone(&h.controller);
    let id = record.id;
    let first = tokio::spawn(async move {
        c1.transition(id, LifecycleAction::Shelve, Actor::User).await
    });
    tokio::time::sleep(StdDuration::from_millis(10)).await;
    let second = tokio::spawn(async move {
        c2.transition(id, LifecycleAction::Shelve, Actor::User).await
    });

    let results = [first.await.unwrap(), second.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(Error::Conflict { .. })))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 1);

    // Exactly one shelve reached the provider.
    assert_eq!(
        h.provider.submit_calls.load(std::sync::atomic::Ordering::SeqCst),
        submits_before + 1
    );
    assert_eq!(
        h.controller.get(record.id).await.unwrap().status,
        VmStatus::Shelved
    );
}

#[tokio::test]
async fn delete_is_idempotent() {
    let h = harness();
    let record = h.create_active().await;

    let deleted = h
        .controller
        .transition(record.id, LifecycleAction::Delete, Actor::User)
        .await
        .unwrap();
    assert_eq!(deleted.status, VmStatus::Deleted);
    let submits = h.provider.submit_calls.load(std::sync::atomic::Ordering::SeqCst);

    // Deleting again succeeds without touching the provider.
    let again = h
        .controller
        .transition(record.id, LifecycleAction::Delete, Actor::User)
        .await
        .unwrap();
    assert_eq!(again.status, VmStatus::Deleted);
    assert_eq!(
        h.provider.submit_calls.load(std::sync::atomic::Ordering::SeqCst),
        submits
    );
}

#[tokio::test]
async fn deleting_an_already_vanished_instance_succeeds() {
    let h = harness();
    let record = h.create_active().await;
    h.provider.remove_instance(record.instance_id.as_ref().unwrap());

    let deleted = h
        .controller
        .transition(record.id, LifecycleAction::Delete, Actor::User)
        .await
        .unwrap();
    assert_eq!(deleted.status, VmStatus::Deleted);
}

#[tokio::test]
async fn illegal_transitions_surface_invalid_state() {
    let h = harness();
    let record = h.create_active().await;

    let result = h
        .controller
        .transition(record.id, LifecycleAction::Unshelve, Actor::User)
        .await;
    assert!(matches!(result, Err(Error::InvalidState { .. })));
    // The record is untouched.
    assert_eq!(
        h.controller.get(record.id).await.unwrap().status,
        VmStatus::Active
    );
}

#[tokio::test]
async fn vanished_instance_during_start_reconciliation_faults() {
    let h = harness();
    let record = h.create_active().await;
    h.controller
        .transition(record.id, LifecycleAction::Stop, Actor::User)
        .await
        .unwrap();

    // The start is accepted but never settles within the bounded wait.
    h.provider.set_auto_complete(false);
    let pending = h
        .controller
        .transition(record.id, LifecycleAction::Start, Actor::User)
        .await
        .unwrap();
    assert_eq!(pending.status, VmStatus::Provisioning);
    assert!(pending.pending_op.is_some());

    // The instance disappears underneath; the sweep must fault the record.
    h.provider.remove_instance(record.instance_id.as_ref().unwrap());
    let report = h.reconciler().sweep().await;
    assert_eq!(report.resolved, 1);

    let fetched = h.controller.get(record.id).await.unwrap();
    assert_eq!(fetched.status, VmStatus::Error);
    assert!(fetched.pending_op.is_none());

    let events = h.store.events_for(record.id).unwrap();
    assert!(events
        .iter()
        .any(|e| e.action == "reconcile" && e.outcome == EventOutcome::Failed));
}

#[tokio::test]
async fn reset_recovers_a_faulted_record() {
    let h = harness();
    // Fault the creation before an instance ever exists.
    h.provider.reject_provision(Some("quota exceeded"));
    let _ = h
        .controller
        .create(
            OwnerRef::new("project-42"),
            ResourceSpec {
                flavor: "m1.medium".into(),
                image: "sandbox-base".into(),
            },
        )
        .await;
    let record = h.controller.list().await.pop().unwrap();
    assert_eq!(record.status, VmStatus::Error);

    // Reset provisions anew and lands in ACTIVE.
    h.provider.reject_provision(None);
    let reset = h
        .controller
        .transition(record.id, LifecycleAction::Reset, Actor::User)
        .await
        .unwrap();
    assert_eq!(reset.status, VmStatus::Active);
    assert!(reset.instance_id.is_some());
}

#[tokio::test]
async fn stuck_shelve_is_advanced_once_the_provider_settles() {
    let h = harness();
    let record = h.create_active().await;

    h.provider.set_auto_complete(false);
    let pending = h
        .controller
        .transition(record.id, LifecycleAction::Shelve, Actor::User)
        .await
        .unwrap();
    assert_eq!(pending.status, VmStatus::Shelving);

    // The provider finishes the shelve out of band.
    h.provider
        .set_status(record.instance_id.as_ref().unwrap(), InstanceStatus::Shelved);

    let report = h.reconciler().sweep().await;
    assert_eq!(report.resolved, 1);
    let fetched = h.controller.get(record.id).await.unwrap();
    assert_eq!(fetched.status, VmStatus::Shelved);
    assert!(fetched.pending_op.is_none());
}

#[tokio::test]
async fn sweep_rolls_back_an_operation_that_never_started() {
    let h = harness();
    let record = h.create_active().await;

    h.provider.set_auto_complete(false);
    h.controller
        .transition(record.id, LifecycleAction::Shelve, Actor::User)
        .await
        .unwrap();

    // The provider still reports the pre-operation status: the shelve was
    // lost. The record must return to its previous stable state.
    let report = h.reconciler().sweep().await;
    assert_eq!(report.resolved, 1);
    let fetched = h.controller.get(record.id).await.unwrap();
    assert_eq!(fetched.status, VmStatus::Active);
    assert!(fetched.pending_op.is_none());
}

#[tokio::test]
async fn unreachable_provider_leaves_state_untouched() {
    let h = harness();
    let record = h.create_active().await;

    h.provider.set_auto_complete(false);
    h.controller
        .transition(record.id, LifecycleAction::Shelve, Actor::User)
        .await
        .unwrap();

    h.provider.set_unavailable(true);
    let report = h.reconciler().sweep().await;
    assert_eq!(report.resolved, 0);
    assert_eq!(report.unreachable, 1);

    let fetched = h.controller.get(record.id).await.unwrap();
    assert_eq!(fetched.status, VmStatus::Shelving);
    assert!(fetched.pending_op.is_some());
}

#[tokio::test]
async fn lost_delete_is_retried_forward_by_the_sweep() {
    let h = harness();
    let record = h.create_active().await;

    h.provider.set_auto_complete(false);
    let pending = h
        .controller
        .transition(record.id, LifecycleAction::Delete, Actor::User)
        .await
        .unwrap();
    assert_eq!(pending.status, VmStatus::Deleting);

    // First sweep re-issues the delete (auto-complete now lets it land),
    // second sweep observes the instance gone and commits DELETED.
    h.provider.set_auto_complete(true);
    let outcome = h.controller.reconcile(record.id).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::InFlight));

    let outcome = h.controller.reconcile(record.id).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Resolved(_)));
    assert_eq!(
        h.controller.get(record.id).await.unwrap().status,
        VmStatus::Deleted
    );
}

#[tokio::test]
async fn idle_vms_are_shelved_and_fresh_ones_left_alone() {
    let h = harness();
    let idle = h.create_active().await;
    let busy = h.create_active().await;

    h.clock.advance(Duration::seconds(h.config.idle_threshold_secs as i64 + 10));
    h.controller.record_activity(busy.id).await.unwrap();

    let report = h.policy().sweep().await;
    assert_eq!(report.shelved, 1);

    assert_eq!(
        h.controller.get(idle.id).await.unwrap().status,
        VmStatus::Shelved
    );
    assert_eq!(
        h.controller.get(busy.id).await.unwrap().status,
        VmStatus::Active
    );
}

#[tokio::test]
async fn retention_expired_vms_are_deleted() {
    let h = harness();
    let record = h.create_active().await;
    h.controller
        .transition(record.id, LifecycleAction::Shelve, Actor::User)
        .await
        .unwrap();

    h.clock
        .advance(Duration::seconds(h.config.retention_threshold_secs as i64 + 10));
    let report = h.policy().sweep().await;
    assert_eq!(report.deleted, 1);
    assert_eq!(
        h.controller.get(record.id).await.unwrap().status,
        VmStatus::Deleted
    );
}

#[tokio::test]
async fn retention_warning_fires_once_inside_the_window() {
    let h = harness();
    let record = h.create_active().await;
    h.controller
        .transition(record.id, LifecycleAction::Shelve, Actor::User)
        .await
        .unwrap();

    // Before the window: nothing.
    let report = h.policy().sweep().await;
    assert_eq!(report.warned, 0);

    // Inside the window: exactly one warning, journalled as WARNED.
    h.clock
        .advance(Duration::seconds(h.config.warning_threshold_secs as i64 + 10));
    let report = h.policy().sweep().await;
    assert_eq!(report.warned, 1);
    assert_eq!(h.sink.warnings.lock().unwrap().len(), 1);

    let report = h.policy().sweep().await;
    assert_eq!(report.warned, 0, "warning must not repeat");
    assert_eq!(h.sink.warnings.lock().unwrap().len(), 1);

    let events = h.store.events_for(record.id).unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| e.outcome == EventOutcome::Warned)
            .count(),
        1
    );
}

#[tokio::test]
async fn committed_transitions_are_announced() {
    let h = harness();
    let record = h.create_active().await;
    h.controller
        .transition(record.id, LifecycleAction::Shelve, Actor::User)
        .await
        .unwrap();

    assert!(h.sink.saw_transition(VmStatus::Provisioning, VmStatus::Active));
    assert!(h.sink.saw_transition(VmStatus::Active, VmStatus::Shelving));
    assert!(h.sink.saw_transition(VmStatus::Shelving, VmStatus::Shelved));
}

#[tokio::test]
async fn connections_are_refused_for_non_active_vms() {
    let h = harness();
    let record = h.create_active().await;

    assert!(h.controller.connection(record.id).await.is_ok());

    h.controller
        .transition(record.id, LifecycleAction::Shelve, Actor::User)
        .await
        .unwrap();
    let refused = h.controller.connection(record.id).await;
    assert!(matches!(refused, Err(Error::InvalidState { .. })));
}

#[tokio::test]
async fn restart_recovers_records_and_sweep_resolves_them() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::at(Utc::now());
    let provider = Arc::new(FakeProvider::new());
    let config = LifecycleConfig::testing();

    let vm_id;
    let instance;
    {
        let store = Arc::new(VmStore::open(dir.path()).unwrap());
        let controller = Arc::new(LifecycleController::new(
            Arc::clone(&store),
            Arc::clone(&provider) as Arc<dyn ComputeProvider>,
            None,
            Arc::new(RecordingSink::new()) as Arc<dyn NotificationSink>,
            Arc::new(clock.clone()),
            config.clone(),
        ));
        let record = controller
            .create(
                OwnerRef::new("project-42"),
                ResourceSpec {
                    flavor: "m1.medium".into(),
                    image: "sandbox-base".into(),
                },
            )
            .await
            .unwrap();
        vm_id = record.id;
        instance = record.instance_id.clone().unwrap();

        provider.set_auto_complete(false);
        controller
            .transition(vm_id, LifecycleAction::Shelve, Actor::User)
            .await
            .unwrap();
        // Process "crashes" here with the record stuck in SHELVING.
    }

    provider.set_status(&instance, InstanceStatus::Shelved);

    let store = Arc::new(VmStore::open(dir.path()).unwrap());
    assert_eq!(store.recover().unwrap(), 1);
    let controller = Arc::new(LifecycleController::new(
        Arc::clone(&store),
        Arc::clone(&provider) as Arc<dyn ComputeProvider>,
        None,
        Arc::new(RecordingSink::new()) as Arc<dyn NotificationSink>,
        Arc::new(clock.clone()),
        config.clone(),
    ));
    let reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&controller),
        Arc::new(clock.clone()),
        config,
    );

    let report = reconciler.sweep().await;
    assert_eq!(report.resolved, 1);
    assert_eq!(
        controller.get(vm_id).await.unwrap().status,
        VmStatus::Shelved
    );
}
