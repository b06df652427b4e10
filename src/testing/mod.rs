//! Deterministic test doubles for the lifecycle layer.
//!
//! A scriptable in-memory provider, a recording broker and notification
//! sink, and the manually advanced clock. Used by the unit and integration
//! tests; nothing here talks to a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::ProviderError;
use crate::gateway::{AccessBroker, BrokerError, ConnectionDescriptor};
use crate::notify::{NotificationSink, RetentionWarning, TransitionNotice};
use crate::provider::{ComputeProvider, InstanceStatus, ProviderOp};
use crate::types::{InstanceId, ResourceSpec, VmId, VmRecord};

pub use crate::clock::ManualClock;

/// In-memory provider with scriptable failures.
///
/// By default it auto-completes: a provisioned instance is immediately
/// ACTIVE and a submitted operation immediately reaches its target status,
/// so the controller's first completion poll succeeds. Turning
/// auto-complete off leaves instances settling forever, which is how tests
/// manufacture stuck transients for the reconciliation sweep.
#[derive(Default)]
pub struct FakeProvider {
    statuses: Mutex<HashMap<InstanceId, InstanceStatus>>,
    next_instance: AtomicUsize,
    pub provision_calls: AtomicUsize,
    pub submit_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
    auto_complete: Mutex<bool>,
    unavailable: Mutex<bool>,
    reject_submits: Mutex<Option<String>>,
    reject_provision: Mutex<Option<String>>,
    submit_delay: Mutex<Option<Duration>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            auto_complete: Mutex::new(true),
            ..Self::default()
        }
    }

    /// Stop operations from completing on their own.
    pub fn set_auto_complete(&self, on: bool) {
        *self.auto_complete.lock().unwrap() = on;
    }

    /// Make every call fail with `Unavailable` until turned off.
    pub fn set_unavailable(&self, on: bool) {
        *self.unavailable.lock().unwrap() = on;
    }

    /// Make `submit` fail with `Rejected`.
    pub fn reject_submits(&self, reason: Option<&str>) {
        *self.reject_submits.lock().unwrap() = reason.map(str::to_string);
    }

    /// Make `provision` fail with `Rejected`.
    pub fn reject_provision(&self, reason: Option<&str>) {
        *self.reject_provision.lock().unwrap() = reason.map(str::to_string);
    }

    /// Hold each submit open for `delay`, so concurrent callers overlap.
    pub fn set_submit_delay(&self, delay: Option<Duration>) {
        *self.submit_delay.lock().unwrap() = delay;
    }

    /// Force a live status, as if the provider resolved out of band.
    pub fn set_status(&self, instance: &InstanceId, status: InstanceStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(instance.clone(), status);
    }

    /// Drop the instance entirely; subsequent calls see `NotFound`.
    pub fn remove_instance(&self, instance: &InstanceId) {
        self.statuses.lock().unwrap().remove(instance);
    }

    pub fn status_of(&self, instance: &InstanceId) -> Option<InstanceStatus> {
        self.statuses.lock().unwrap().get(instance).copied()
    }

    fn check_unavailable(&self) -> Result<(), ProviderError> {
        if *self.unavailable.lock().unwrap() {
            Err(ProviderError::Unavailable("fake provider offline".into()))
        } else {
            Ok(())
        }
    }

    fn op_target(op: &ProviderOp) -> Option<InstanceStatus> {
        match op {
            ProviderOp::Start | ProviderOp::Unshelve | ProviderOp::Rebuild { .. } => {
                Some(InstanceStatus::Active)
            }
            ProviderOp::Stop => Some(InstanceStatus::Stopped),
            ProviderOp::Shelve => Some(InstanceStatus::Shelved),
            ProviderOp::Delete => None,
        }
    }
}

#[async_trait]
impl ComputeProvider for FakeProvider {
    async fn provision(&self, _spec: &ResourceSpec) -> Result<InstanceId, ProviderError> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        self.check_unavailable()?;
        if let Some(reason) = self.reject_provision.lock().unwrap().clone() {
            return Err(ProviderError::Rejected(reason));
        }

        let n = self.next_instance.fetch_add(1, Ordering::SeqCst);
        let instance = InstanceId::new(format!("i-{n:04}"));
        let status = if *self.auto_complete.lock().unwrap() {
            InstanceStatus::Active
        } else {
            InstanceStatus::Building
        };
        self.statuses
            .lock()
            .unwrap()
            .insert(instance.clone(), status);
        Ok(instance)
    }

    async fn submit(&self, instance: &InstanceId, op: ProviderOp) -> Result<(), ProviderError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.submit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_unavailable()?;
        if let Some(reason) = self.reject_submits.lock().unwrap().clone() {
            return Err(ProviderError::Rejected(reason));
        }
        if !self.statuses.lock().unwrap().contains_key(instance) {
            return Err(ProviderError::NotFound(instance.to_string()));
        }

        if *self.auto_complete.lock().unwrap() {
            match Self::op_target(&op) {
                Some(target) => self.set_status(instance, target),
                None => self.remove_instance(instance),
            }
        }
        Ok(())
    }

    async fn poll_status(&self, instance: &InstanceId) -> Result<InstanceStatus, ProviderError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.check_unavailable()?;
        self.statuses
            .lock()
            .unwrap()
            .get(instance)
            .copied()
            .ok_or_else(|| ProviderError::NotFound(instance.to_string()))
    }
}

/// Broker that records which VMs had connections created or revoked.
#[derive(Default)]
pub struct FakeBroker {
    pub created: Mutex<Vec<VmId>>,
    pub revoked: Mutex<Vec<VmId>>,
    fail: Mutex<bool>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, on: bool) {
        *self.fail.lock().unwrap() = on;
    }
}

#[async_trait]
impl AccessBroker for FakeBroker {
    async fn create_connection(&self, vm: &VmRecord) -> Result<ConnectionDescriptor, BrokerError> {
        if *self.fail.lock().unwrap() {
            return Err(BrokerError::Request("fake broker failing".into()));
        }
        self.created.lock().unwrap().push(vm.id);
        Ok(ConnectionDescriptor {
            connection_id: format!("rdp-{}", vm.id),
            protocol: "rdp".into(),
            hostname: vm
                .instance_id
                .as_ref()
                .map(|i| i.as_str().to_string())
                .unwrap_or_default(),
            port: 3389,
        })
    }

    async fn revoke_connections(&self, vm: &VmRecord) -> Result<(), BrokerError> {
        if *self.fail.lock().unwrap() {
            return Err(BrokerError::Request("fake broker failing".into()));
        }
        self.revoked.lock().unwrap().push(vm.id);
        Ok(())
    }
}

/// Sink that records every notice it receives.
#[derive(Default)]
pub struct RecordingSink {
    pub transitions: Mutex<Vec<TransitionNotice>>,
    pub warnings: Mutex<Vec<RetentionWarning>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saw_transition(&self, from: crate::types::VmStatus, to: crate::types::VmStatus) -> bool {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .any(|n| n.from == from && n.to == to)
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn transition(&self, notice: &TransitionNotice) {
        self.transitions.lock().unwrap().push(notice.clone());
    }

    async fn retention_warning(&self, warning: &RetentionWarning) {
        self.warnings.lock().unwrap().push(warning.clone());
    }
}
