// Sandbox VM records, statuses and lifecycle events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier owned by this system, assigned when the record is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(Uuid);

impl VmId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for VmId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Provider-assigned instance identifier. Opaque; set exactly once when
/// provisioning succeeds and never rewritten for the life of the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// In-flight operation identifier. Holding this marker on a record is the
/// per-VM mutual exclusion mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(Uuid);

impl OpId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque reference to the owning project or user. Not interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerRef(String);

impl OwnerRef {
    pub fn new(owner: impl Into<String>) -> Self {
        Self(owner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Logical state of a sandbox VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmStatus {
    Provisioning,
    Active,
    Stopping,
    Stopped,
    Shelving,
    Shelved,
    Unshelving,
    Deleting,
    Deleted,
    Error,
}

impl VmStatus {
    /// States that describe an operation still settling at the provider.
    /// A record stuck in one of these is a candidate for reconciliation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VmStatus::Provisioning
                | VmStatus::Stopping
                | VmStatus::Shelving
                | VmStatus::Unshelving
                | VmStatus::Deleting
        )
    }

    /// Stable states a record can rest in between operations.
    pub fn is_stable(&self) -> bool {
        !self.is_transient()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VmStatus::Deleted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Provisioning => "PROVISIONING",
            VmStatus::Active => "ACTIVE",
            VmStatus::Stopping => "STOPPING",
            VmStatus::Stopped => "STOPPED",
            VmStatus::Shelving => "SHELVING",
            VmStatus::Shelved => "SHELVED",
            VmStatus::Unshelving => "UNSHELVING",
            VmStatus::Deleting => "DELETING",
            VmStatus::Deleted => "DELETED",
            VmStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROVISIONING" => Some(VmStatus::Provisioning),
            "ACTIVE" => Some(VmStatus::Active),
            "STOPPING" => Some(VmStatus::Stopping),
            "STOPPED" => Some(VmStatus::Stopped),
            "SHELVING" => Some(VmStatus::Shelving),
            "SHELVED" => Some(VmStatus::Shelved),
            "UNSHELVING" => Some(VmStatus::Unshelving),
            "DELETING" => Some(VmStatus::Deleting),
            "DELETED" => Some(VmStatus::Deleted),
            "ERROR" => Some(VmStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle operation requested against an existing record.
/// Creation is separate because no record exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleAction {
    Start,
    Stop,
    Shelve,
    Unshelve,
    Reset,
    Delete,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Shelve => "shelve",
            LifecycleAction::Unshelve => "unshelve",
            LifecycleAction::Reset => "reset",
            LifecycleAction::Delete => "delete",
        }
    }
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute shape of a sandbox. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Provider flavor (instance size) reference.
    pub flavor: String,
    /// Provider image reference the sandbox is built from.
    pub image: String,
}

/// The central entity: one record per sandbox VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: VmId,
    pub owner: OwnerRef,
    /// Set once when provisioning succeeds; absent before.
    pub instance_id: Option<InstanceId>,
    pub status: VmStatus,
    pub spec: ResourceSpec,
    pub created_at: DateTime<Utc>,
    /// Only ever moves forward in time.
    pub last_activity: DateTime<Utc>,
    pub last_state_change: DateTime<Utc>,
    /// Exclusivity marker: at most one in-flight operation per record.
    pub pending_op: Option<OpId>,
    /// Stable state held before the in-flight operation began. Rollback
    /// target when the provider reports the operation failed or never ran.
    pub prior_status: Option<VmStatus>,
}

impl VmRecord {
    /// New record entering the lifecycle. Starts in Provisioning with no
    /// instance attached yet.
    pub fn new(owner: OwnerRef, spec: ResourceSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: VmId::new(),
            owner,
            instance_id: None,
            status: VmStatus::Provisioning,
            spec,
            created_at: now,
            last_activity: now,
            last_state_change: now,
            pending_op: None,
            prior_status: None,
        }
    }
}

/// Who drove a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    User,
    Policy,
    Reconciler,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::User => "USER",
            Actor::Policy => "POLICY",
            Actor::Reconciler => "RECONCILER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "USER" => Some(Actor::User),
            "POLICY" => Some(Actor::Policy),
            "RECONCILER" => Some(Actor::Reconciler),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOutcome {
    Started,
    Succeeded,
    Failed,
    Warned,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Started => "STARTED",
            EventOutcome::Succeeded => "SUCCEEDED",
            EventOutcome::Failed => "FAILED",
            EventOutcome::Warned => "WARNED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STARTED" => Some(EventOutcome::Started),
            "SUCCEEDED" => Some(EventOutcome::Succeeded),
            "FAILED" => Some(EventOutcome::Failed),
            "WARNED" => Some(EventOutcome::Warned),
            _ => None,
        }
    }
}

/// Append-only audit entry. Never mutated or deleted; also consulted by the
/// idle policy (retention warning deduplication).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub vm_id: VmId,
    pub action: String,
    pub outcome: EventOutcome,
    pub actor: Actor,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_stable_partition_states() {
        let all = [
            VmStatus::Provisioning,
            VmStatus::Active,
            VmStatus::Stopping,
            VmStatus::Stopped,
            VmStatus::Shelving,
            VmStatus::Shelved,
            VmStatus::Unshelving,
            VmStatus::Deleting,
            VmStatus::Deleted,
            VmStatus::Error,
        ];
        for status in all {
            assert_ne!(status.is_transient(), status.is_stable());
        }
        assert!(VmStatus::Shelving.is_transient());
        assert!(VmStatus::Shelved.is_stable());
        assert!(VmStatus::Deleted.is_terminal());
        assert!(!VmStatus::Error.is_terminal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [VmStatus::Provisioning, VmStatus::Shelved, VmStatus::Error] {
            assert_eq!(VmStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(VmStatus::parse("SUSPENDED"), None);
    }

    #[test]
    fn new_record_starts_provisioning_without_instance() {
        let now = Utc::now();
        let record = VmRecord::new(
            OwnerRef::new("project-7"),
            ResourceSpec {
                flavor: "m1.large".into(),
                image: "sandbox-base".into(),
            },
            now,
        );
        assert_eq!(record.status, VmStatus::Provisioning);
        assert!(record.instance_id.is_none());
        assert!(record.pending_op.is_none());
        assert_eq!(record.created_at, now);
    }
}
