//! Cloud provider boundary.
//!
//! The single abstraction the controller issues cloud operations through.
//! Everything here is asynchronous at the provider side: an accepted
//! operation says nothing about completion, which is only learned by
//! polling. Instance disappearance (`NotFound`) is kept separate from
//! transient unreachability because the rollback policy differs.

use async_trait::async_trait;

use crate::errors::ProviderError;
use crate::types::{InstanceId, ResourceSpec};

pub mod openstack;

pub use openstack::OpenStackProvider;

/// Operation submitted against an existing instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOp {
    Start,
    Stop,
    Shelve,
    Unshelve,
    /// Rebuild the instance from an image, wiping its disk back to pristine.
    Rebuild { image: String },
    Delete,
}

impl ProviderOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderOp::Start => "start",
            ProviderOp::Stop => "stop",
            ProviderOp::Shelve => "shelve",
            ProviderOp::Unshelve => "unshelve",
            ProviderOp::Rebuild { .. } => "rebuild",
            ProviderOp::Delete => "delete",
        }
    }
}

/// Live status reported by the provider. Deletion has no status of its own:
/// a fully deleted instance polls as `NotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Still building, rebuilding or otherwise settling.
    Building,
    Active,
    Stopped,
    Shelved,
    Error,
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Create a new instance for `spec`. Returns its provider identifier;
    /// the instance is typically still building when this returns.
    async fn provision(&self, spec: &ResourceSpec) -> Result<InstanceId, ProviderError>;

    /// Submit an operation. `Ok` means accepted, not complete.
    async fn submit(&self, instance: &InstanceId, op: ProviderOp) -> Result<(), ProviderError>;

    /// Authoritative live status.
    async fn poll_status(&self, instance: &InstanceId) -> Result<InstanceStatus, ProviderError>;
}
