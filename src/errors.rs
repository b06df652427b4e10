//! Typed errors for the lifecycle layer.
//!
//! User-visible failures are `Validation`, `Conflict`, `InvalidState` and a
//! `Provider` error that survived its retries. Transient provider
//! unavailability is absorbed by the reconciliation sweep and never surfaced
//! to the original caller.

use crate::types::{VmId, VmStatus};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request. Not retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Another operation holds the record's exclusivity marker. Callers are
    /// expected to back off and retry; nothing is queued.
    #[error("conflicting operation in progress for vm {vm_id}")]
    Conflict { vm_id: VmId },

    /// The requested operation is illegal from the record's current state.
    #[error("vm {vm_id}: {requested} not allowed from state {current}")]
    InvalidState {
        vm_id: VmId,
        current: VmStatus,
        requested: String,
    },

    #[error("vm {0} not found")]
    NotFound(VmId),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("remote-access broker failure: {0}")]
    Broker(#[from] crate::gateway::BrokerError),

    #[error("state store failure: {0}")]
    Store(#[from] StoreError),
}

/// Failures surfaced by the provider adapter. `NotFound` and `Unavailable`
/// are kept distinct because the rollback policy differs: a vanished
/// instance forces ERROR, unreachability leaves state untouched and retries.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("instance {0} not found at provider")]
    NotFound(String),

    #[error("provider rejected operation: {0}")]
    Rejected(String),

    #[error("provider unreachable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database failure: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt record {vm_id}: {reason}")]
    Corrupt { vm_id: String, reason: String },
}
