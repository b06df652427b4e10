//! Notification dispatch for lifecycle observers.
//!
//! Every committed transition produces a notice; the idle policy adds
//! retention warnings before scheduled deletions. Delivery (mail queue,
//! webhooks) lives behind `NotificationSink`; sinks swallow their own
//! failures so notification problems never fail a lifecycle operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::types::{OwnerRef, VmId, VmStatus};

/// Emitted on every committed state change, transient entries included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionNotice {
    pub vm_id: VmId,
    pub from: VmStatus,
    pub to: VmStatus,
    pub at: DateTime<Utc>,
}

/// Advance warning that a shelved sandbox approaches its retention
/// deletion deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionWarning {
    pub vm_id: VmId,
    pub owner: OwnerRef,
    pub shelved_since: DateTime<Utc>,
    pub delete_after: DateTime<Utc>,
}

impl RetentionWarning {
    /// User-facing message body, matching the wording sandbox owners see.
    pub fn message(&self) -> String {
        format!(
            "Your sandbox VM {} has been suspended since {} and will be \
             deleted after {} if no action is taken.",
            self.vm_id,
            self.shelved_since.format("%Y-%m-%d %H:%M:%S"),
            self.delete_after.format("%Y-%m-%d %H:%M:%S"),
        )
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn transition(&self, notice: &TransitionNotice);
    async fn retention_warning(&self, warning: &RetentionWarning);
}

/// Fans a notice out to every registered sink.
#[derive(Default)]
pub struct Dispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl NotificationSink for Dispatcher {
    async fn transition(&self, notice: &TransitionNotice) {
        for sink in &self.sinks {
            sink.transition(notice).await;
        }
    }

    async fn retention_warning(&self, warning: &RetentionWarning) {
        for sink in &self.sinks {
            sink.retention_warning(warning).await;
        }
    }
}

/// Structured-log sink. Always present in production so transitions are
/// observable even with no external delivery configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn transition(&self, notice: &TransitionNotice) {
        tracing::info!(
            vm_id = %notice.vm_id,
            from = %notice.from,
            to = %notice.to,
            at = %notice.at,
            "lifecycle transition"
        );
    }

    async fn retention_warning(&self, warning: &RetentionWarning) {
        tracing::warn!(
            vm_id = %warning.vm_id,
            owner = %warning.owner,
            delete_after = %warning.delete_after,
            "retention warning issued"
        );
    }
}
