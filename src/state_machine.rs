//! Lifecycle state machine. Pure business rules, no side effects.
//!
//! ```text
//!   create ──> PROVISIONING ──> ACTIVE
//!                                │  ▲
//!                    stop        ▼  │ start/reset (via PROVISIONING)
//!              ACTIVE ──> STOPPING ──> STOPPED
//!       ACTIVE|STOPPED ──> SHELVING ──> SHELVED
//!              SHELVED ──> UNSHELVING ──> ACTIVE
//!                  any ──> DELETING ──> DELETED   (except DELETING/DELETED)
//! ```
//!
//! ERROR is reachable from any failed operation and permits only `reset`
//! and `delete` outbound. DELETED is terminal; deleting again is a no-op.

use crate::types::{LifecycleAction, VmStatus};

/// What happens to the record when the provider rejects or fails the
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Return to the stable state held before the attempt. The instance is
    /// known untouched (e.g. a refused stop leaves it running).
    RollBack,
    /// Instance state is unknown after the failure; park the record in
    /// ERROR until an operator resets or deletes it.
    Fault,
}

/// A validated transition: the transient state written before the provider
/// call, the terminal state committed after confirmation, and the failure
/// disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    pub transient: VmStatus,
    pub on_success: VmStatus,
    pub on_failure: FailureDisposition,
}

/// Outcome of validating a request against the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Proceed(TransitionPlan),
    /// The requested end state already holds. Succeed without touching the
    /// provider (deleting a DELETED record).
    Noop,
}

/// The requested action is not an edge of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub action: LifecycleAction,
    pub from: VmStatus,
}

impl std::fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot {} from state {}", self.action, self.from)
    }
}

impl std::error::Error for IllegalTransition {}

/// Validate `action` against `current` and produce the transition plan.
///
/// `start` and `reset` share PROVISIONING as their transient state: a reset
/// rebuilds the instance from its image, which is a re-provision as far as
/// observers are concerned.
pub fn plan(action: LifecycleAction, current: VmStatus) -> Result<Disposition, IllegalTransition> {
    use FailureDisposition::{Fault, RollBack};
    use LifecycleAction::*;
    use VmStatus::*;

    let plan = match (action, current) {
        // Idempotent delete: already gone means done.
        (Delete, Deleted) => return Ok(Disposition::Noop),
        (Delete, Deleting) => return Err(IllegalTransition { action, from: current }),
        (Delete, _) => TransitionPlan {
            transient: Deleting,
            on_success: Deleted,
            on_failure: Fault,
        },

        (Stop, Active) => TransitionPlan {
            transient: Stopping,
            on_success: Stopped,
            on_failure: RollBack,
        },

        (Start, Active | Stopped) | (Reset, Active | Stopped | Error) => TransitionPlan {
            transient: Provisioning,
            on_success: Active,
            on_failure: Fault,
        },

        (Shelve, Active | Stopped) => TransitionPlan {
            transient: Shelving,
            on_success: Shelved,
            on_failure: RollBack,
        },

        (Unshelve, Shelved) => TransitionPlan {
            transient: Unshelving,
            on_success: Active,
            on_failure: RollBack,
        },

        _ => return Err(IllegalTransition { action, from: current }),
    };

    Ok(Disposition::Proceed(plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleAction::*;
    use VmStatus::*;

    fn proceed(action: LifecycleAction, from: VmStatus) -> TransitionPlan {
        match plan(action, from) {
            Ok(Disposition::Proceed(p)) => p,
            other => panic!("expected Proceed for {action} from {from}, got {other:?}"),
        }
    }

    #[test]
    fn happy_path_edges_match_the_table() {
        let stop = proceed(Stop, Active);
        assert_eq!(stop.transient, Stopping);
        assert_eq!(stop.on_success, Stopped);
        assert_eq!(stop.on_failure, FailureDisposition::RollBack);

        let shelve = proceed(Shelve, Stopped);
        assert_eq!(shelve.transient, Shelving);
        assert_eq!(shelve.on_success, Shelved);

        let unshelve = proceed(Unshelve, Shelved);
        assert_eq!(unshelve.transient, Unshelving);
        assert_eq!(unshelve.on_success, Active);
        assert_eq!(unshelve.on_failure, FailureDisposition::RollBack);
    }

    #[test]
    fn start_and_reset_re_provision() {
        for (action, from) in [(Start, Stopped), (Start, Active), (Reset, Active)] {
            let p = proceed(action, from);
            assert_eq!(p.transient, Provisioning);
            assert_eq!(p.on_success, Active);
            assert_eq!(p.on_failure, FailureDisposition::Fault);
        }
    }

    #[test]
    fn error_state_only_permits_reset_and_delete() {
        assert!(plan(Reset, Error).is_ok());
        assert!(plan(Delete, Error).is_ok());
        for action in [Start, Stop, Shelve, Unshelve] {
            assert!(plan(action, Error).is_err(), "{action} must be illegal from ERROR");
        }
    }

    #[test]
    fn delete_is_idempotent_and_never_doubles() {
        assert_eq!(plan(Delete, Deleted), Ok(Disposition::Noop));
        assert!(plan(Delete, Deleting).is_err());
        // Deletable from everything else, including transients and ERROR.
        for from in [Provisioning, Active, Stopping, Stopped, Shelving, Shelved, Unshelving, Error] {
            let p = proceed(Delete, from);
            assert_eq!(p.transient, Deleting);
            assert_eq!(p.on_success, Deleted);
            assert_eq!(p.on_failure, FailureDisposition::Fault);
        }
    }

    #[test]
    fn illegal_edges_are_rejected() {
        for (action, from) in [
            (Shelve, Shelved),
            (Shelve, Provisioning),
            (Unshelve, Active),
            (Unshelve, Stopped),
            (Stop, Stopped),
            (Stop, Shelved),
            (Start, Shelved),
            (Start, Deleted),
            (Reset, Deleted),
            (Shelve, Deleted),
        ] {
            let err = plan(action, from).unwrap_err();
            assert_eq!(err.action, action);
            assert_eq!(err.from, from);
        }
    }
}
