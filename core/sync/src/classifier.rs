//! Turns remote outcomes into local policy.
//!
//! Per-op rejections and whole-call failures are decided here and nowhere
//! else. The engine only executes the returned action.

use tracing::{debug, warn};

use tasksync_common::{Error, RejectedOp};
use tasksync_provider::error_codes;

/// What to do with one op the remote refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionAction {
    /// The remote already has it; the ack was lost.
    MarkSynced,
    /// Resending cannot succeed. Never uploaded again; the cycle reports
    /// an error.
    RejectPermanently,
    /// Leave pending and resend next cycle.
    Retry,
}

/// Decide the fate of one refused op from its error code.
///
/// # Postconditions
/// - Unknown or missing codes always map to `Retry`, so a server newer than
///   this client can never make it drop data
pub fn classify_rejection(rejected: &RejectedOp) -> RejectionAction {
    match rejected.error_code.as_deref() {
        Some(error_codes::DUPLICATE_OPERATION) => {
            debug!("Op {} already stored remotely", rejected.op_id);
            RejectionAction::MarkSynced
        }
        Some(error_codes::VALIDATION_ERROR) => RejectionAction::RejectPermanently,
        other => {
            warn!(
                "Op {} rejected with unrecognized code {:?}: {}; will retry",
                rejected.op_id, other, rejected.error
            );
            RejectionAction::Retry
        }
    }
}

/// What to do when a whole remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Batch over the server's size ceiling: split it, alert the user, keep
    /// the ops pending.
    ShrinkBatch,
    /// Credentials refused: alert the user, end the cycle.
    Reauthenticate,
    /// End the cycle in `Error`; the next trigger retries.
    RetryNextCycle,
    /// The cycle was abandoned by shutdown.
    Abandon,
    /// Local failure (storage, configuration); returned to the caller.
    Fatal,
}

/// Decide how a failed remote call ends the cycle.
///
/// # Postconditions
/// - Transport, timeout and crypto failures leave the ops pending for a
///   later cycle
pub fn classify_failure(err: &Error) -> FailureAction {
    match err {
        Error::PayloadTooLarge(_) => FailureAction::ShrinkBatch,
        Error::Unauthorized(_) => FailureAction::Reauthenticate,
        Error::Cancelled => FailureAction::Abandon,
        Error::Network(_)
        | Error::Timeout(_)
        | Error::Io(_)
        | Error::NotFound(_)
        | Error::NotSupported(_)
        | Error::Crypto(_) => FailureAction::RetryNextCycle,
        _ => FailureAction::Fatal,
    }
}

/// Short status reason shown next to an `Error` status.
pub fn failure_reason(err: &Error) -> String {
    match err {
        Error::PayloadTooLarge(_) => "Upload too large for the server".to_string(),
        Error::Unauthorized(_) => "Sync credentials were rejected".to_string(),
        Error::Timeout(what) => format!("Sync timed out ({})", what),
        Error::Network(_) => "Sync server unreachable".to_string(),
        Error::Cancelled => "Sync cancelled".to_string(),
        other => other.to_string(),
    }
}
