// Error taxonomy for the core. Retryable vs fatal is a property of the
// kind, not the call site.

use thiserror::Error;

use crate::pulse::PulseNumber;
use crate::reference::NodeRef;

#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum CoreError {
    /// Local miss for code/index/record. Recovered by falling back to
    /// heavy; only surfaced if heavy also misses.
    #[error("not found: {0}")]
    NotFound(String),

    /// State-transition violation on an object lifeline.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidState { from: String, to: String },

    /// Chain-continuity violation: a new record's prev-state pointer
    /// does not match the committed latest state.
    #[error("invalid chain: expected prev {expected}, got {got}")]
    InvalidChain { expected: String, got: String },

    /// Operation on a terminated lifeline.
    #[error("object is deactivated")]
    Deactivated,

    /// Admission control on pending requests.
    #[error("too many pending requests")]
    TooManyPendingRequests,

    /// Peer verification failure during consensus: unknown node ref.
    #[error("unknown node: {0}")]
    UnknownNode(NodeRef),

    /// Peer verification failure during consensus: bad signature.
    #[error("bad signature: {0}")]
    BadSignature(String),

    /// Phase 2.1 could not gather required supplementary votes.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Context cancellation; propagated without side effects.
    #[error("canceled")]
    Canceled,

    /// Sink-push to a pulse outside {antique, present, future}.
    #[error("unknown pulse: {0}")]
    UnknownPulse(PulseNumber),

    /// Any operation after shutdown was initiated.
    #[error("shutting down")]
    ShuttingDown,

    /// Typed reply wrapper for bus-level failures.
    #[error("bus error: {0}")]
    Bus(String),
}

impl CoreError {
    /// Whether a caller-supplied backoff-and-retry is appropriate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::NotFound(_) | CoreError::UnknownPulse(_) | CoreError::Bus(_)
        )
    }
}
