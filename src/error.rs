//! Error taxonomy for the swap engine.
//!
//! Four families matter to callers: verification failures (counterpart-supplied
//! lock parameters don't match expectation), transient ledger errors classified
//! by message pattern, persistence failures, and fatal construction errors.

use thiserror::Error;

/// Top-level error surfaced by engine and flow operations.
#[derive(Debug, Error)]
pub enum SwapError {
    /// An on-chain precondition failed: counterpart-supplied lock parameters
    /// don't match expectation, or funds are not where the operation expects
    /// them. No funds are moved.
    #[error("verification failed: {0}")]
    Verification(String),

    /// A ledger call failed; see [`LedgerErrorKind`] for the classification.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Flow state could not be persisted or loaded.
    #[error("state persistence failed: {0}")]
    Persistence(#[from] StoreError),

    /// The peer message channel failed.
    #[error("message channel failed: {0}")]
    Channel(#[from] ChannelError),

    /// Missing adapters or malformed session detected at construction time.
    #[error("invalid swap construction: {0}")]
    Construction(String),

    /// The swap was canceled by the counterpart or stopped externally while
    /// progression was in flight.
    #[error("swap was stopped")]
    Stopped,
}

/// A failed ledger call, classified for retry decisions.
#[derive(Debug, Clone, Error)]
#[error("ledger error ({kind:?}): {message}")]
pub struct LedgerError {
    pub kind: LedgerErrorKind,
    pub message: String,
}

/// Classification of ledger failures by message pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerErrorKind {
    /// The transaction was already broadcast; a resubmission counts as success.
    AlreadyKnown,
    /// Execution reverted, likely a wrong secret; do not retry blindly.
    Reverted,
    /// The sender cannot cover the network fee; manual or counterpart-assisted
    /// withdrawal is needed.
    InsufficientFee,
    /// Anything else; falls through to the generic retry loop.
    Unknown,
}

impl LedgerError {
    /// Classifies a raw ledger error message.
    ///
    /// The patterns mirror what node software actually returns: "known
    /// transaction"/"already known" for duplicate broadcasts, "out of gas" and
    /// "execution reverted" for failed contract calls, "insufficient funds"
    /// for fee shortfalls.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let kind = if lower.contains("known transaction") || lower.contains("already known") {
            LedgerErrorKind::AlreadyKnown
        } else if lower.contains("out of gas") || lower.contains("execution reverted") {
            LedgerErrorKind::Reverted
        } else if lower.contains("insufficient funds") {
            LedgerErrorKind::InsufficientFee
        } else {
            LedgerErrorKind::Unknown
        };
        Self { kind, message }
    }

    pub fn new(kind: LedgerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Persistence layer failure.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

/// Message channel failure (peer unreachable, channel closed).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ChannelError(pub String);
