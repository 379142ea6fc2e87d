//! Error taxonomy for the backend.
//!
//! Transient I/O failures stay inside their worker (persisted as
//! `last_error` and retried with capped backoff); terminal protocol
//! violations are written to the owning entity as a failure sub-status.
//! User errors are returned to the caller with no state change.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TypeError {
    #[error("invalid address: {0}")]
    BadAddress(String),
    #[error("invalid decimal amount: {0}")]
    BadAmount(String),
    #[error("amount overflow")]
    AmountOverflow,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    Missing(String),
    #[error("invalid env var {0}: {1}")]
    Invalid(String, String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} already exists: {id}")]
    Duplicate { entity: &'static str, id: String },
    /// A guarded update observed a pre-image that no longer permits the
    /// write. The caller treats this as "the other writer won".
    #[error("stale update on {entity} {id}: {reason}")]
    Stale {
        entity: &'static str,
        id: String,
        reason: String,
    },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn duplicate(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::Duplicate {
            entity,
            id: id.into(),
        }
    }

    pub fn stale(entity: &'static str, id: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::Stale {
            entity,
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::Stale { .. })
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("rpc call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("no rpc client registered for chain {0}")]
    UnknownChain(u32),
    #[error("malformed rpc response: {0}")]
    BadResponse(String),
}

impl RpcError {
    /// True when the failure is a contract-level rejection rather than an
    /// I/O problem. Used to map withdraw submissions to the terminal
    /// `verify_failed` instead of the retryable `submit_failed`.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            RpcError::Rpc { message, .. } => is_verify_failure_message(message),
            _ => false,
        }
    }
}

/// Contract rejections that make a withdraw permanently invalid.
pub fn is_verify_failure_message(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("execution reverted")
        || lower.contains("invalid proof")
        || lower.contains("nullifier already used")
}

#[derive(Debug, Error)]
pub enum ProverError {
    #[error("prover http: {0}")]
    Http(String),
    #[error("prover returned status {0}: {1}")]
    Status(u16, String),
    #[error("prover returned empty proof")]
    EmptyProof,
    #[error("prover returned empty public values")]
    EmptyPublicValues,
    #[error("malformed public values: {0}")]
    BadPublicValues(String),
}

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("scanner http: {0}")]
    Http(String),
    #[error("scanner returned status {0}: {1}")]
    Status(u16, String),
    #[error("root {0} unknown to scanner")]
    UnknownRoot(String),
}

#[derive(Debug, Error)]
pub enum QueueRootError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scanner(#[from] ScannerError),
    #[error("backfill exceeded {0} hops from root {1}")]
    BackfillCapExceeded(usize, String),
}

/// User-facing request errors. None of these mutate state.
#[derive(Debug, Error)]
pub enum WithdrawError {
    #[error("withdraw request not found: {0}")]
    NotFound(String),
    #[error("allocation {0} not found")]
    AllocationNotFound(String),
    #[error("allocation {0} is not idle")]
    AllocationNotIdle(String),
    #[error("allocations span multiple owners")]
    MixedOwners,
    #[error("allocation {0} has no nullifier yet")]
    MissingNullifier(String),
    #[error("empty allocation set")]
    EmptyAllocationSet,
    #[error("a live withdraw request already uses nullifier {0}")]
    NullifierInUse(String),
    #[error("cannot cancel: withdrawal already executed on chain")]
    CancelAfterExecute,
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("retry limit reached for {0}")]
    RetryLimit(&'static str),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
