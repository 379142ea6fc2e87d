//! Persistent entity records and their status machines.
//!
//! Checkbook statuses form a monotone lattice: a write may only raise the
//! level, never lower it. Failure states sit off the lattice and are
//! written unconditionally by the component that owns the failure.
//! WithdrawRequest carries four sub-statuses; its main status is a pure
//! function of them (`derive_main_status`).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::types::{Amount, Intent, MultichainSignature, UniversalAddress};

pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Checkbook
// ---------------------------------------------------------------------------

/// One checkbook per on-chain deposit, keyed by the depositing chain and
/// its local deposit counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckbookId {
    pub chain_id: u32,
    pub deposit_id: u64,
}

impl CheckbookId {
    pub fn new(chain_id: u32, deposit_id: u64) -> Self {
        Self {
            chain_id,
            deposit_id,
        }
    }
}

impl fmt::Display for CheckbookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.deposit_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckbookStatus {
    Pending,
    Unsigned,
    ReadyForCommitment,
    GeneratingProof,
    SubmittingCommitment,
    CommitmentPending,
    WithCheckbook,
    // Off-axis terminal failures; not comparable on the lattice.
    ProofFailed,
    SubmissionFailed,
}

impl CheckbookStatus {
    /// Lattice level, or `None` for off-axis failure states.
    pub fn level(&self) -> Option<u8> {
        match self {
            CheckbookStatus::Pending => Some(1),
            CheckbookStatus::Unsigned => Some(2),
            CheckbookStatus::ReadyForCommitment => Some(3),
            CheckbookStatus::GeneratingProof => Some(4),
            CheckbookStatus::SubmittingCommitment => Some(5),
            CheckbookStatus::CommitmentPending => Some(6),
            CheckbookStatus::WithCheckbook => Some(7),
            CheckbookStatus::ProofFailed | CheckbookStatus::SubmissionFailed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckbookStatus::WithCheckbook
                | CheckbookStatus::ProofFailed
                | CheckbookStatus::SubmissionFailed
        )
    }
}

/// Monotone advancement predicate: permits the write only when both
/// statuses sit on the lattice and the new level is strictly higher.
/// Off-axis failure writes do not go through this predicate.
pub fn advance_checkbook_status(current: CheckbookStatus, new: CheckbookStatus) -> bool {
    match (current.level(), new.level()) {
        (Some(cur), Some(next)) => next > cur,
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkbook {
    pub id: CheckbookId,
    pub owner: UniversalAddress,
    /// Human token symbol once resolved from the indexed-string hash;
    /// until then the raw hash string.
    pub token_key: String,
    pub gross_amount: Amount,
    pub allocatable_amount: Amount,
    pub fee_total_locked: Amount,
    pub commitment: Option<B256>,
    pub proof: Option<Vec<u8>>,
    pub public_values: Option<Vec<u8>>,
    pub status: CheckbookStatus,
    pub deposit_tx_hash: Option<B256>,
    pub deposit_used: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Checkbook {
    pub fn new(id: CheckbookId, owner: UniversalAddress, gross_amount: Amount) -> Self {
        let now = now_epoch();
        Self {
            id,
            owner,
            token_key: String::new(),
            gross_amount,
            allocatable_amount: Amount::ZERO,
            fee_total_locked: Amount::ZERO,
            commitment: None,
            proof: None,
            public_values: None,
            status: CheckbookStatus::Pending,
            deposit_tx_hash: None,
            deposit_used: false,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Atomic spend unit inside a checkbook, identified by `(checkbook, seq)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationId {
    pub checkbook: CheckbookId,
    pub seq: u8,
}

impl AllocationId {
    pub fn new(checkbook: CheckbookId, seq: u8) -> Self {
        Self { checkbook, seq }
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.checkbook.chain_id, self.checkbook.deposit_id, self.seq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Idle,
    Pending,
    Used,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    /// Immutable after creation.
    pub amount: Amount,
    /// Assigned once, when the parent checkbook's commitment becomes known.
    pub nullifier: Option<B256>,
    pub status: AllocationStatus,
    /// The non-final withdraw request currently holding this allocation.
    pub withdraw_request_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Allocation {
    pub fn new(id: AllocationId, amount: Amount) -> Self {
        let now = now_epoch();
        Self {
            id,
            amount,
            nullifier: None,
            status: AllocationStatus::Idle,
            withdraw_request_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// WithdrawRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteStatus {
    Pending,
    Submitted,
    Success,
    /// Proof or nullifier rejected by the contract. Terminal.
    VerifyFailed,
    /// RPC or network failure. Retryable.
    SubmitFailed,
}

impl ExecuteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecuteStatus::Success | ExecuteStatus::VerifyFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    NotRequired,
    Pending,
    Processing,
    Completed,
    Failed,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MainStatus {
    Created,
    Proving,
    Executing,
    Settling,
    Completed,
    CompletedWithFallback,
    CompletedWithHookFailed,
    FailedRetryable,
    FailedPermanent,
    Cancelled,
    ManuallyResolved,
}

impl MainStatus {
    /// Statuses set by their owning operation and never overwritten by the
    /// derived recompute.
    pub fn is_pinned(&self) -> bool {
        matches!(self, MainStatus::Cancelled | MainStatus::ManuallyResolved)
    }
}

/// The main-status contract: rows are evaluated top to bottom, first match
/// wins. Returns `None` when no row applies (the current value stands).
pub fn derive_main_status(
    proof: ProofStatus,
    execute: ExecuteStatus,
    payout: PayoutStatus,
    hook: HookStatus,
    fallback_transferred: bool,
) -> Option<MainStatus> {
    use ExecuteStatus as E;
    use HookStatus as H;
    use PayoutStatus as Pa;
    use ProofStatus as P;

    if proof == P::Failed {
        return Some(MainStatus::FailedPermanent);
    }
    if execute == E::VerifyFailed {
        return Some(MainStatus::FailedPermanent);
    }
    if execute == E::SubmitFailed {
        return Some(MainStatus::FailedRetryable);
    }
    if proof == P::InProgress && execute == E::Pending && payout == Pa::Pending {
        return Some(MainStatus::Proving);
    }
    if proof == P::Completed && execute == E::Submitted && payout == Pa::Pending {
        return Some(MainStatus::Executing);
    }
    if proof == P::Completed && execute == E::Success && payout == Pa::Processing {
        return Some(MainStatus::Settling);
    }
    if proof == P::Completed && execute == E::Success && payout == Pa::Failed {
        return Some(if fallback_transferred {
            MainStatus::CompletedWithFallback
        } else {
            MainStatus::FailedRetryable
        });
    }
    if proof == P::Completed && execute == E::Success && payout == Pa::Completed {
        return match hook {
            H::NotRequired | H::Completed => Some(MainStatus::Completed),
            H::Failed => Some(MainStatus::CompletedWithHookFailed),
            _ => None,
        };
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub id: String,
    pub owner: UniversalAddress,
    pub allocation_ids: Vec<AllocationId>,
    pub intent: Intent,
    pub recipient: UniversalAddress,
    /// Always the sum of the allocation amounts.
    pub amount: Amount,
    /// Provisionally the first allocation's nullifier; rewritten to the
    /// prover's `nullifiers[0]` when they differ, because chain events key
    /// on the public-values value.
    pub withdraw_nullifier: B256,
    /// Deprecated external correlation id; kept for the legacy lookup path.
    pub request_id: Option<String>,
    /// User authorisation handed to the prover verbatim.
    pub signature: Option<MultichainSignature>,
    pub min_output: Option<B256>,
    pub proof_status: ProofStatus,
    pub execute_status: ExecuteStatus,
    pub payout_status: PayoutStatus,
    pub hook_status: HookStatus,
    pub fallback_transferred: bool,
    pub fallback_error: Option<String>,
    pub status: MainStatus,
    pub proof: Option<Vec<u8>>,
    pub public_values: Option<Vec<u8>>,
    pub execute_chain_id: Option<u32>,
    pub execute_tx_hash: Option<B256>,
    pub execute_block_number: Option<u64>,
    pub payout_retries: u32,
    pub hook_retries: u32,
    pub fallback_retries: u32,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl WithdrawRequest {
    pub fn new(
        id: String,
        owner: UniversalAddress,
        allocation_ids: Vec<AllocationId>,
        intent: Intent,
        recipient: UniversalAddress,
        amount: Amount,
        withdraw_nullifier: B256,
    ) -> Self {
        let now = now_epoch();
        let hook_status = if intent.requires_hook() {
            HookStatus::Pending
        } else {
            HookStatus::NotRequired
        };
        Self {
            id,
            owner,
            allocation_ids,
            intent,
            recipient,
            amount,
            withdraw_nullifier,
            request_id: None,
            signature: None,
            min_output: None,
            proof_status: ProofStatus::Pending,
            execute_status: ExecuteStatus::Pending,
            payout_status: PayoutStatus::Pending,
            hook_status,
            fallback_transferred: false,
            fallback_error: None,
            status: MainStatus::Created,
            proof: None,
            public_values: None,
            execute_chain_id: None,
            execute_tx_hash: None,
            execute_block_number: None,
            payout_retries: 0,
            hook_retries: 0,
            fallback_retries: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A request is final when its allocations can no longer be spent by it.
    pub fn is_final(&self) -> bool {
        self.status.is_pinned()
            || matches!(
                self.status,
                MainStatus::Completed
                    | MainStatus::CompletedWithFallback
                    | MainStatus::CompletedWithHookFailed
                    | MainStatus::FailedPermanent
            )
    }
}

// ---------------------------------------------------------------------------
// Queue root
// ---------------------------------------------------------------------------

/// Node of the commitment-root linked list: `previous_root → root`,
/// directed toward the most recent root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRoot {
    pub root: B256,
    pub previous_root: B256,
    pub created_by_commitment: B256,
    /// Exactly one node per chain carries `true`: the node with no successor.
    pub is_recent_root: bool,
    pub chain_id: u32,
    pub block_number: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

// ---------------------------------------------------------------------------
// Pending transaction (tx queue item)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingTxStatus {
    Pending,
    Processing,
    Submitted,
    Confirmed,
    Failed,
}

/// What the queued transaction submits. Tagged so stored payloads
/// deserialise strictly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TxPayload {
    Commitment {
        checkbook_id: CheckbookId,
        token_key: String,
        allocatable_amount: Amount,
        commitment: B256,
        proof: Vec<u8>,
        public_values: Vec<u8>,
    },
    Withdraw {
        withdraw_request_id: String,
        token_key: String,
        recipient: B256,
        amount: Amount,
        queue_root: B256,
        proof: Vec<u8>,
        public_values: Vec<u8>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub id: String,
    pub signer: Address,
    pub chain_id: u32,
    pub payload: TxPayload,
    pub status: PendingTxStatus,
    pub tx_hash: Option<B256>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<u64>,
    pub last_error: Option<String>,
    pub submitted_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PendingTransaction {
    pub fn new(id: String, signer: Address, chain_id: u32, payload: TxPayload) -> Self {
        let now = now_epoch();
        Self {
            id,
            signer,
            chain_id,
            payload,
            status: PendingTxStatus::Pending,
            tx_hash: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            last_error: None,
            submitted_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Proof task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProofTaskPayload {
    Checkbook { checkbook_id: CheckbookId },
    Withdraw { withdraw_request_id: String },
}

/// Result persisted when the prover succeeds: the proof plus the encoded
/// public values, stored verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofArtifact {
    pub proof: Vec<u8>,
    pub public_values: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofTask {
    pub id: String,
    pub payload: ProofTaskPayload,
    pub status: TaskStatus,
    pub priority: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<u64>,
    pub last_error: Option<String>,
    pub result: Option<ProofArtifact>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ProofTask {
    pub fn new(id: String, payload: ProofTaskPayload) -> Self {
        let now = now_epoch();
        Self {
            id,
            payload,
            status: TaskStatus::Pending,
            priority: 10,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Polling task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollTaskType {
    DepositBusinessChain,
    DepositManagementChain,
    CommitmentSubmission,
    CommitmentConfirmation,
    WithdrawSubmission,
    WithdrawManagement,
    WithdrawCrossChain,
    WithdrawExecute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// The entity a polling task resolves, with its id in string form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum PollEntity {
    Checkbook { id: CheckbookId },
    WithdrawRequest { id: String },
    PendingTransaction { id: String },
}

impl PollEntity {
    pub fn describe(&self) -> String {
        match self {
            PollEntity::Checkbook { id } => format!("checkbook/{id}"),
            PollEntity::WithdrawRequest { id } => format!("withdraw_request/{id}"),
            PollEntity::PendingTransaction { id } => format!("pending_tx/{id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingTask {
    pub id: String,
    pub entity: PollEntity,
    pub task_type: PollTaskType,
    pub tx_hash: B256,
    pub chain_id: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub poll_interval_secs: u64,
    pub next_poll_at: u64,
    pub started_at: Option<u64>,
    pub status: PollStatus,
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PollingTask {
    pub fn new(
        id: String,
        entity: PollEntity,
        task_type: PollTaskType,
        tx_hash: B256,
        chain_id: u32,
    ) -> Self {
        let now = now_epoch();
        Self {
            id,
            entity,
            task_type,
            tx_hash,
            chain_id,
            retry_count: 0,
            max_retries: 180,
            poll_interval_secs: 10,
            next_poll_at: now,
            started_at: None,
            status: PollStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Failed transaction audit record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedTxStatus {
    Pending,
    Retrying,
    Recovered,
    Abandoned,
}

/// Audit trail for submissions that could not make it onto the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTransaction {
    pub id: String,
    pub pending_tx_id: String,
    pub signer: Address,
    pub chain_id: u32,
    pub reason: String,
    pub status: FailedTxStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl FailedTransaction {
    pub fn new(id: String, pending_tx_id: String, signer: Address, chain_id: u32, reason: String) -> Self {
        let now = now_epoch();
        Self {
            id,
            pending_tx_id,
            signer,
            chain_id,
            reason,
            status: FailedTxStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
