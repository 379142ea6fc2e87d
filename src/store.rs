//! Repository traits and the in-memory store.
//!
//! Every mutating operation runs inside the map's shard-locked entry, so a
//! read-modify-write is atomic per row: guarded updates re-read the
//! pre-image under the lock and decide whether the write is still valid.
//! All mutation surfaces are field-scoped. There is deliberately no
//! save-the-whole-row call, so concurrent writers cannot clobber
//! lazily-populated columns (proof bytes, public values).
//!
//! A SQL-backed store can implement the same traits; components only
//! depend on the trait surface.

use std::future::Future;
use std::sync::Arc;

use alloy_primitives::{Address, B256};
use dashmap::DashMap;

use crate::entities::*;
use crate::error::StoreError;
use crate::types::Amount;
use crate::types::UniversalAddress;

// ---------------------------------------------------------------------------
// Field-scoped update payloads
// ---------------------------------------------------------------------------

/// Fields owned by the `DepositRecorded` handler.
#[derive(Debug, Clone)]
pub struct DepositRecordedUpdate {
    pub token_key: String,
    pub gross_amount: Amount,
    pub allocatable_amount: Amount,
    pub fee_total_locked: Amount,
    pub owner: UniversalAddress,
}

/// Execute-stage context captured from a chain event or submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteContext {
    pub chain_id: Option<u32>,
    pub tx_hash: Option<B256>,
    pub block_number: Option<u64>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait CheckbookStore: Send + Sync + 'static {
    fn create_checkbook(
        &self,
        checkbook: Checkbook,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_checkbook(
        &self,
        id: CheckbookId,
    ) -> impl Future<Output = Result<Option<Checkbook>, StoreError>> + Send;

    fn find_checkbook_by_commitment(
        &self,
        commitment: B256,
    ) -> impl Future<Output = Result<Option<Checkbook>, StoreError>> + Send;

    /// Monotone advancement; `Ok(false)` when the lattice predicate
    /// rejects the write (the higher status wins).
    fn advance_checkbook(
        &self,
        id: CheckbookId,
        new_status: CheckbookStatus,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Off-axis failure write; unconditional.
    fn fail_checkbook(
        &self,
        id: CheckbookId,
        status: CheckbookStatus,
        error: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn apply_deposit_recorded(
        &self,
        id: CheckbookId,
        update: DepositRecordedUpdate,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Persists the proof artifacts and commitment in one field-scoped write.
    fn set_checkbook_proof(
        &self,
        id: CheckbookId,
        commitment: B256,
        proof: Vec<u8>,
        public_values: Vec<u8>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn set_deposit_used(
        &self,
        id: CheckbookId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn set_deposit_tx_hash(
        &self,
        id: CheckbookId,
        tx_hash: B256,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn list_checkbooks(&self) -> impl Future<Output = Result<Vec<Checkbook>, StoreError>> + Send;
}

pub trait AllocationStore: Send + Sync + 'static {
    fn create_allocation(
        &self,
        allocation: Allocation,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_allocation(
        &self,
        id: AllocationId,
    ) -> impl Future<Output = Result<Option<Allocation>, StoreError>> + Send;

    /// All allocations of a checkbook, in seq order.
    fn list_checkbook_allocations(
        &self,
        checkbook: CheckbookId,
    ) -> impl Future<Output = Result<Vec<Allocation>, StoreError>> + Send;

    fn find_allocation_by_nullifier(
        &self,
        nullifier: B256,
    ) -> impl Future<Output = Result<Option<Allocation>, StoreError>> + Send;

    /// Assigns the nullifier once; later calls with the same value are
    /// no-ops, a different value is stale.
    fn set_allocation_nullifier(
        &self,
        id: AllocationId,
        nullifier: B256,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// `idle → pending`, binding the allocation to the request.
    fn lock_allocation(
        &self,
        id: AllocationId,
        request_id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// `pending → idle`, only while bound to the given request.
    fn release_allocation(
        &self,
        id: AllocationId,
        request_id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// `pending → used` on a successful on-chain execute.
    fn mark_allocation_used(
        &self,
        id: AllocationId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

pub trait WithdrawRequestStore: Send + Sync + 'static {
    fn create_withdraw_request(
        &self,
        request: WithdrawRequest,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_withdraw_request(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<WithdrawRequest>, StoreError>> + Send;

    fn delete_withdraw_request(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn find_withdraw_by_nullifier(
        &self,
        nullifier: B256,
    ) -> impl Future<Output = Result<Option<WithdrawRequest>, StoreError>> + Send;

    /// Legacy correlation-id lookup, kept until the last caller migrates.
    fn find_withdraw_by_request_id(
        &self,
        request_id: &str,
    ) -> impl Future<Output = Result<Option<WithdrawRequest>, StoreError>> + Send;

    fn set_proof_status(
        &self,
        id: &str,
        status: ProofStatus,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Field-scoped persist of proof artifacts; never touches statuses.
    fn set_withdraw_proof(
        &self,
        id: &str,
        proof: Vec<u8>,
        public_values: Vec<u8>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Rewrites the nullifier to the prover's `nullifiers[0]`, keeping the
    /// lookup index in step.
    fn rewrite_withdraw_nullifier(
        &self,
        id: &str,
        nullifier: B256,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Writes the execute status unless the current one is terminal.
    /// `Ok(false)` when the terminal status wins.
    fn set_execute_status(
        &self,
        id: &str,
        status: ExecuteStatus,
        ctx: ExecuteContext,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Poller variant: writes only when the current status is exactly
    /// `submitted` (the event processor wins otherwise).
    fn set_execute_status_if_submitted(
        &self,
        id: &str,
        status: ExecuteStatus,
        ctx: ExecuteContext,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn set_payout_status(
        &self,
        id: &str,
        status: PayoutStatus,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn set_hook_status(
        &self,
        id: &str,
        status: HookStatus,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn set_fallback_transferred(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn set_fallback_error(
        &self,
        id: &str,
        error: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn set_withdraw_last_error(
        &self,
        id: &str,
        error: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn bump_stage_retries(
        &self,
        id: &str,
        stage: RetryStage,
        cap: u32,
    ) -> impl Future<Output = Result<u32, StoreError>> + Send;

    /// Pins a terminal main status (cancelled / manually resolved).
    fn pin_main_status(
        &self,
        id: &str,
        status: MainStatus,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Recomputes the derived main status from the sub-statuses, writing
    /// only the main-status field. Pinned statuses stand.
    fn recompute_main_status(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<MainStatus, StoreError>> + Send;

    fn list_withdraw_requests(
        &self,
    ) -> impl Future<Output = Result<Vec<WithdrawRequest>, StoreError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStage {
    Payout,
    Hook,
    Fallback,
}

pub trait QueueRootStore: Send + Sync + 'static {
    /// Idempotent insert; `Ok(false)` refreshes the timestamp of an
    /// existing node instead of writing a duplicate.
    fn insert_queue_root(
        &self,
        node: QueueRoot,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn get_queue_root(
        &self,
        root: B256,
    ) -> impl Future<Output = Result<Option<QueueRoot>, StoreError>> + Send;

    /// Forward link: the node whose `previous_root` is the given root.
    fn get_queue_root_successor(
        &self,
        root: B256,
    ) -> impl Future<Output = Result<Option<QueueRoot>, StoreError>> + Send;

    fn find_queue_root_by_commitment(
        &self,
        commitment: B256,
    ) -> impl Future<Output = Result<Option<QueueRoot>, StoreError>> + Send;

    fn recent_queue_root(
        &self,
        chain_id: u32,
    ) -> impl Future<Output = Result<Option<QueueRoot>, StoreError>> + Send;

    fn set_recent_root(
        &self,
        chain_id: u32,
        root: B256,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

pub trait PendingTxStore: Send + Sync + 'static {
    fn create_pending_tx(
        &self,
        tx: PendingTransaction,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_pending_tx(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<PendingTransaction>, StoreError>> + Send;

    fn set_pending_tx_status(
        &self,
        id: &str,
        status: PendingTxStatus,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn set_pending_tx_submitted(
        &self,
        id: &str,
        tx_hash: B256,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn set_pending_tx_retry(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: u64,
        last_error: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn fail_pending_tx(
        &self,
        id: &str,
        error: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// FIFO queue of one signer pair: pending items in enqueue order.
    fn signer_queue(
        &self,
        signer: Address,
        chain_id: u32,
    ) -> impl Future<Output = Result<Vec<PendingTransaction>, StoreError>> + Send;

    fn list_pending_txs_in(
        &self,
        statuses: &[PendingTxStatus],
    ) -> impl Future<Output = Result<Vec<PendingTransaction>, StoreError>> + Send;
}

pub trait ProofTaskStore: Send + Sync + 'static {
    fn create_proof_task(
        &self,
        task: ProofTask,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_proof_task(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<ProofTask>, StoreError>> + Send;

    /// Due pending tasks ordered by `(priority, created_at)`, capped.
    fn due_proof_tasks(
        &self,
        now: u64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ProofTask>, StoreError>> + Send;

    /// `pending → processing`; `Ok(false)` when another worker won.
    fn claim_proof_task(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn complete_proof_task(
        &self,
        id: &str,
        result: ProofArtifact,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn retry_proof_task(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: u64,
        last_error: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn fail_proof_task(
        &self,
        id: &str,
        last_error: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn list_proof_tasks_in(
        &self,
        statuses: &[TaskStatus],
    ) -> impl Future<Output = Result<Vec<ProofTask>, StoreError>> + Send;
}

pub trait PollingTaskStore: Send + Sync + 'static {
    fn create_polling_task(
        &self,
        task: PollingTask,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_polling_task(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<PollingTask>, StoreError>> + Send;

    /// Pending tasks due at `now`, ordered by `next_poll_at`, capped.
    fn due_polling_tasks(
        &self,
        now: u64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<PollingTask>, StoreError>> + Send;

    /// Atomic `pending → running` promotion stamping `started_at`.
    fn claim_polling_task(
        &self,
        id: &str,
        now: u64,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn complete_polling_task(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn reschedule_polling_task(
        &self,
        id: &str,
        retry_count: u32,
        next_poll_at: u64,
        last_error: Option<String>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn fail_polling_task(
        &self,
        id: &str,
        last_error: String,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn list_polling_tasks_in(
        &self,
        statuses: &[PollStatus],
    ) -> impl Future<Output = Result<Vec<PollingTask>, StoreError>> + Send;

    /// Recovery: re-queues a failed/cancelled task with a one-poll delay.
    fn requeue_polling_task(
        &self,
        id: &str,
        next_poll_at: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

pub trait FailedTxStore: Send + Sync + 'static {
    fn create_failed_tx(
        &self,
        record: FailedTransaction,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn set_failed_tx_status(
        &self,
        id: &str,
        status: FailedTxStatus,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn list_failed_txs(
        &self,
    ) -> impl Future<Output = Result<Vec<FailedTransaction>, StoreError>> + Send;
}

pub trait ProcessedEventStore: Send + Sync + 'static {
    /// Returns `true` for a first-seen key; duplicates refresh their
    /// timestamp and return `false`.
    fn record_event(
        &self,
        key: &crate::events::EventKey,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Releases a claimed key so a redelivery can retry after a handler
    /// failure.
    fn forget_event(
        &self,
        key: &crate::events::EventKey,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

pub struct InMemoryStore {
    checkbooks: DashMap<CheckbookId, Checkbook>,
    checkbook_by_commitment: DashMap<B256, CheckbookId>,

    allocations: DashMap<AllocationId, Allocation>,
    allocation_by_nullifier: DashMap<B256, AllocationId>,

    withdraws: DashMap<String, WithdrawRequest>,
    withdraw_by_nullifier: DashMap<B256, String>,
    withdraw_by_request_id: DashMap<String, String>,

    queue_roots: DashMap<B256, QueueRoot>,
    queue_root_by_prev: DashMap<B256, B256>,
    queue_root_by_commitment: DashMap<B256, B256>,
    recent_roots: DashMap<u32, B256>,

    pending_txs: DashMap<String, PendingTransaction>,
    proof_tasks: DashMap<String, ProofTask>,
    polling_tasks: DashMap<String, PollingTask>,
    failed_txs: DashMap<String, FailedTransaction>,
    processed_events: DashMap<String, u64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            checkbooks: DashMap::new(),
            checkbook_by_commitment: DashMap::new(),
            allocations: DashMap::new(),
            allocation_by_nullifier: DashMap::new(),
            withdraws: DashMap::new(),
            withdraw_by_nullifier: DashMap::new(),
            withdraw_by_request_id: DashMap::new(),
            queue_roots: DashMap::new(),
            queue_root_by_prev: DashMap::new(),
            queue_root_by_commitment: DashMap::new(),
            recent_roots: DashMap::new(),
            pending_txs: DashMap::new(),
            proof_tasks: DashMap::new(),
            polling_tasks: DashMap::new(),
            failed_txs: DashMap::new(),
            processed_events: DashMap::new(),
        }
    }

    /// Queue depths for the ops surface.
    pub fn depths(&self) -> StoreDepths {
        StoreDepths {
            checkbooks: self.checkbooks.len(),
            allocations: self.allocations.len(),
            withdraw_requests: self.withdraws.len(),
            queue_roots: self.queue_roots.len(),
            pending_txs: self.pending_txs.len(),
            proof_tasks: self.proof_tasks.len(),
            polling_tasks: self.polling_tasks.len(),
            failed_txs: self.failed_txs.len(),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreDepths {
    pub checkbooks: usize,
    pub allocations: usize,
    pub withdraw_requests: usize,
    pub queue_roots: usize,
    pub pending_txs: usize,
    pub proof_tasks: usize,
    pub polling_tasks: usize,
    pub failed_txs: usize,
}

pub fn build_store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new())
}

impl CheckbookStore for InMemoryStore {
    async fn create_checkbook(&self, checkbook: Checkbook) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.checkbooks.entry(checkbook.id) {
            Entry::Occupied(_) => Err(StoreError::duplicate("checkbook", checkbook.id.to_string())),
            Entry::Vacant(vac) => {
                vac.insert(checkbook);
                Ok(())
            }
        }
    }

    async fn get_checkbook(&self, id: CheckbookId) -> Result<Option<Checkbook>, StoreError> {
        Ok(self.checkbooks.get(&id).map(|r| r.value().clone()))
    }

    async fn find_checkbook_by_commitment(
        &self,
        commitment: B256,
    ) -> Result<Option<Checkbook>, StoreError> {
        let Some(id) = self.checkbook_by_commitment.get(&commitment).map(|r| *r.value()) else {
            return Ok(None);
        };
        Ok(self.checkbooks.get(&id).map(|r| r.value().clone()))
    }

    async fn advance_checkbook(
        &self,
        id: CheckbookId,
        new_status: CheckbookStatus,
    ) -> Result<bool, StoreError> {
        let mut entry = self
            .checkbooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("checkbook", id.to_string()))?;
        let cb = entry.value_mut();
        if !advance_checkbook_status(cb.status, new_status) {
            return Ok(false);
        }
        cb.status = new_status;
        cb.updated_at = now_epoch();
        Ok(true)
    }

    async fn fail_checkbook(
        &self,
        id: CheckbookId,
        status: CheckbookStatus,
        _error: String,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .checkbooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("checkbook", id.to_string()))?;
        let cb = entry.value_mut();
        cb.status = status;
        cb.updated_at = now_epoch();
        Ok(())
    }

    async fn apply_deposit_recorded(
        &self,
        id: CheckbookId,
        update: DepositRecordedUpdate,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .checkbooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("checkbook", id.to_string()))?;
        let cb = entry.value_mut();
        cb.token_key = update.token_key;
        cb.gross_amount = update.gross_amount;
        cb.allocatable_amount = update.allocatable_amount;
        cb.fee_total_locked = update.fee_total_locked;
        cb.owner = update.owner;
        cb.updated_at = now_epoch();
        Ok(())
    }

    async fn set_checkbook_proof(
        &self,
        id: CheckbookId,
        commitment: B256,
        proof: Vec<u8>,
        public_values: Vec<u8>,
    ) -> Result<(), StoreError> {
        {
            let mut entry = self
                .checkbooks
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("checkbook", id.to_string()))?;
            let cb = entry.value_mut();
            cb.commitment = Some(commitment);
            cb.proof = Some(proof);
            cb.public_values = Some(public_values);
            cb.updated_at = now_epoch();
        }
        self.checkbook_by_commitment.insert(commitment, id);
        Ok(())
    }

    async fn set_deposit_used(&self, id: CheckbookId) -> Result<(), StoreError> {
        let mut entry = self
            .checkbooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("checkbook", id.to_string()))?;
        let cb = entry.value_mut();
        cb.deposit_used = true;
        cb.updated_at = now_epoch();
        Ok(())
    }

    async fn set_deposit_tx_hash(&self, id: CheckbookId, tx_hash: B256) -> Result<(), StoreError> {
        let mut entry = self
            .checkbooks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("checkbook", id.to_string()))?;
        let cb = entry.value_mut();
        cb.deposit_tx_hash = Some(tx_hash);
        cb.updated_at = now_epoch();
        Ok(())
    }

    async fn list_checkbooks(&self) -> Result<Vec<Checkbook>, StoreError> {
        Ok(self.checkbooks.iter().map(|e| e.value().clone()).collect())
    }
}

impl AllocationStore for InMemoryStore {
    async fn create_allocation(&self, allocation: Allocation) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.allocations.entry(allocation.id) {
            Entry::Occupied(_) => {
                Err(StoreError::duplicate("allocation", allocation.id.to_string()))
            }
            Entry::Vacant(vac) => {
                vac.insert(allocation);
                Ok(())
            }
        }
    }

    async fn get_allocation(&self, id: AllocationId) -> Result<Option<Allocation>, StoreError> {
        Ok(self.allocations.get(&id).map(|r| r.value().clone()))
    }

    async fn list_checkbook_allocations(
        &self,
        checkbook: CheckbookId,
    ) -> Result<Vec<Allocation>, StoreError> {
        let mut out: Vec<Allocation> = self
            .allocations
            .iter()
            .filter(|e| e.key().checkbook == checkbook)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|a| a.id.seq);
        Ok(out)
    }

    async fn find_allocation_by_nullifier(
        &self,
        nullifier: B256,
    ) -> Result<Option<Allocation>, StoreError> {
        let Some(id) = self.allocation_by_nullifier.get(&nullifier).map(|r| *r.value()) else {
            return Ok(None);
        };
        Ok(self.allocations.get(&id).map(|r| r.value().clone()))
    }

    async fn set_allocation_nullifier(
        &self,
        id: AllocationId,
        nullifier: B256,
    ) -> Result<(), StoreError> {
        {
            let mut entry = self
                .allocations
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found("allocation", id.to_string()))?;
            let alloc = entry.value_mut();
            match alloc.nullifier {
                Some(existing) if existing == nullifier => return Ok(()),
                Some(_) => {
                    return Err(StoreError::stale(
                        "allocation",
                        id.to_string(),
                        "nullifier already assigned",
                    ))
                }
                None => {
                    alloc.nullifier = Some(nullifier);
                    alloc.updated_at = now_epoch();
                }
            }
        }
        self.allocation_by_nullifier.insert(nullifier, id);
        Ok(())
    }

    async fn lock_allocation(&self, id: AllocationId, request_id: &str) -> Result<(), StoreError> {
        let mut entry = self
            .allocations
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("allocation", id.to_string()))?;
        let alloc = entry.value_mut();
        if alloc.status != AllocationStatus::Idle {
            return Err(StoreError::stale("allocation", id.to_string(), "not idle"));
        }
        alloc.status = AllocationStatus::Pending;
        alloc.withdraw_request_id = Some(request_id.to_string());
        alloc.updated_at = now_epoch();
        Ok(())
    }

    async fn release_allocation(
        &self,
        id: AllocationId,
        request_id: &str,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .allocations
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("allocation", id.to_string()))?;
        let alloc = entry.value_mut();
        if alloc.status != AllocationStatus::Pending
            || alloc.withdraw_request_id.as_deref() != Some(request_id)
        {
            return Err(StoreError::stale(
                "allocation",
                id.to_string(),
                "not pending for this request",
            ));
        }
        alloc.status = AllocationStatus::Idle;
        alloc.withdraw_request_id = None;
        alloc.updated_at = now_epoch();
        Ok(())
    }

    async fn mark_allocation_used(&self, id: AllocationId) -> Result<(), StoreError> {
        let mut entry = self
            .allocations
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("allocation", id.to_string()))?;
        let alloc = entry.value_mut();
        match alloc.status {
            AllocationStatus::Used => Ok(()),
            AllocationStatus::Pending => {
                alloc.status = AllocationStatus::Used;
                alloc.updated_at = now_epoch();
                Ok(())
            }
            AllocationStatus::Idle => Err(StoreError::stale(
                "allocation",
                id.to_string(),
                "cannot use an idle allocation",
            )),
        }
    }
}

impl WithdrawRequestStore for InMemoryStore {
    async fn create_withdraw_request(&self, request: WithdrawRequest) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        let nullifier = request.withdraw_nullifier;
        let request_id = request.request_id.clone();
        let id = request.id.clone();
        match self.withdraws.entry(id.clone()) {
            Entry::Occupied(_) => return Err(StoreError::duplicate("withdraw_request", id)),
            Entry::Vacant(vac) => {
                vac.insert(request);
            }
        }
        self.withdraw_by_nullifier.insert(nullifier, id.clone());
        if let Some(rid) = request_id {
            self.withdraw_by_request_id.insert(rid, id);
        }
        Ok(())
    }

    async fn get_withdraw_request(&self, id: &str) -> Result<Option<WithdrawRequest>, StoreError> {
        Ok(self.withdraws.get(id).map(|r| r.value().clone()))
    }

    async fn delete_withdraw_request(&self, id: &str) -> Result<(), StoreError> {
        let Some((_, removed)) = self.withdraws.remove(id) else {
            return Err(StoreError::not_found("withdraw_request", id));
        };
        self.withdraw_by_nullifier
            .remove_if(&removed.withdraw_nullifier, |_, v| v == id);
        if let Some(rid) = &removed.request_id {
            self.withdraw_by_request_id.remove_if(rid, |_, v| v == id);
        }
        Ok(())
    }

    async fn find_withdraw_by_nullifier(
        &self,
        nullifier: B256,
    ) -> Result<Option<WithdrawRequest>, StoreError> {
        let Some(id) = self
            .withdraw_by_nullifier
            .get(&nullifier)
            .map(|r| r.value().clone())
        else {
            return Ok(None);
        };
        Ok(self.withdraws.get(&id).map(|r| r.value().clone()))
    }

    async fn find_withdraw_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<WithdrawRequest>, StoreError> {
        let Some(id) = self
            .withdraw_by_request_id
            .get(request_id)
            .map(|r| r.value().clone())
        else {
            return Ok(None);
        };
        Ok(self.withdraws.get(&id).map(|r| r.value().clone()))
    }

    async fn set_proof_status(&self, id: &str, status: ProofStatus) -> Result<bool, StoreError> {
        let mut entry = self
            .withdraws
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
        let w = entry.value_mut();
        // Completed/Failed are terminal for the proof stage; regression to
        // pending/in_progress is the stale-writer case.
        let regressing = matches!(w.proof_status, ProofStatus::Completed | ProofStatus::Failed)
            && matches!(status, ProofStatus::Pending | ProofStatus::InProgress);
        if regressing {
            return Ok(false);
        }
        w.proof_status = status;
        w.updated_at = now_epoch();
        Ok(true)
    }

    async fn set_withdraw_proof(
        &self,
        id: &str,
        proof: Vec<u8>,
        public_values: Vec<u8>,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .withdraws
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
        let w = entry.value_mut();
        w.proof = Some(proof);
        w.public_values = Some(public_values);
        w.updated_at = now_epoch();
        Ok(())
    }

    async fn rewrite_withdraw_nullifier(&self, id: &str, nullifier: B256) -> Result<(), StoreError> {
        let old = {
            let mut entry = self
                .withdraws
                .get_mut(id)
                .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
            let w = entry.value_mut();
            let old = w.withdraw_nullifier;
            w.withdraw_nullifier = nullifier;
            w.updated_at = now_epoch();
            old
        };
        self.withdraw_by_nullifier.remove_if(&old, |_, v| v == id);
        self.withdraw_by_nullifier
            .insert(nullifier, id.to_string());
        Ok(())
    }

    async fn set_execute_status(
        &self,
        id: &str,
        status: ExecuteStatus,
        ctx: ExecuteContext,
    ) -> Result<bool, StoreError> {
        let mut entry = self
            .withdraws
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
        let w = entry.value_mut();
        if w.execute_status.is_terminal() && w.execute_status != status {
            return Ok(false);
        }
        w.execute_status = status;
        if let Some(chain_id) = ctx.chain_id {
            w.execute_chain_id = Some(chain_id);
        }
        if let Some(tx_hash) = ctx.tx_hash {
            w.execute_tx_hash = Some(tx_hash);
        }
        if let Some(block) = ctx.block_number {
            w.execute_block_number = Some(block);
        }
        w.updated_at = now_epoch();
        Ok(true)
    }

    async fn set_execute_status_if_submitted(
        &self,
        id: &str,
        status: ExecuteStatus,
        ctx: ExecuteContext,
    ) -> Result<bool, StoreError> {
        let mut entry = self
            .withdraws
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
        let w = entry.value_mut();
        if w.execute_status != ExecuteStatus::Submitted {
            return Ok(false);
        }
        w.execute_status = status;
        if let Some(chain_id) = ctx.chain_id {
            w.execute_chain_id = Some(chain_id);
        }
        if let Some(tx_hash) = ctx.tx_hash {
            w.execute_tx_hash = Some(tx_hash);
        }
        if let Some(block) = ctx.block_number {
            w.execute_block_number = Some(block);
        }
        w.updated_at = now_epoch();
        Ok(true)
    }

    async fn set_payout_status(&self, id: &str, status: PayoutStatus) -> Result<bool, StoreError> {
        let mut entry = self
            .withdraws
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
        let w = entry.value_mut();
        // Completed payouts stand; a late pending/processing write loses.
        if w.payout_status == PayoutStatus::Completed && status != PayoutStatus::Completed {
            return Ok(false);
        }
        w.payout_status = status;
        w.updated_at = now_epoch();
        Ok(true)
    }

    async fn set_hook_status(&self, id: &str, status: HookStatus) -> Result<bool, StoreError> {
        let mut entry = self
            .withdraws
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
        let w = entry.value_mut();
        if matches!(w.hook_status, HookStatus::Completed | HookStatus::Abandoned)
            && w.hook_status != status
        {
            return Ok(false);
        }
        w.hook_status = status;
        w.updated_at = now_epoch();
        Ok(true)
    }

    async fn set_fallback_transferred(&self, id: &str) -> Result<(), StoreError> {
        let mut entry = self
            .withdraws
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
        let w = entry.value_mut();
        w.fallback_transferred = true;
        w.updated_at = now_epoch();
        Ok(())
    }

    async fn set_fallback_error(&self, id: &str, error: String) -> Result<(), StoreError> {
        let mut entry = self
            .withdraws
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
        let w = entry.value_mut();
        w.fallback_error = Some(error);
        w.updated_at = now_epoch();
        Ok(())
    }

    async fn set_withdraw_last_error(&self, id: &str, error: String) -> Result<(), StoreError> {
        let mut entry = self
            .withdraws
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
        let w = entry.value_mut();
        w.last_error = Some(error);
        w.updated_at = now_epoch();
        Ok(())
    }

    async fn bump_stage_retries(
        &self,
        id: &str,
        stage: RetryStage,
        cap: u32,
    ) -> Result<u32, StoreError> {
        let mut entry = self
            .withdraws
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
        let w = entry.value_mut();
        let counter = match stage {
            RetryStage::Payout => &mut w.payout_retries,
            RetryStage::Hook => &mut w.hook_retries,
            RetryStage::Fallback => &mut w.fallback_retries,
        };
        if *counter >= cap {
            return Err(StoreError::stale(
                "withdraw_request",
                id,
                "retry cap reached",
            ));
        }
        *counter += 1;
        w.updated_at = now_epoch();
        Ok(*counter)
    }

    async fn pin_main_status(&self, id: &str, status: MainStatus) -> Result<(), StoreError> {
        let mut entry = self
            .withdraws
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
        let w = entry.value_mut();
        w.status = status;
        w.updated_at = now_epoch();
        Ok(())
    }

    async fn recompute_main_status(&self, id: &str) -> Result<MainStatus, StoreError> {
        let mut entry = self
            .withdraws
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("withdraw_request", id))?;
        let w = entry.value_mut();
        if w.status.is_pinned() {
            return Ok(w.status);
        }
        if let Some(derived) = derive_main_status(
            w.proof_status,
            w.execute_status,
            w.payout_status,
            w.hook_status,
            w.fallback_transferred,
        ) {
            if derived != w.status {
                w.status = derived;
                w.updated_at = now_epoch();
            }
        }
        Ok(w.status)
    }

    async fn list_withdraw_requests(&self) -> Result<Vec<WithdrawRequest>, StoreError> {
        Ok(self.withdraws.iter().map(|e| e.value().clone()).collect())
    }
}

impl QueueRootStore for InMemoryStore {
    async fn insert_queue_root(&self, node: QueueRoot) -> Result<bool, StoreError> {
        use dashmap::mapref::entry::Entry;
        let root = node.root;
        let prev = node.previous_root;
        let commitment = node.created_by_commitment;
        match self.queue_roots.entry(root) {
            Entry::Occupied(mut occ) => {
                // Duplicate-key insert is a no-op beyond a timestamp refresh.
                occ.get_mut().updated_at = now_epoch();
                Ok(false)
            }
            Entry::Vacant(vac) => {
                vac.insert(node);
                self.queue_root_by_prev.insert(prev, root);
                self.queue_root_by_commitment.insert(commitment, root);
                Ok(true)
            }
        }
    }

    async fn get_queue_root(&self, root: B256) -> Result<Option<QueueRoot>, StoreError> {
        Ok(self.queue_roots.get(&root).map(|r| r.value().clone()))
    }

    async fn get_queue_root_successor(&self, root: B256) -> Result<Option<QueueRoot>, StoreError> {
        let Some(next) = self.queue_root_by_prev.get(&root).map(|r| *r.value()) else {
            return Ok(None);
        };
        Ok(self.queue_roots.get(&next).map(|r| r.value().clone()))
    }

    async fn find_queue_root_by_commitment(
        &self,
        commitment: B256,
    ) -> Result<Option<QueueRoot>, StoreError> {
        let Some(root) = self
            .queue_root_by_commitment
            .get(&commitment)
            .map(|r| *r.value())
        else {
            return Ok(None);
        };
        Ok(self.queue_roots.get(&root).map(|r| r.value().clone()))
    }

    async fn recent_queue_root(&self, chain_id: u32) -> Result<Option<QueueRoot>, StoreError> {
        let Some(root) = self.recent_roots.get(&chain_id).map(|r| *r.value()) else {
            return Ok(None);
        };
        Ok(self.queue_roots.get(&root).map(|r| r.value().clone()))
    }

    async fn set_recent_root(&self, chain_id: u32, root: B256) -> Result<(), StoreError> {
        // Clear the flag on the previous recent node, set it on the new one.
        if let Some(prev) = self.recent_roots.get(&chain_id).map(|r| *r.value()) {
            if let Some(mut node) = self.queue_roots.get_mut(&prev) {
                node.value_mut().is_recent_root = false;
                node.value_mut().updated_at = now_epoch();
            }
        }
        {
            let mut node = self
                .queue_roots
                .get_mut(&root)
                .ok_or_else(|| StoreError::not_found("queue_root", root.to_string()))?;
            node.value_mut().is_recent_root = true;
            node.value_mut().updated_at = now_epoch();
        }
        self.recent_roots.insert(chain_id, root);
        Ok(())
    }
}

impl PendingTxStore for InMemoryStore {
    async fn create_pending_tx(&self, tx: PendingTransaction) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.pending_txs.entry(tx.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::duplicate("pending_tx", tx.id)),
            Entry::Vacant(vac) => {
                vac.insert(tx);
                Ok(())
            }
        }
    }

    async fn get_pending_tx(&self, id: &str) -> Result<Option<PendingTransaction>, StoreError> {
        Ok(self.pending_txs.get(id).map(|r| r.value().clone()))
    }

    async fn set_pending_tx_status(
        &self,
        id: &str,
        status: PendingTxStatus,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .pending_txs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("pending_tx", id))?;
        let tx = entry.value_mut();
        tx.status = status;
        tx.updated_at = now_epoch();
        Ok(())
    }

    async fn set_pending_tx_submitted(&self, id: &str, tx_hash: B256) -> Result<(), StoreError> {
        let mut entry = self
            .pending_txs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("pending_tx", id))?;
        let tx = entry.value_mut();
        tx.status = PendingTxStatus::Submitted;
        tx.tx_hash = Some(tx_hash);
        tx.submitted_at = Some(now_epoch());
        tx.updated_at = now_epoch();
        Ok(())
    }

    async fn set_pending_tx_retry(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: u64,
        last_error: String,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .pending_txs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("pending_tx", id))?;
        let tx = entry.value_mut();
        tx.status = PendingTxStatus::Pending;
        tx.retry_count = retry_count;
        tx.next_retry_at = Some(next_retry_at);
        tx.last_error = Some(last_error);
        tx.updated_at = now_epoch();
        Ok(())
    }

    async fn fail_pending_tx(&self, id: &str, error: String) -> Result<(), StoreError> {
        let mut entry = self
            .pending_txs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("pending_tx", id))?;
        let tx = entry.value_mut();
        tx.status = PendingTxStatus::Failed;
        tx.last_error = Some(error);
        tx.updated_at = now_epoch();
        Ok(())
    }

    async fn signer_queue(
        &self,
        signer: Address,
        chain_id: u32,
    ) -> Result<Vec<PendingTransaction>, StoreError> {
        let mut queue: Vec<PendingTransaction> = self
            .pending_txs
            .iter()
            .filter(|e| {
                let tx = e.value();
                tx.signer == signer
                    && tx.chain_id == chain_id
                    && tx.status == PendingTxStatus::Pending
            })
            .map(|e| e.value().clone())
            .collect();
        queue.sort_by_key(|tx| (tx.created_at, tx.id.clone()));
        Ok(queue)
    }

    async fn list_pending_txs_in(
        &self,
        statuses: &[PendingTxStatus],
    ) -> Result<Vec<PendingTransaction>, StoreError> {
        let mut out: Vec<PendingTransaction> = self
            .pending_txs
            .iter()
            .filter(|e| statuses.contains(&e.value().status))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|tx| (tx.created_at, tx.id.clone()));
        Ok(out)
    }
}

impl ProofTaskStore for InMemoryStore {
    async fn create_proof_task(&self, task: ProofTask) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.proof_tasks.entry(task.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::duplicate("proof_task", task.id)),
            Entry::Vacant(vac) => {
                vac.insert(task);
                Ok(())
            }
        }
    }

    async fn get_proof_task(&self, id: &str) -> Result<Option<ProofTask>, StoreError> {
        Ok(self.proof_tasks.get(id).map(|r| r.value().clone()))
    }

    async fn due_proof_tasks(&self, now: u64, limit: usize) -> Result<Vec<ProofTask>, StoreError> {
        let mut due: Vec<ProofTask> = self
            .proof_tasks
            .iter()
            .filter(|e| {
                let t = e.value();
                t.status == TaskStatus::Pending && t.next_retry_at.map_or(true, |at| at <= now)
            })
            .map(|e| e.value().clone())
            .collect();
        due.sort_by_key(|t| (t.priority, t.created_at, t.id.clone()));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_proof_task(&self, id: &str) -> Result<bool, StoreError> {
        let mut entry = self
            .proof_tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("proof_task", id))?;
        let t = entry.value_mut();
        if t.status != TaskStatus::Pending {
            return Ok(false);
        }
        t.status = TaskStatus::Processing;
        t.updated_at = now_epoch();
        Ok(true)
    }

    async fn complete_proof_task(&self, id: &str, result: ProofArtifact) -> Result<(), StoreError> {
        let mut entry = self
            .proof_tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("proof_task", id))?;
        let t = entry.value_mut();
        t.status = TaskStatus::Completed;
        t.result = Some(result);
        t.last_error = None;
        t.updated_at = now_epoch();
        Ok(())
    }

    async fn retry_proof_task(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: u64,
        last_error: String,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .proof_tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("proof_task", id))?;
        let t = entry.value_mut();
        t.status = TaskStatus::Pending;
        t.retry_count = retry_count;
        t.next_retry_at = Some(next_retry_at);
        t.last_error = Some(last_error);
        t.updated_at = now_epoch();
        Ok(())
    }

    async fn fail_proof_task(&self, id: &str, last_error: String) -> Result<(), StoreError> {
        let mut entry = self
            .proof_tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("proof_task", id))?;
        let t = entry.value_mut();
        t.status = TaskStatus::Failed;
        t.last_error = Some(last_error);
        t.updated_at = now_epoch();
        Ok(())
    }

    async fn list_proof_tasks_in(
        &self,
        statuses: &[TaskStatus],
    ) -> Result<Vec<ProofTask>, StoreError> {
        Ok(self
            .proof_tasks
            .iter()
            .filter(|e| statuses.contains(&e.value().status))
            .map(|e| e.value().clone())
            .collect())
    }
}

impl PollingTaskStore for InMemoryStore {
    async fn create_polling_task(&self, task: PollingTask) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.polling_tasks.entry(task.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::duplicate("polling_task", task.id)),
            Entry::Vacant(vac) => {
                vac.insert(task);
                Ok(())
            }
        }
    }

    async fn get_polling_task(&self, id: &str) -> Result<Option<PollingTask>, StoreError> {
        Ok(self.polling_tasks.get(id).map(|r| r.value().clone()))
    }

    async fn due_polling_tasks(
        &self,
        now: u64,
        limit: usize,
    ) -> Result<Vec<PollingTask>, StoreError> {
        let mut due: Vec<PollingTask> = self
            .polling_tasks
            .iter()
            .filter(|e| {
                let t = e.value();
                t.status == PollStatus::Pending && t.next_poll_at <= now
            })
            .map(|e| e.value().clone())
            .collect();
        due.sort_by_key(|t| (t.next_poll_at, t.id.clone()));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_polling_task(&self, id: &str, now: u64) -> Result<bool, StoreError> {
        let mut entry = self
            .polling_tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("polling_task", id))?;
        let t = entry.value_mut();
        if t.status != PollStatus::Pending {
            return Ok(false);
        }
        t.status = PollStatus::Running;
        t.started_at = Some(now);
        t.updated_at = now_epoch();
        Ok(true)
    }

    async fn complete_polling_task(&self, id: &str) -> Result<(), StoreError> {
        let mut entry = self
            .polling_tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("polling_task", id))?;
        let t = entry.value_mut();
        t.status = PollStatus::Completed;
        t.updated_at = now_epoch();
        Ok(())
    }

    async fn reschedule_polling_task(
        &self,
        id: &str,
        retry_count: u32,
        next_poll_at: u64,
        last_error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .polling_tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("polling_task", id))?;
        let t = entry.value_mut();
        t.status = PollStatus::Pending;
        t.retry_count = retry_count;
        t.next_poll_at = next_poll_at;
        t.started_at = None;
        if let Some(err) = last_error {
            t.last_error = Some(err);
        }
        t.updated_at = now_epoch();
        Ok(())
    }

    async fn fail_polling_task(&self, id: &str, last_error: String) -> Result<(), StoreError> {
        let mut entry = self
            .polling_tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("polling_task", id))?;
        let t = entry.value_mut();
        t.status = PollStatus::Failed;
        t.last_error = Some(last_error);
        t.updated_at = now_epoch();
        Ok(())
    }

    async fn list_polling_tasks_in(
        &self,
        statuses: &[PollStatus],
    ) -> Result<Vec<PollingTask>, StoreError> {
        Ok(self
            .polling_tasks
            .iter()
            .filter(|e| statuses.contains(&e.value().status))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn requeue_polling_task(&self, id: &str, next_poll_at: u64) -> Result<(), StoreError> {
        let mut entry = self
            .polling_tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("polling_task", id))?;
        let t = entry.value_mut();
        t.status = PollStatus::Pending;
        t.next_poll_at = next_poll_at;
        t.started_at = None;
        t.updated_at = now_epoch();
        Ok(())
    }
}

impl FailedTxStore for InMemoryStore {
    async fn create_failed_tx(&self, record: FailedTransaction) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.failed_txs.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::duplicate("failed_tx", record.id)),
            Entry::Vacant(vac) => {
                vac.insert(record);
                Ok(())
            }
        }
    }

    async fn set_failed_tx_status(&self, id: &str, status: FailedTxStatus) -> Result<(), StoreError> {
        let mut entry = self
            .failed_txs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("failed_tx", id))?;
        let rec = entry.value_mut();
        rec.status = status;
        rec.updated_at = now_epoch();
        Ok(())
    }

    async fn list_failed_txs(&self) -> Result<Vec<FailedTransaction>, StoreError> {
        Ok(self.failed_txs.iter().map(|e| e.value().clone()).collect())
    }
}

impl ProcessedEventStore for InMemoryStore {
    async fn record_event(&self, key: &crate::events::EventKey) -> Result<bool, StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.processed_events.entry(key.to_string()) {
            Entry::Occupied(mut occ) => {
                *occ.get_mut() = now_epoch();
                Ok(false)
            }
            Entry::Vacant(vac) => {
                vac.insert(now_epoch());
                Ok(true)
            }
        }
    }

    async fn forget_event(&self, key: &crate::events::EventKey) -> Result<(), StoreError> {
        self.processed_events.remove(&key.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
