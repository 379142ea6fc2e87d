//! Unified polling service.
//!
//! Pending `(entity, txhash)` pairs are resolved against chain state on a
//! five-second batch cycle. Entity writes always go through the guarded
//! store operations, so the event processor wins every race: the
//! `WithdrawExecute` probe never rewrites an execute status that is not
//! exactly `submitted`, and checkbook advancement runs through the
//! monotone predicate.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain_client::{ChainProvider, ChainRpc};
use crate::entities::*;
use crate::error::{RpcError, ScannerError, StoreError};
use crate::scanner_client::NullifierAudit;
use crate::store::*;

/// Worker tick.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Tasks claimed per tick.
const POLL_BATCH: usize = 10;
/// Running tasks older than this are failed on startup.
const STUCK_RUNNING_SECS: u64 = 600;

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Scanner(#[from] ScannerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Chain-specific resolution of one polling task. `Ok(true)` means the
/// entity advanced (or needs no further polling); `Ok(false)` means poll
/// again later.
pub trait ChainProbe: Send + Sync + 'static {
    fn probe(
        &self,
        task: &PollingTask,
    ) -> impl std::future::Future<Output = Result<bool, PollError>> + Send;
}

/// Delay schedule: base interval, multiplied once a task has failed more
/// than five times, capped at a sixty-second single delay.
fn poll_delay_secs(base: u64, retry_count: u32) -> u64 {
    if retry_count <= 5 {
        return base;
    }
    let multiplier = (((retry_count - 5) / 5) + 1).min(6) as u64;
    (base * multiplier).min(60)
}

pub struct PollingService<Pb> {
    store: Arc<InMemoryStore>,
    probe: Arc<Pb>,
}

impl<Pb: ChainProbe> PollingService<Pb> {
    pub fn new(store: Arc<InMemoryStore>, probe: Arc<Pb>) -> Self {
        Self { store, probe }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("polling service started");
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => Arc::clone(&self).tick().await,
            }
        }
        info!("polling service stopped");
    }

    async fn tick(self: Arc<Self>) {
        let now = now_epoch();
        let due = match self.store.due_polling_tasks(now, POLL_BATCH).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "polling task fetch failed");
                return;
            }
        };
        for task in due {
            match self.store.claim_polling_task(&task.id, now).await {
                Ok(true) => {}
                Ok(false) | Err(_) => continue,
            }
            let service = Arc::clone(&self);
            tokio::spawn(async move {
                service.handle(task).await;
            });
        }
    }

    pub async fn handle(&self, task: PollingTask) {
        let outcome = self.probe.probe(&task).await;
        let result = match outcome {
            Ok(true) => {
                debug!(task = %task.id, entity = %task.entity.describe(), "poll advanced");
                self.store.complete_polling_task(&task.id).await
            }
            Ok(false) => self.reschedule(&task, None).await,
            Err(e) => self.reschedule(&task, Some(e.to_string())).await,
        };
        if let Err(e) = result {
            error!(task = %task.id, error = %e, "polling task bookkeeping failed");
        }
    }

    async fn reschedule(
        &self,
        task: &PollingTask,
        last_error: Option<String>,
    ) -> Result<(), StoreError> {
        let retry_count = task.retry_count + 1;
        if retry_count > task.max_retries {
            // Task-level failure only; the entity stays untouched, that is
            // the event processor's job.
            warn!(
                task = %task.id,
                entity = %task.entity.describe(),
                retries = task.max_retries,
                "polling task exhausted"
            );
            return self
                .store
                .fail_polling_task(&task.id, "max retries exceeded".into())
                .await;
        }
        let delay = poll_delay_secs(task.poll_interval_secs, retry_count);
        self.store
            .reschedule_polling_task(&task.id, retry_count, now_epoch() + delay, last_error)
            .await
    }

    /// Startup recovery: tasks stuck running past the cutoff are failed
    /// with a timeout; failed or cancelled tasks with remaining budget are
    /// requeued with a one-poll delay.
    pub async fn recover(&self) -> Result<(), StoreError> {
        let now = now_epoch();
        for task in self
            .store
            .list_polling_tasks_in(&[PollStatus::Running])
            .await?
        {
            let stuck = task
                .started_at
                .map_or(true, |at| now.saturating_sub(at) > STUCK_RUNNING_SECS);
            if stuck {
                warn!(task = %task.id, "failing polling task stuck in running");
                self.store
                    .fail_polling_task(&task.id, "timeout: stuck in running".into())
                    .await?;
            }
        }
        for task in self
            .store
            .list_polling_tasks_in(&[PollStatus::Failed, PollStatus::Cancelled])
            .await?
        {
            if task.retry_count < task.max_retries {
                info!(task = %task.id, "requeueing recoverable polling task");
                self.store
                    .requeue_polling_task(&task.id, now + task.poll_interval_secs)
                    .await?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Receipt probe
// ---------------------------------------------------------------------------

/// The production probe: resolves tasks against receipts on the task's
/// chain (accepting SLIP-44 or EVM ids) and against the scanner for
/// cross-chain settlement.
pub struct ReceiptProbe<Pr, A> {
    store: Arc<InMemoryStore>,
    provider: Arc<Pr>,
    audit: Arc<A>,
}

impl<Pr: ChainProvider, A: NullifierAudit> ReceiptProbe<Pr, A> {
    pub fn new(store: Arc<InMemoryStore>, provider: Arc<Pr>, audit: Arc<A>) -> Self {
        Self {
            store,
            provider,
            audit,
        }
    }

    async fn receipt(
        &self,
        task: &PollingTask,
    ) -> Result<Option<crate::chain_client::TxReceipt>, PollError> {
        let client = self
            .provider
            .client_for(task.chain_id)
            .ok_or(RpcError::UnknownChain(task.chain_id))?;
        Ok(client.transaction_receipt(task.tx_hash).await?)
    }

    async fn probe_checkbook(
        &self,
        task: &PollingTask,
        id: CheckbookId,
        on_success: CheckbookStatus,
    ) -> Result<bool, PollError> {
        match self.receipt(task).await? {
            None => Ok(false),
            Some(receipt) if receipt.success => {
                // The monotone predicate makes this a no-op when a chain
                // event already moved the checkbook further.
                self.store.advance_checkbook(id, on_success).await?;
                Ok(true)
            }
            Some(_) => {
                self.store
                    .fail_checkbook(
                        id,
                        CheckbookStatus::SubmissionFailed,
                        "commitment transaction reverted".into(),
                    )
                    .await?;
                Ok(true)
            }
        }
    }

    async fn probe_withdraw_execute(
        &self,
        task: &PollingTask,
        request_id: &str,
    ) -> Result<bool, PollError> {
        let Some(request) = self.store.get_withdraw_request(request_id).await? else {
            return Ok(true);
        };
        // Event-processor-wins ordering: if anything other than
        // `submitted` is present, a chain event got here first and the
        // poller yields without writing.
        if request.execute_status != ExecuteStatus::Submitted {
            return Ok(true);
        }
        match self.receipt(task).await? {
            None => Ok(false),
            Some(receipt) => {
                let status = if receipt.success {
                    ExecuteStatus::Success
                } else {
                    ExecuteStatus::VerifyFailed
                };
                let wrote = self
                    .store
                    .set_execute_status_if_submitted(
                        request_id,
                        status,
                        ExecuteContext {
                            chain_id: Some(task.chain_id),
                            tx_hash: Some(task.tx_hash),
                            block_number: Some(receipt.block_number),
                        },
                    )
                    .await?;
                if wrote {
                    self.store.recompute_main_status(request_id).await?;
                }
                Ok(true)
            }
        }
    }
}

impl<Pr: ChainProvider, A: NullifierAudit> ChainProbe for ReceiptProbe<Pr, A> {
    async fn probe(&self, task: &PollingTask) -> Result<bool, PollError> {
        match (task.task_type, &task.entity) {
            (
                PollTaskType::DepositBusinessChain | PollTaskType::DepositManagementChain,
                PollEntity::Checkbook { id },
            ) => self.probe_checkbook(task, *id, CheckbookStatus::Unsigned).await,
            (
                PollTaskType::CommitmentSubmission | PollTaskType::CommitmentConfirmation,
                PollEntity::Checkbook { id },
            ) => {
                self.probe_checkbook(task, *id, CheckbookStatus::WithCheckbook)
                    .await
            }
            (PollTaskType::WithdrawExecute, PollEntity::WithdrawRequest { id }) => {
                let id = id.clone();
                self.probe_withdraw_execute(task, &id).await
            }
            (
                PollTaskType::WithdrawSubmission | PollTaskType::WithdrawManagement,
                PollEntity::WithdrawRequest { id },
            ) => {
                let id = id.clone();
                self.probe_withdraw_execute(task, &id).await
            }
            (PollTaskType::WithdrawCrossChain, PollEntity::WithdrawRequest { id }) => {
                // Destination-chain settlement: the payout events own the
                // entity, the poller only resolves the task.
                let Some(request) = self.store.get_withdraw_request(id).await? else {
                    return Ok(true);
                };
                Ok(self
                    .audit
                    .nullifier_used(task.chain_id, request.withdraw_nullifier)
                    .await?)
            }
            (task_type, entity) => {
                warn!(?task_type, entity = %entity.describe(), "mismatched polling task shape");
                Ok(true)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_client::TxReceipt;
    use crate::types::{Amount, Intent, UniversalAddress};
    use alloy_primitives::{Address, B256, U256};
    use std::sync::Mutex as StdMutex;

    struct ScriptedRpc {
        receipts: StdMutex<Vec<Option<TxReceipt>>>,
    }

    impl ChainRpc for ScriptedRpc {
        async fn network_id(&self) -> Result<u64, RpcError> {
            Ok(56)
        }
        async fn block_number(&self) -> Result<u64, RpcError> {
            Ok(1)
        }
        async fn balance_at(&self, _addr: Address) -> Result<U256, RpcError> {
            Ok(U256::ZERO)
        }
        async fn pending_nonce_at(&self, _addr: Address) -> Result<u64, RpcError> {
            Ok(0)
        }
        async fn suggest_gas_price(&self) -> Result<u128, RpcError> {
            Ok(1)
        }
        async fn send_raw_transaction(&self, _raw: Vec<u8>) -> Result<B256, RpcError> {
            Ok(B256::ZERO)
        }
        async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, RpcError> {
            let mut receipts = self.receipts.lock().unwrap();
            if receipts.is_empty() {
                Ok(None)
            } else {
                let mut r = receipts.remove(0);
                if let Some(rec) = &mut r {
                    rec.tx_hash = tx_hash;
                }
                Ok(r)
            }
        }
        async fn transaction_known(&self, _tx_hash: B256) -> Result<bool, RpcError> {
            Ok(false)
        }
    }

    struct OneChain {
        rpc: Arc<ScriptedRpc>,
    }

    impl ChainProvider for OneChain {
        type Rpc = ScriptedRpc;
        fn client_for(&self, _chain_id: u32) -> Option<Arc<ScriptedRpc>> {
            Some(Arc::clone(&self.rpc))
        }
    }

    struct NeverUsed;

    impl NullifierAudit for NeverUsed {
        async fn nullifier_used(
            &self,
            _chain_id: u32,
            _nullifier: B256,
        ) -> Result<bool, ScannerError> {
            Ok(false)
        }
    }

    fn probe_with(
        store: Arc<InMemoryStore>,
        receipts: Vec<Option<TxReceipt>>,
    ) -> ReceiptProbe<OneChain, NeverUsed> {
        let rpc = Arc::new(ScriptedRpc {
            receipts: StdMutex::new(receipts),
        });
        ReceiptProbe::new(store, Arc::new(OneChain { rpc }), Arc::new(NeverUsed))
    }

    async fn seed_submitted_withdraw(store: &InMemoryStore, id: &str) {
        let owner =
            UniversalAddress::parse(714, "0x00000000000000000000000000000000000000aa").unwrap();
        store
            .create_withdraw_request(WithdrawRequest::new(
                id.into(),
                owner,
                vec![],
                Intent::RawToken {
                    beneficiary: owner,
                    token_symbol: "USDT".into(),
                },
                owner,
                Amount::from_u64(10),
                B256::repeat_byte(0x42),
            ))
            .await
            .unwrap();
        store
            .set_proof_status(id, ProofStatus::Completed)
            .await
            .unwrap();
        store
            .set_execute_status(id, ExecuteStatus::Submitted, ExecuteContext::default())
            .await
            .unwrap();
    }

    fn execute_task(request_id: &str) -> PollingTask {
        PollingTask::new(
            format!("poll-{request_id}"),
            PollEntity::WithdrawRequest {
                id: request_id.into(),
            },
            PollTaskType::WithdrawExecute,
            B256::repeat_byte(0x55),
            714,
        )
    }

    #[test]
    fn delay_schedule_multiplies_after_five_retries() {
        assert_eq!(poll_delay_secs(10, 0), 10);
        assert_eq!(poll_delay_secs(10, 5), 10);
        assert_eq!(poll_delay_secs(10, 9), 10);
        assert_eq!(poll_delay_secs(10, 10), 20);
        assert_eq!(poll_delay_secs(10, 30), 60);
        assert_eq!(poll_delay_secs(10, 180), 60);
    }

    #[tokio::test]
    async fn poller_yields_when_event_won_the_race() {
        let store = Arc::new(InMemoryStore::new());
        seed_submitted_withdraw(store.as_ref(), "w1").await;
        // The event processor got there first.
        store
            .set_execute_status("w1", ExecuteStatus::Success, ExecuteContext::default())
            .await
            .unwrap();
        let pre = store.get_withdraw_request("w1").await.unwrap().unwrap();

        // A scripted revert receipt that must never be applied.
        let probe = probe_with(
            store.clone(),
            vec![Some(TxReceipt {
                tx_hash: B256::ZERO,
                block_number: 9,
                success: false,
            })],
        );
        let advanced = probe.probe(&execute_task("w1")).await.unwrap();
        assert!(advanced);

        let post = store.get_withdraw_request("w1").await.unwrap().unwrap();
        assert_eq!(post.execute_status, ExecuteStatus::Success);
        assert_eq!(post.updated_at, pre.updated_at);
    }

    #[tokio::test]
    async fn execute_receipt_applies_through_the_guard() {
        let store = Arc::new(InMemoryStore::new());
        seed_submitted_withdraw(store.as_ref(), "w1").await;
        let probe = probe_with(
            store.clone(),
            vec![
                None,
                Some(TxReceipt {
                    tx_hash: B256::ZERO,
                    block_number: 33,
                    success: true,
                }),
            ],
        );

        // First attempt: no receipt yet.
        assert!(!probe.probe(&execute_task("w1")).await.unwrap());
        // Second attempt: receipt lands.
        assert!(probe.probe(&execute_task("w1")).await.unwrap());

        let w = store.get_withdraw_request("w1").await.unwrap().unwrap();
        assert_eq!(w.execute_status, ExecuteStatus::Success);
        assert_eq!(w.execute_block_number, Some(33));
    }

    #[tokio::test]
    async fn revert_receipt_is_verify_failed() {
        let store = Arc::new(InMemoryStore::new());
        seed_submitted_withdraw(store.as_ref(), "w1").await;
        let probe = probe_with(
            store.clone(),
            vec![Some(TxReceipt {
                tx_hash: B256::ZERO,
                block_number: 34,
                success: false,
            })],
        );
        assert!(probe.probe(&execute_task("w1")).await.unwrap());
        let w = store.get_withdraw_request("w1").await.unwrap().unwrap();
        assert_eq!(w.execute_status, ExecuteStatus::VerifyFailed);
        assert_eq!(w.status, MainStatus::FailedPermanent);
    }

    #[tokio::test]
    async fn exhausted_task_fails_without_touching_the_entity() {
        let store = Arc::new(InMemoryStore::new());
        seed_submitted_withdraw(store.as_ref(), "w1").await;
        let probe = probe_with(store.clone(), vec![]);
        let service = PollingService::new(store.clone(), Arc::new(probe));

        let mut task = execute_task("w1");
        task.retry_count = task.max_retries;
        store.create_polling_task(task.clone()).await.unwrap();
        store.claim_polling_task(&task.id, now_epoch()).await.unwrap();
        service.handle(task.clone()).await;

        let stored = store.get_polling_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PollStatus::Failed);
        let w = store.get_withdraw_request("w1").await.unwrap().unwrap();
        assert_eq!(w.execute_status, ExecuteStatus::Submitted);
    }

    #[tokio::test]
    async fn recovery_requeues_with_one_poll_delay() {
        let store = Arc::new(InMemoryStore::new());
        let probe = probe_with(store.clone(), vec![]);
        let service = PollingService::new(store.clone(), Arc::new(probe));

        // Stuck running task without a start stamp.
        let mut stuck = execute_task("w1");
        stuck.id = "stuck".into();
        stuck.status = PollStatus::Running;
        store.create_polling_task(stuck).await.unwrap();

        // Failed task with remaining budget.
        let mut failed = execute_task("w2");
        failed.id = "failed".into();
        failed.status = PollStatus::Failed;
        failed.retry_count = 3;
        store.create_polling_task(failed).await.unwrap();

        service.recover().await.unwrap();

        // The stuck one is failed first, then requeued by the second pass.
        let stuck = store.get_polling_task("stuck").await.unwrap().unwrap();
        assert_eq!(stuck.status, PollStatus::Pending);
        let failed = store.get_polling_task("failed").await.unwrap().unwrap();
        assert_eq!(failed.status, PollStatus::Pending);
        assert!(failed.next_poll_at > now_epoch());
    }

    #[tokio::test]
    async fn commitment_confirmation_advances_the_checkbook() {
        let store = Arc::new(InMemoryStore::new());
        let owner =
            UniversalAddress::parse(714, "0x00000000000000000000000000000000000000aa").unwrap();
        let id = CheckbookId::new(714, 3);
        store
            .create_checkbook(Checkbook::new(id, owner, Amount::from_u64(5)))
            .await
            .unwrap();
        for status in [
            CheckbookStatus::Unsigned,
            CheckbookStatus::ReadyForCommitment,
            CheckbookStatus::GeneratingProof,
            CheckbookStatus::SubmittingCommitment,
            CheckbookStatus::CommitmentPending,
        ] {
            store.advance_checkbook(id, status).await.unwrap();
        }

        let probe = probe_with(
            store.clone(),
            vec![Some(TxReceipt {
                tx_hash: B256::ZERO,
                block_number: 50,
                success: true,
            })],
        );
        let task = PollingTask::new(
            "poll-cb".into(),
            PollEntity::Checkbook { id },
            PollTaskType::CommitmentConfirmation,
            B256::repeat_byte(0x66),
            714,
        );
        assert!(probe.probe(&task).await.unwrap());
        let cb = store.get_checkbook(id).await.unwrap().unwrap();
        assert_eq!(cb.status, CheckbookStatus::WithCheckbook);
    }
}
