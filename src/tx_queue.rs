//! Per-signer FIFO transaction queue.
//!
//! Submissions are serialised per `(signer, chain)`: a per-key mutex with
//! double-checked creation guarantees at most one transaction for the
//! pair is in flight, which is the nonce-serialisation boundary. Items
//! carry their own retry budget; insufficient-balance failures write a
//! `FailedTransaction` audit record without consuming it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chain_client::{ChainProvider, ChainRpc};
use crate::config::{Config, GasPrice};
use crate::entities::*;
use crate::error::{is_verify_failure_message, RpcError, StoreError};
use crate::public_values::{encode_execute_commitment, encode_execute_withdraw};
use crate::store::*;
use crate::tx_builder::{resolve_gas_price, verify_sender, LegacyTx, TxSigner};

/// Dispatcher tick.
const DISPATCH_INTERVAL: Duration = Duration::from_secs(2);

fn backoff_delay_secs(retry_count: u32) -> u64 {
    (10u64.saturating_mul(1u64 << retry_count.min(16))).min(600)
}

/// The surface other components use to hand work to the queue.
pub trait TxSubmitter: Send + Sync + 'static {
    /// Files a transaction for the chain's configured signer and returns
    /// the queue item id.
    fn enqueue(
        &self,
        chain_id: u32,
        payload: TxPayload,
    ) -> impl Future<Output = Result<String, StoreError>> + Send;
}

/// Per-chain submission settings resolved from config at startup.
#[derive(Clone)]
struct ChainSubmission<S> {
    signer: Arc<S>,
    contract: Address,
    gas_price: GasPrice,
    gas_limit: u64,
    evm_chain_id: u64,
}

pub struct TxQueue<Pr: ChainProvider, S: TxSigner> {
    store: Arc<InMemoryStore>,
    provider: Arc<Pr>,
    chains: HashMap<u32, ChainSubmission<S>>,
    locks: DashMap<(Address, u32), Arc<Mutex<()>>>,
    probe_delays_secs: Vec<u64>,
}

impl<Pr: ChainProvider, S: TxSigner> TxQueue<Pr, S> {
    pub fn new(store: Arc<InMemoryStore>, provider: Arc<Pr>, config: &Config) -> Self {
        Self {
            store,
            provider,
            chains: HashMap::new(),
            locks: DashMap::new(),
            probe_delays_secs: config.probe_delays_secs.clone(),
        }
    }

    /// Registers the signer and submission settings for one chain.
    pub fn register_chain(
        &mut self,
        chain_id: u32,
        evm_chain_id: u64,
        signer: Arc<S>,
        contract: Address,
        gas_price: GasPrice,
        gas_limit: u64,
    ) {
        self.chains.insert(
            chain_id,
            ChainSubmission {
                signer,
                contract,
                gas_price,
                gas_limit,
                evm_chain_id,
            },
        );
    }

    /// Per-key mutex with double-checked creation.
    fn key_lock(&self, signer: Address, chain_id: u32) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(&(signer, chain_id)) {
            return Arc::clone(lock.value());
        }
        Arc::clone(
            self.locks
                .entry((signer, chain_id))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Dispatcher: scans for due work and drives each signer queue.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("tx queue dispatcher started");
        let mut tick = tokio::time::interval(DISPATCH_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    if let Err(e) = Arc::clone(&self).dispatch_once().await {
                        error!(error = %e, "tx queue dispatch failed");
                    }
                }
            }
        }
        info!("tx queue dispatcher stopped");
    }

    async fn dispatch_once(self: Arc<Self>) -> Result<(), StoreError> {
        let pending = self
            .store
            .list_pending_txs_in(&[PendingTxStatus::Pending])
            .await?;
        let now = now_epoch();
        let mut keys: Vec<(Address, u32)> = pending
            .iter()
            .filter(|tx| tx.next_retry_at.map_or(true, |at| at <= now))
            .map(|tx| (tx.signer, tx.chain_id))
            .collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            let queue = Arc::clone(&self);
            tokio::spawn(async move {
                queue.drain_key(key.0, key.1).await;
            });
        }
        Ok(())
    }

    /// Serially submits every due item of one `(signer, chain)` pair, in
    /// enqueue order. Skips silently when the pair is already being
    /// drained.
    async fn drain_key(&self, signer: Address, chain_id: u32) {
        let lock = self.key_lock(signer, chain_id);
        let Ok(_guard) = lock.try_lock() else {
            return;
        };

        loop {
            let queue = match self.store.signer_queue(signer, chain_id).await {
                Ok(q) => q,
                Err(e) => {
                    error!(error = %e, "signer queue read failed");
                    return;
                }
            };
            let now = now_epoch();
            let Some(item) = queue
                .into_iter()
                .find(|tx| tx.next_retry_at.map_or(true, |at| at <= now))
            else {
                return;
            };
            let id = item.id.clone();
            if let Err(e) = self.submit_one(item).await {
                warn!(tx = %id, error = %e, "submission attempt failed");
            }
        }
    }

    async fn submit_one(&self, item: PendingTransaction) -> Result<(), StoreError> {
        let Some(settings) = self.chains.get(&item.chain_id) else {
            let reason = "no signer configured for chain";
            self.audit_failure(&item, reason).await?;
            self.store.fail_pending_tx(&item.id, reason.into()).await?;
            self.apply_submission_failure(&item, reason, false).await?;
            return Ok(());
        };
        let Some(client) = self.provider.client_for(item.chain_id) else {
            self.retry_later(&item, RpcError::UnknownChain(item.chain_id).to_string())
                .await?;
            return Ok(());
        };

        self.store
            .set_pending_tx_status(&item.id, PendingTxStatus::Processing)
            .await?;

        // Gas and nonce.
        let gas_price = match resolve_gas_price(client.as_ref(), settings.gas_price).await {
            Ok(p) => p,
            Err(e) => return self.retry_later(&item, e.to_string()).await,
        };
        let gas_limit = settings.gas_limit;

        // Balance precheck: an underfunded signer is an operational
        // problem, not a retryable transient, and burns no retry budget.
        match client.balance_at(settings.signer.address()).await {
            Ok(balance) => {
                let needed = U256::from(gas_price).saturating_mul(U256::from(gas_limit));
                if balance < needed {
                    let reason = format!(
                        "insufficient balance: have {balance}, need {needed} for gas"
                    );
                    self.audit_failure(&item, &reason).await?;
                    self.store.fail_pending_tx(&item.id, reason.clone()).await?;
                    self.apply_submission_failure(&item, &reason, false).await?;
                    return Ok(());
                }
            }
            Err(e) => return self.retry_later(&item, e.to_string()).await,
        }

        let nonce = match client.pending_nonce_at(settings.signer.address()).await {
            Ok(n) => n,
            Err(e) => return self.retry_later(&item, e.to_string()).await,
        };

        let data = match &item.payload {
            TxPayload::Commitment {
                proof,
                public_values,
                ..
            } => encode_execute_commitment(proof, public_values),
            TxPayload::Withdraw {
                proof,
                public_values,
                ..
            } => encode_execute_withdraw(proof, public_values),
        };

        let tx = LegacyTx {
            nonce,
            gas_price,
            gas_limit,
            to: settings.contract,
            value: U256::ZERO,
            data,
            chain_id: settings.evm_chain_id,
        };
        let sighash = tx.signing_hash();
        let sig = match settings.signer.sign_hash(sighash).await {
            Ok(sig) => sig,
            Err(e) => return self.retry_later(&item, e.to_string()).await,
        };
        if let Err(e) = verify_sender(sighash, &sig, settings.signer.address()) {
            return self.retry_later(&item, e.to_string()).await;
        }
        let raw = tx.encode_signed(&sig);

        // The withdraw entity moves to `submitted` just before the wire
        // send, so a crash between send and the store write is resolved by
        // the poller rather than a duplicate submission.
        if let TxPayload::Withdraw {
            withdraw_request_id,
            ..
        } = &item.payload
        {
            self.store
                .set_execute_status(
                    withdraw_request_id,
                    ExecuteStatus::Submitted,
                    ExecuteContext {
                        chain_id: Some(item.chain_id),
                        ..Default::default()
                    },
                )
                .await?;
        }

        match client.send_raw_transaction(raw).await {
            Ok(tx_hash) => {
                info!(tx = %item.id, tx_hash = %tx_hash, nonce, "transaction submitted");
                self.store.set_pending_tx_submitted(&item.id, tx_hash).await?;
                self.after_submission(&item, tx_hash).await?;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                if is_verify_failure_message(&message) {
                    // Contract-level rejection: terminal for the item and
                    // the entity.
                    warn!(tx = %item.id, error = %message, "submission rejected by contract");
                    self.audit_failure(&item, &message).await?;
                    self.store.fail_pending_tx(&item.id, message.clone()).await?;
                    self.apply_submission_failure(&item, &message, true).await?;
                    Ok(())
                } else {
                    self.retry_later(&item, message).await
                }
            }
        }
    }

    /// Transient failure: backoff within the retry budget, exhaust into a
    /// failed item plus the entity's retryable failure state.
    async fn retry_later(&self, item: &PendingTransaction, error: String) -> Result<(), StoreError> {
        let next_retry = item.retry_count + 1;
        if next_retry > item.max_retries {
            warn!(tx = %item.id, error = %error, "retry budget exhausted");
            self.audit_failure(item, &error).await?;
            self.store.fail_pending_tx(&item.id, error.clone()).await?;
            self.apply_submission_failure(item, &error, false).await?;
            return Ok(());
        }
        let delay = backoff_delay_secs(item.retry_count);
        debug!(tx = %item.id, retry = next_retry, delay_secs = delay, error = %error, "submission rescheduled");
        self.store
            .set_pending_tx_retry(&item.id, next_retry, now_epoch() + delay, error)
            .await
    }

    /// Writes the matching terminal state onto the owning entity.
    /// `verify_failure` distinguishes contract rejections from I/O
    /// exhaustion.
    async fn apply_submission_failure(
        &self,
        item: &PendingTransaction,
        error: &str,
        verify_failure: bool,
    ) -> Result<(), StoreError> {
        match &item.payload {
            TxPayload::Commitment { checkbook_id, .. } => {
                self.store
                    .fail_checkbook(
                        *checkbook_id,
                        CheckbookStatus::SubmissionFailed,
                        error.to_string(),
                    )
                    .await?;
            }
            TxPayload::Withdraw {
                withdraw_request_id,
                ..
            } => {
                let status = if verify_failure {
                    ExecuteStatus::VerifyFailed
                } else {
                    ExecuteStatus::SubmitFailed
                };
                self.store
                    .set_execute_status(withdraw_request_id, status, ExecuteContext::default())
                    .await?;
                self.store
                    .set_withdraw_last_error(withdraw_request_id, error.to_string())
                    .await?;
                self.store.recompute_main_status(withdraw_request_id).await?;
            }
        }
        Ok(())
    }

    async fn audit_failure(&self, item: &PendingTransaction, reason: &str) -> Result<(), StoreError> {
        self.store
            .create_failed_tx(FailedTransaction::new(
                Uuid::new_v4().to_string(),
                item.id.clone(),
                item.signer,
                item.chain_id,
                reason.to_string(),
            ))
            .await
    }

    /// Post-submission follow-ups: entity advancement, the accelerated
    /// receipt probe for withdrawals, and the polling-task handoff.
    async fn after_submission(
        &self,
        item: &PendingTransaction,
        tx_hash: B256,
    ) -> Result<(), StoreError> {
        match &item.payload {
            TxPayload::Commitment { checkbook_id, .. } => {
                self.store
                    .advance_checkbook(*checkbook_id, CheckbookStatus::CommitmentPending)
                    .await?;
                self.create_poll_task(
                    item,
                    tx_hash,
                    PollTaskType::CommitmentConfirmation,
                    PollEntity::Checkbook { id: *checkbook_id },
                )
                .await?;
            }
            TxPayload::Withdraw {
                withdraw_request_id,
                ..
            } => {
                let Some(client) = self.provider.client_for(item.chain_id) else {
                    return Ok(());
                };
                let probed = self
                    .accelerated_probe(client.as_ref(), withdraw_request_id, tx_hash, item.chain_id)
                    .await?;
                if !probed {
                    self.create_poll_task(
                        item,
                        tx_hash,
                        PollTaskType::WithdrawExecute,
                        PollEntity::WithdrawRequest {
                            id: withdraw_request_id.clone(),
                        },
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn create_poll_task(
        &self,
        item: &PendingTransaction,
        tx_hash: B256,
        task_type: PollTaskType,
        entity: PollEntity,
    ) -> Result<(), StoreError> {
        let task = PollingTask::new(
            format!("poll-{}", item.id),
            entity,
            task_type,
            tx_hash,
            item.chain_id,
        );
        match self.store.create_polling_task(task).await {
            Ok(()) | Err(StoreError::Duplicate { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Fast receipt probe masking quick-chain confirmation latency.
    /// Returns `true` when a receipt settled the request either way.
    async fn accelerated_probe<R: ChainRpc>(
        &self,
        client: &R,
        request_id: &str,
        tx_hash: B256,
        chain_id: u32,
    ) -> Result<bool, StoreError> {
        for delay in &self.probe_delays_secs {
            tokio::time::sleep(Duration::from_secs(*delay)).await;
            match client.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
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
                                chain_id: Some(chain_id),
                                tx_hash: Some(tx_hash),
                                block_number: Some(receipt.block_number),
                            },
                        )
                        .await?;
                    if wrote {
                        self.store.recompute_main_status(request_id).await?;
                        info!(request = %request_id, success = receipt.success, "accelerated probe settled execute");
                    }
                    return Ok(true);
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(request = %request_id, error = %e, "accelerated probe fetch failed");
                    continue;
                }
            }
        }
        Ok(false)
    }

    /// Startup recovery: re-polls submitted items, audits processing ones
    /// (a set tx hash means it went out), and leaves pending ones for the
    /// dispatcher.
    pub async fn recover(&self) -> Result<(), StoreError> {
        let stuck = self
            .store
            .list_pending_txs_in(&[PendingTxStatus::Processing, PendingTxStatus::Submitted])
            .await?;
        for item in stuck {
            match (item.status, item.tx_hash) {
                (PendingTxStatus::Submitted, Some(tx_hash)) => {
                    self.recover_poll(&item, tx_hash).await?;
                }
                (PendingTxStatus::Processing, Some(tx_hash)) => {
                    info!(tx = %item.id, "processing item has a tx hash, promoting to submitted");
                    self.store.set_pending_tx_submitted(&item.id, tx_hash).await?;
                    self.recover_poll(&item, tx_hash).await?;
                }
                (PendingTxStatus::Processing, None) => {
                    info!(tx = %item.id, "resetting interrupted submission");
                    self.store
                        .set_pending_tx_status(&item.id, PendingTxStatus::Pending)
                        .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Re-files a stuck submission from its audit record. The commitment
    /// payload is rebuilt from the checkbook so later artifacts are picked
    /// up; an unparseable token key fails the retry rather than silently
    /// mis-tokenising.
    pub async fn retry_failed_transaction(&self, failed_tx_id: &str) -> Result<String, StoreError> {
        let record = self
            .store
            .list_failed_txs()
            .await?
            .into_iter()
            .find(|r| r.id == failed_tx_id)
            .ok_or_else(|| StoreError::not_found("failed_tx", failed_tx_id))?;
        if matches!(record.status, FailedTxStatus::Recovered | FailedTxStatus::Abandoned) {
            return Err(StoreError::stale(
                "failed_tx",
                failed_tx_id,
                "already resolved",
            ));
        }
        let original = self
            .store
            .get_pending_tx(&record.pending_tx_id)
            .await?
            .ok_or_else(|| StoreError::not_found("pending_tx", &record.pending_tx_id))?;

        self.store
            .set_failed_tx_status(failed_tx_id, FailedTxStatus::Retrying)
            .await?;

        let payload = match original.payload {
            TxPayload::Commitment { checkbook_id, .. } => {
                let checkbook = self
                    .store
                    .get_checkbook(checkbook_id)
                    .await?
                    .ok_or_else(|| {
                        StoreError::not_found("checkbook", checkbook_id.to_string())
                    })?;
                let token_key = checkbook.token_key.clone();
                if token_key.is_empty() || token_key.starts_with("0x") {
                    self.store
                        .set_failed_tx_status(failed_tx_id, FailedTxStatus::Pending)
                        .await?;
                    return Err(StoreError::stale(
                        "failed_tx",
                        failed_tx_id,
                        format!("unresolvable token key '{token_key}'"),
                    ));
                }
                let (commitment, proof, public_values) = match (
                    checkbook.commitment,
                    checkbook.proof,
                    checkbook.public_values,
                ) {
                    (Some(c), Some(p), Some(v)) => (c, p, v),
                    _ => {
                        self.store
                            .set_failed_tx_status(failed_tx_id, FailedTxStatus::Pending)
                            .await?;
                        return Err(StoreError::stale(
                            "failed_tx",
                            failed_tx_id,
                            "checkbook proof artifacts missing",
                        ));
                    }
                };
                TxPayload::Commitment {
                    checkbook_id,
                    token_key,
                    allocatable_amount: checkbook.allocatable_amount,
                    commitment,
                    proof,
                    public_values,
                }
            }
            payload @ TxPayload::Withdraw { .. } => payload,
        };

        let new_id = self.enqueue(original.chain_id, payload).await?;
        self.store
            .set_failed_tx_status(failed_tx_id, FailedTxStatus::Recovered)
            .await?;
        info!(failed_tx = %failed_tx_id, new_tx = %new_id, "failed transaction re-filed");
        Ok(new_id)
    }

    async fn recover_poll(&self, item: &PendingTransaction, tx_hash: B256) -> Result<(), StoreError> {
        let (task_type, entity) = match &item.payload {
            TxPayload::Commitment { checkbook_id, .. } => (
                PollTaskType::CommitmentConfirmation,
                PollEntity::Checkbook { id: *checkbook_id },
            ),
            TxPayload::Withdraw {
                withdraw_request_id,
                ..
            } => (
                PollTaskType::WithdrawExecute,
                PollEntity::WithdrawRequest {
                    id: withdraw_request_id.clone(),
                },
            ),
        };
        self.create_poll_task(item, tx_hash, task_type, entity).await
    }
}

impl<Pr: ChainProvider, S: TxSigner> TxSubmitter for TxQueue<Pr, S> {
    async fn enqueue(&self, chain_id: u32, payload: TxPayload) -> Result<String, StoreError> {
        let Some(settings) = self.chains.get(&chain_id) else {
            return Err(StoreError::not_found("chain signer", chain_id.to_string()));
        };
        let id = Uuid::new_v4().to_string();
        let tx = PendingTransaction::new(id.clone(), settings.signer.address(), chain_id, payload);
        self.store.create_pending_tx(tx).await?;
        debug!(tx = %id, chain_id, "transaction enqueued");
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_client::TxReceipt;
    use crate::error::RpcError;
    use crate::tx_builder::LocalKeySigner;
    use crate::types::Amount;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MockRpc {
        nonce: AtomicU64,
        balance: StdMutex<U256>,
        send_results: StdMutex<Vec<Result<B256, RpcError>>>,
        receipts: StdMutex<Vec<Option<TxReceipt>>>,
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    impl MockRpc {
        fn new() -> Self {
            Self {
                nonce: AtomicU64::new(7),
                balance: StdMutex::new(U256::MAX),
                send_results: StdMutex::new(vec![]),
                receipts: StdMutex::new(vec![]),
                sent: StdMutex::new(vec![]),
            }
        }

        fn push_send(&self, result: Result<B256, RpcError>) {
            self.send_results.lock().unwrap().push(result);
        }

        fn push_receipt(&self, receipt: Option<TxReceipt>) {
            self.receipts.lock().unwrap().push(receipt);
        }
    }

    impl ChainRpc for MockRpc {
        async fn network_id(&self) -> Result<u64, RpcError> {
            Ok(56)
        }
        async fn block_number(&self) -> Result<u64, RpcError> {
            Ok(1)
        }
        async fn balance_at(&self, _addr: Address) -> Result<U256, RpcError> {
            Ok(*self.balance.lock().unwrap())
        }
        async fn pending_nonce_at(&self, _addr: Address) -> Result<u64, RpcError> {
            Ok(self.nonce.fetch_add(1, Ordering::SeqCst))
        }
        async fn suggest_gas_price(&self) -> Result<u128, RpcError> {
            Ok(1_000_000_000)
        }
        async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<B256, RpcError> {
            self.sent.lock().unwrap().push(raw);
            let mut results = self.send_results.lock().unwrap();
            if results.is_empty() {
                Ok(B256::repeat_byte(0x99))
            } else {
                results.remove(0)
            }
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

    struct MockProvider {
        rpc: Arc<MockRpc>,
    }

    impl ChainProvider for MockProvider {
        type Rpc = MockRpc;
        fn client_for(&self, _chain_id: u32) -> Option<Arc<MockRpc>> {
            Some(Arc::clone(&self.rpc))
        }
    }

    fn test_config() -> Config {
        Config {
            host: "0.0.0.0".into(),
            port: 0,
            prover_url: "http://localhost:1".into(),
            scanner_url: "http://localhost:2".into(),
            management_chain_id: 714,
            zkpay_proxy_override: None,
            networks: vec![],
            token_decimals: vec![],
            known_tokens: vec![],
            allocations_per_checkbook: 4,
            // No sleeping in tests.
            probe_delays_secs: vec![0],
        }
    }

    fn queue_with(
        store: Arc<InMemoryStore>,
        rpc: Arc<MockRpc>,
    ) -> TxQueue<MockProvider, LocalKeySigner> {
        let signer = Arc::new(
            LocalKeySigner::from_hex(
                "0x4646464646464646464646464646464646464646464646464646464646464646",
            )
            .unwrap(),
        );
        let mut queue = TxQueue::new(store, Arc::new(MockProvider { rpc }), &test_config());
        queue.register_chain(
            714,
            56,
            signer,
            Address::repeat_byte(0x22),
            GasPrice::Fixed(1_000_000_000),
            500_000,
        );
        queue
    }

    async fn seed_withdraw(store: &InMemoryStore, id: &str) {
        let owner =
            UniversalAddress::parse(714, "0x00000000000000000000000000000000000000aa").unwrap();
        store
            .create_withdraw_request(WithdrawRequest::new(
                id.into(),
                owner,
                vec![],
                crate::types::Intent::RawToken {
                    beneficiary: owner,
                    token_symbol: "USDT".into(),
                },
                owner,
                Amount::from_u64(100),
                B256::repeat_byte(0x42),
            ))
            .await
            .unwrap();
        store
            .set_proof_status(id, ProofStatus::Completed)
            .await
            .unwrap();
    }

    fn withdraw_payload(id: &str) -> TxPayload {
        TxPayload::Withdraw {
            withdraw_request_id: id.into(),
            token_key: "USDT".into(),
            recipient: B256::repeat_byte(0xbb),
            amount: Amount::from_u64(100),
            queue_root: B256::repeat_byte(0x10),
            proof: vec![1, 2],
            public_values: vec![3, 4],
        }
    }

    use crate::types::UniversalAddress;

    #[tokio::test]
    async fn successful_withdraw_submission_settles_via_probe() {
        let store = Arc::new(InMemoryStore::new());
        let rpc = Arc::new(MockRpc::new());
        rpc.push_receipt(Some(TxReceipt {
            tx_hash: B256::ZERO,
            block_number: 12,
            success: true,
        }));
        let queue = queue_with(store.clone(), rpc.clone());

        seed_withdraw(store.as_ref(), "w1").await;
        let id = queue.enqueue(714, withdraw_payload("w1")).await.unwrap();
        queue.drain_key(queue.chains[&714].signer.address(), 714).await;

        let item = store.get_pending_tx(&id).await.unwrap().unwrap();
        assert_eq!(item.status, PendingTxStatus::Submitted);
        assert!(item.tx_hash.is_some());

        let w = store.get_withdraw_request("w1").await.unwrap().unwrap();
        assert_eq!(w.execute_status, ExecuteStatus::Success);
        assert_eq!(w.execute_block_number, Some(12));
        // Probe settled it, so no polling task was filed.
        assert!(store
            .list_polling_tasks_in(&[PollStatus::Pending])
            .await
            .unwrap()
            .is_empty());
        // One raw transaction actually hit the wire.
        assert_eq!(rpc.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn probe_miss_files_polling_task() {
        let store = Arc::new(InMemoryStore::new());
        let rpc = Arc::new(MockRpc::new());
        let queue = queue_with(store.clone(), rpc.clone());

        seed_withdraw(store.as_ref(), "w1").await;
        queue.enqueue(714, withdraw_payload("w1")).await.unwrap();
        queue.drain_key(queue.chains[&714].signer.address(), 714).await;

        let w = store.get_withdraw_request("w1").await.unwrap().unwrap();
        assert_eq!(w.execute_status, ExecuteStatus::Submitted);
        let polls = store
            .list_polling_tasks_in(&[PollStatus::Pending])
            .await
            .unwrap();
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].task_type, PollTaskType::WithdrawExecute);
    }

    #[tokio::test]
    async fn contract_revert_is_terminal_verify_failure() {
        let store = Arc::new(InMemoryStore::new());
        let rpc = Arc::new(MockRpc::new());
        rpc.push_send(Err(RpcError::Rpc {
            code: 3,
            message: "execution reverted: invalid proof".into(),
        }));
        let queue = queue_with(store.clone(), rpc.clone());

        seed_withdraw(store.as_ref(), "w1").await;
        let id = queue.enqueue(714, withdraw_payload("w1")).await.unwrap();
        queue.drain_key(queue.chains[&714].signer.address(), 714).await;

        let item = store.get_pending_tx(&id).await.unwrap().unwrap();
        assert_eq!(item.status, PendingTxStatus::Failed);
        let w = store.get_withdraw_request("w1").await.unwrap().unwrap();
        assert_eq!(w.execute_status, ExecuteStatus::VerifyFailed);
        assert_eq!(w.status, MainStatus::FailedPermanent);
        // No retry was scheduled and the audit trail has the record.
        assert_eq!(store.list_failed_txs().await.unwrap().len(), 1);
        assert_eq!(rpc.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_error_backs_off_then_exhausts() {
        let store = Arc::new(InMemoryStore::new());
        let rpc = Arc::new(MockRpc::new());
        rpc.push_send(Err(RpcError::Transport("connection reset".into())));
        let queue = queue_with(store.clone(), rpc.clone());

        seed_withdraw(store.as_ref(), "w1").await;
        let id = queue.enqueue(714, withdraw_payload("w1")).await.unwrap();
        queue.drain_key(queue.chains[&714].signer.address(), 714).await;

        let item = store.get_pending_tx(&id).await.unwrap().unwrap();
        assert_eq!(item.status, PendingTxStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert!(item.next_retry_at.unwrap() > now_epoch());

        // Entity reflects a retryable submit failure only after the budget
        // is gone.
        let w = store.get_withdraw_request("w1").await.unwrap().unwrap();
        assert_eq!(w.execute_status, ExecuteStatus::Submitted);

        // Exhaust the remaining budget.
        for _ in 0..3 {
            store
                .set_pending_tx_retry(
                    &id,
                    store.get_pending_tx(&id).await.unwrap().unwrap().retry_count,
                    0,
                    "manual".into(),
                )
                .await
                .unwrap();
            rpc.push_send(Err(RpcError::Transport("connection reset".into())));
            queue.drain_key(queue.chains[&714].signer.address(), 714).await;
        }
        let item = store.get_pending_tx(&id).await.unwrap().unwrap();
        assert_eq!(item.status, PendingTxStatus::Failed);
        let w = store.get_withdraw_request("w1").await.unwrap().unwrap();
        assert_eq!(w.execute_status, ExecuteStatus::SubmitFailed);
        assert_eq!(w.status, MainStatus::FailedRetryable);
    }

    #[tokio::test]
    async fn insufficient_balance_audits_without_burning_budget() {
        let store = Arc::new(InMemoryStore::new());
        let rpc = Arc::new(MockRpc::new());
        *rpc.balance.lock().unwrap() = U256::from(1u64);
        let queue = queue_with(store.clone(), rpc.clone());

        seed_withdraw(store.as_ref(), "w1").await;
        let id = queue.enqueue(714, withdraw_payload("w1")).await.unwrap();
        queue.drain_key(queue.chains[&714].signer.address(), 714).await;

        let item = store.get_pending_tx(&id).await.unwrap().unwrap();
        assert_eq!(item.status, PendingTxStatus::Failed);
        assert_eq!(item.retry_count, 0);
        let audits = store.list_failed_txs().await.unwrap();
        assert_eq!(audits.len(), 1);
        assert!(audits[0].reason.contains("insufficient balance"));
        // Nothing touched the wire.
        assert!(rpc.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn commitment_submission_advances_checkbook() {
        let store = Arc::new(InMemoryStore::new());
        let rpc = Arc::new(MockRpc::new());
        let queue = queue_with(store.clone(), rpc.clone());

        let owner =
            UniversalAddress::parse(714, "0x00000000000000000000000000000000000000aa").unwrap();
        let cb_id = CheckbookId::new(714, 5);
        store
            .create_checkbook(Checkbook::new(cb_id, owner, Amount::from_u64(100)))
            .await
            .unwrap();
        for status in [
            CheckbookStatus::Unsigned,
            CheckbookStatus::ReadyForCommitment,
            CheckbookStatus::GeneratingProof,
            CheckbookStatus::SubmittingCommitment,
        ] {
            store.advance_checkbook(cb_id, status).await.unwrap();
        }

        queue
            .enqueue(
                714,
                TxPayload::Commitment {
                    checkbook_id: cb_id,
                    token_key: "USDT".into(),
                    allocatable_amount: Amount::from_u64(100),
                    commitment: B256::repeat_byte(0xc1),
                    proof: vec![1],
                    public_values: vec![2],
                },
            )
            .await
            .unwrap();
        queue.drain_key(queue.chains[&714].signer.address(), 714).await;

        let cb = store.get_checkbook(cb_id).await.unwrap().unwrap();
        assert_eq!(cb.status, CheckbookStatus::CommitmentPending);
        let polls = store
            .list_polling_tasks_in(&[PollStatus::Pending])
            .await
            .unwrap();
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].task_type, PollTaskType::CommitmentConfirmation);
    }

    #[tokio::test]
    async fn recovery_promotes_and_resets() {
        let store = Arc::new(InMemoryStore::new());
        let rpc = Arc::new(MockRpc::new());
        let queue = queue_with(store.clone(), rpc.clone());
        seed_withdraw(store.as_ref(), "w1").await;

        // A processing item that made it to the wire before the crash.
        let id1 = queue.enqueue(714, withdraw_payload("w1")).await.unwrap();
        store
            .set_pending_tx_status(&id1, PendingTxStatus::Processing)
            .await
            .unwrap();
        {
            // Simulate: hash recorded but status still processing.
            store
                .set_pending_tx_submitted(&id1, B256::repeat_byte(0x77))
                .await
                .unwrap();
            store
                .set_pending_tx_status(&id1, PendingTxStatus::Processing)
                .await
                .unwrap();
        }

        // A processing item that never went out.
        let id2 = queue.enqueue(714, withdraw_payload("w1")).await.unwrap();
        store
            .set_pending_tx_status(&id2, PendingTxStatus::Processing)
            .await
            .unwrap();

        queue.recover().await.unwrap();

        let item1 = store.get_pending_tx(&id1).await.unwrap().unwrap();
        assert_eq!(item1.status, PendingTxStatus::Submitted);
        let item2 = store.get_pending_tx(&id2).await.unwrap().unwrap();
        assert_eq!(item2.status, PendingTxStatus::Pending);
        // The recovered submission is being re-polled.
        assert_eq!(
            store
                .list_polling_tasks_in(&[PollStatus::Pending])
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_commitment_retry_refuses_unresolved_token_key() {
        let store = Arc::new(InMemoryStore::new());
        let rpc = Arc::new(MockRpc::new());
        let queue = queue_with(store.clone(), rpc.clone());

        let owner =
            UniversalAddress::parse(714, "0x00000000000000000000000000000000000000aa").unwrap();
        let cb_id = CheckbookId::new(714, 8);
        let mut cb = Checkbook::new(cb_id, owner, Amount::from_u64(100));
        // Token key never resolved from its indexed hash.
        cb.token_key = "0xdeadbeef".into();
        store.create_checkbook(cb).await.unwrap();
        store
            .set_checkbook_proof(cb_id, B256::repeat_byte(0xc1), vec![1], vec![2])
            .await
            .unwrap();

        let pending_id = queue
            .enqueue(
                714,
                TxPayload::Commitment {
                    checkbook_id: cb_id,
                    token_key: "0xdeadbeef".into(),
                    allocatable_amount: Amount::from_u64(100),
                    commitment: B256::repeat_byte(0xc1),
                    proof: vec![1],
                    public_values: vec![2],
                },
            )
            .await
            .unwrap();
        let record = FailedTransaction::new(
            "ft1".into(),
            pending_id,
            Address::repeat_byte(0x01),
            714,
            "exhausted".into(),
        );
        store.create_failed_tx(record).await.unwrap();

        let err = queue.retry_failed_transaction("ft1").await.unwrap_err();
        assert!(err.is_stale());
        // The record stays open for manual resolution.
        let records = store.list_failed_txs().await.unwrap();
        assert_eq!(records[0].status, FailedTxStatus::Pending);

        // With a resolved token key the retry re-files the submission.
        store
            .apply_deposit_recorded(
                cb_id,
                DepositRecordedUpdate {
                    token_key: "USDT".into(),
                    gross_amount: Amount::from_u64(100),
                    allocatable_amount: Amount::from_u64(100),
                    fee_total_locked: Amount::ZERO,
                    owner,
                },
            )
            .await
            .unwrap();
        let new_id = queue.retry_failed_transaction("ft1").await.unwrap();
        assert!(store.get_pending_tx(&new_id).await.unwrap().is_some());
        let records = store.list_failed_txs().await.unwrap();
        assert_eq!(records[0].status, FailedTxStatus::Recovered);
    }

    #[test]
    fn backoff_schedule_caps_at_ten_minutes() {
        assert_eq!(backoff_delay_secs(0), 10);
        assert_eq!(backoff_delay_secs(1), 20);
        assert_eq!(backoff_delay_secs(2), 40);
        assert_eq!(backoff_delay_secs(6), 600);
        assert_eq!(backoff_delay_secs(30), 600);
    }
}
