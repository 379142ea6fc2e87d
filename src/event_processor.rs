//! Event ingestion and state reconciliation.
//!
//! Consumes the typed event stream and applies each envelope idempotently
//! to checkbooks, allocations, withdraw requests and queue roots. Replayed
//! envelopes (same chain id, tx hash, log index) are absorbed with nothing
//! but a timestamp refresh. Status promotions go through the monotone
//! predicates; the derived main status is recomputed after every write.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::B256;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::entities::*;
use crate::error::{QueueRootError, StoreError, TypeError};
use crate::events::{EventData, EventEnvelope};
use crate::notifier::{ChangeMessage, ChangeNotifier, SubscriptionKey};
use crate::queue_root::QueueRootManager;
use crate::scanner_client::RootScanner;
use crate::store::*;
use crate::types::{token_key_hash, Amount, DecimalConverter, UniversalAddress};

#[derive(Debug, Error)]
pub enum EventError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    QueueRoot(#[from] QueueRootError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error("no withdraw request matches nullifier {0}")]
    UnknownNullifier(B256),
    #[error("checkbook {0} not found")]
    UnknownCheckbook(CheckbookId),
}

pub struct EventProcessor<C: RootScanner> {
    store: Arc<InMemoryStore>,
    queue_roots: Arc<QueueRootManager<InMemoryStore, C>>,
    notifier: Arc<ChangeNotifier>,
    converter: DecimalConverter,
    /// Indexed-string hash → human symbol, for `DepositRecorded` token keys.
    token_table: HashMap<B256, String>,
    allocations_per_checkbook: u8,
}

impl<C: RootScanner> EventProcessor<C> {
    pub fn new(
        store: Arc<InMemoryStore>,
        queue_roots: Arc<QueueRootManager<InMemoryStore, C>>,
        notifier: Arc<ChangeNotifier>,
        converter: DecimalConverter,
        known_tokens: &[String],
        allocations_per_checkbook: u8,
    ) -> Self {
        let token_table = known_tokens
            .iter()
            .map(|symbol| (token_key_hash(symbol), symbol.clone()))
            .collect();
        Self {
            store,
            queue_roots,
            notifier,
            converter,
            token_table,
            allocations_per_checkbook,
        }
    }

    /// Sequential per-subject consumer loop.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<EventEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("event processor started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.process(envelope).await;
                }
            }
        }
        info!("event processor stopped");
    }

    pub async fn process(&self, envelope: EventEnvelope) {
        let key = envelope.key();
        match self.store.record_event(&key).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(key = %key, event = envelope.event_name(), "duplicate event absorbed");
                return;
            }
            Err(e) => {
                error!(key = %key, error = %e, "event ledger write failed");
                return;
            }
        }

        if let Err(e) = self.dispatch(&envelope).await {
            error!(
                key = %key,
                event = envelope.event_name(),
                error = %e,
                "event handler failed, releasing for redelivery"
            );
            let _ = self.store.forget_event(&key).await;
        }
    }

    async fn dispatch(&self, envelope: &EventEnvelope) -> Result<(), EventError> {
        match &envelope.data {
            EventData::DepositReceived {
                deposit_id,
                depositor,
                amount,
                token_id,
            } => {
                self.on_deposit_received(envelope, *deposit_id, depositor, *amount, *token_id)
                    .await
            }
            EventData::DepositRecorded {
                deposit_id,
                token_key_hash,
                gross_amount,
                fee_total_locked,
                allocatable_amount,
                owner,
                token_id,
            } => {
                self.on_deposit_recorded(
                    envelope,
                    *deposit_id,
                    *token_key_hash,
                    *gross_amount,
                    *fee_total_locked,
                    *allocatable_amount,
                    owner,
                    *token_id,
                )
                .await
            }
            EventData::DepositUsed {
                deposit_id,
                commitment,
            } => self.on_deposit_used(envelope, *deposit_id, *commitment).await,
            EventData::CommitmentRootUpdated {
                old_root,
                new_root,
                commitment,
            } => {
                self.on_commitment_root_updated(envelope, *old_root, *new_root, *commitment)
                    .await
            }
            EventData::WithdrawRequested { nullifier, .. } => {
                self.on_withdraw_requested(envelope, *nullifier).await
            }
            EventData::WithdrawExecuted {
                nullifier,
                request_id,
            }
            | EventData::IntentManagerWithdrawExecuted {
                nullifier,
                request_id,
            } => {
                self.on_withdraw_executed(envelope, *nullifier, request_id.as_deref())
                    .await
            }
            EventData::PayoutExecuted { nullifier } => {
                self.on_payout(*nullifier, PayoutStatus::Completed, None).await
            }
            EventData::PayoutFailed { nullifier, reason } => {
                self.on_payout(*nullifier, PayoutStatus::Failed, Some(reason.clone()))
                    .await
            }
            EventData::HookExecuted { nullifier } => {
                self.on_hook(*nullifier, HookStatus::Completed, None).await
            }
            EventData::HookFailed { nullifier, reason } => {
                self.on_hook(*nullifier, HookStatus::Failed, Some(reason.clone()))
                    .await
            }
            EventData::FallbackTransferred { nullifier } => {
                self.on_fallback_transferred(*nullifier).await
            }
            EventData::FallbackFailed { nullifier, reason } => {
                self.on_fallback_failed(*nullifier, reason.clone()).await
            }
            EventData::ManuallyResolved { nullifier } => {
                self.on_manually_resolved(*nullifier).await
            }
            EventData::PayoutRetryRecordCreated { nullifier }
            | EventData::FallbackRetryRecordCreated { nullifier } => {
                debug!(nullifier = %nullifier, event = envelope.event_name(), "retry record noted");
                Ok(())
            }
        }
    }

    // -- deposits -----------------------------------------------------------

    async fn on_deposit_received(
        &self,
        envelope: &EventEnvelope,
        deposit_id: u64,
        depositor: &str,
        raw_amount: Amount,
        token_id: Option<u16>,
    ) -> Result<(), EventError> {
        let id = CheckbookId::new(envelope.chain_id, deposit_id);
        let owner = UniversalAddress::parse(envelope.chain_id, depositor)?;
        let amount = self
            .converter
            .to_management(raw_amount, envelope.chain_id, token_id)?;

        let pre = self.store.get_checkbook(id).await?;
        if pre.is_none() {
            self.store
                .create_checkbook(Checkbook::new(id, owner, amount))
                .await?;
        }
        self.store.set_deposit_tx_hash(id, envelope.tx_hash).await?;
        self.store
            .advance_checkbook(id, CheckbookStatus::Unsigned)
            .await?;

        info!(checkbook = %id, amount = %amount, "deposit received");
        self.publish_checkbook(pre, id).await;
        self.notifier.publish(
            SubscriptionKey::DepositsByAddress(owner),
            ChangeMessage::DepositUpdate {
                owner,
                chain_id: envelope.chain_id,
                deposit_id,
                amount,
                used: false,
            },
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_deposit_recorded(
        &self,
        envelope: &EventEnvelope,
        deposit_id: u64,
        token_hash: B256,
        gross: Amount,
        fee: Amount,
        allocatable: Amount,
        owner: &str,
        token_id: Option<u16>,
    ) -> Result<(), EventError> {
        let id = CheckbookId::new(envelope.chain_id, deposit_id);
        let owner = UniversalAddress::parse(envelope.chain_id, owner)?;

        // Unresolvable hashes keep the raw hash string; resolution can be
        // retried once the token table learns the symbol.
        let token_key = self
            .token_table
            .get(&token_hash)
            .cloned()
            .unwrap_or_else(|| token_hash.to_string());

        let gross = self.converter.to_management(gross, envelope.chain_id, token_id)?;
        let fee = self.converter.to_management(fee, envelope.chain_id, token_id)?;
        let allocatable = self
            .converter
            .to_management(allocatable, envelope.chain_id, token_id)?;

        let pre = self.store.get_checkbook(id).await?;
        if pre.is_none() {
            // Recorded before Received: reconcile by creating the row.
            self.store
                .create_checkbook(Checkbook::new(id, owner, gross))
                .await?;
        }
        self.store
            .apply_deposit_recorded(
                id,
                DepositRecordedUpdate {
                    token_key: token_key.clone(),
                    gross_amount: gross,
                    allocatable_amount: allocatable,
                    fee_total_locked: fee,
                    owner,
                },
            )
            .await?;

        self.mint_allocations(id, allocatable).await?;
        self.store
            .advance_checkbook(id, CheckbookStatus::ReadyForCommitment)
            .await?;
        self.enqueue_checkbook_proof(id).await?;

        info!(checkbook = %id, token_key = %token_key, allocatable = %allocatable, "deposit recorded");
        self.publish_checkbook(pre, id).await;
        Ok(())
    }

    /// Mints the checkbook's allocation set once. Amounts are uniform with
    /// the division remainder on the last seq, so they always sum to the
    /// allocatable amount.
    async fn mint_allocations(&self, id: CheckbookId, allocatable: Amount) -> Result<(), EventError> {
        let existing = self.store.list_checkbook_allocations(id).await?;
        if !existing.is_empty() {
            return Ok(());
        }
        let count = self.allocations_per_checkbook as u64;
        let share = Amount(allocatable.0 / alloy_primitives::U256::from(count));
        let mut minted = Amount::ZERO;
        for seq in 0..self.allocations_per_checkbook {
            let amount = if seq == self.allocations_per_checkbook - 1 {
                Amount(allocatable.0 - minted.0)
            } else {
                share
            };
            minted = minted.checked_add(amount).ok_or(TypeError::AmountOverflow)?;
            self.store
                .create_allocation(Allocation::new(AllocationId::new(id, seq), amount))
                .await?;
        }
        debug!(checkbook = %id, count, "allocations minted");
        Ok(())
    }

    async fn enqueue_checkbook_proof(&self, id: CheckbookId) -> Result<(), EventError> {
        let task = ProofTask::new(
            format!("cbproof-{}-{}", id.chain_id, id.deposit_id),
            ProofTaskPayload::Checkbook { checkbook_id: id },
        );
        match self.store.create_proof_task(task).await {
            Ok(()) => Ok(()),
            Err(StoreError::Duplicate { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn on_deposit_used(
        &self,
        envelope: &EventEnvelope,
        deposit_id: u64,
        commitment: B256,
    ) -> Result<(), EventError> {
        let id = CheckbookId::new(envelope.chain_id, deposit_id);
        let pre = self.store.get_checkbook(id).await?;
        if pre.is_none() {
            return Err(EventError::UnknownCheckbook(id));
        }
        self.store.set_deposit_used(id).await?;
        self.store
            .advance_checkbook(id, CheckbookStatus::WithCheckbook)
            .await?;
        info!(checkbook = %id, commitment = %commitment, "deposit used");
        self.publish_checkbook(pre, id).await;
        Ok(())
    }

    // -- queue roots --------------------------------------------------------

    async fn on_commitment_root_updated(
        &self,
        envelope: &EventEnvelope,
        old_root: B256,
        new_root: B256,
        commitment: B256,
    ) -> Result<(), EventError> {
        let inserted = self
            .queue_roots
            .process_commitment_root_updated(
                envelope.chain_id,
                envelope.block_number,
                old_root,
                new_root,
                commitment,
            )
            .await?;

        // Every commitment that just entered the chain finalises its
        // checkbook.
        for c in inserted {
            if let Some(cb) = self.store.find_checkbook_by_commitment(c).await? {
                let pre = Some(cb.clone());
                self.store
                    .advance_checkbook(cb.id, CheckbookStatus::WithCheckbook)
                    .await?;
                self.publish_checkbook(pre, cb.id).await;
            }
        }
        Ok(())
    }

    // -- withdraw lifecycle -------------------------------------------------

    async fn on_withdraw_requested(
        &self,
        envelope: &EventEnvelope,
        nullifier: B256,
    ) -> Result<(), EventError> {
        let Some(pre) = self.store.find_withdraw_by_nullifier(nullifier).await? else {
            warn!(nullifier = %nullifier, "WithdrawRequested for unknown nullifier");
            return Err(EventError::UnknownNullifier(nullifier));
        };
        let id = pre.id.clone();

        self.store.set_proof_status(&id, ProofStatus::Completed).await?;
        self.store
            .set_execute_status(
                &id,
                ExecuteStatus::Success,
                ExecuteContext {
                    chain_id: Some(envelope.chain_id),
                    tx_hash: Some(envelope.tx_hash),
                    block_number: Some(envelope.block_number),
                },
            )
            .await?;
        if pre.payout_status != PayoutStatus::Completed {
            self.store.set_payout_status(&id, PayoutStatus::Pending).await?;
        }
        self.store.recompute_main_status(&id).await?;

        info!(request = %id, nullifier = %nullifier, "withdraw requested on chain");
        self.publish_withdraw(Some(pre), &id).await;
        Ok(())
    }

    /// Lookup chain: nullifier, then the deprecated request-id column, then
    /// any allocation carrying the nullifier.
    async fn locate_withdraw(
        &self,
        nullifier: B256,
        request_id: Option<&str>,
    ) -> Result<Option<WithdrawRequest>, EventError> {
        if let Some(w) = self.store.find_withdraw_by_nullifier(nullifier).await? {
            return Ok(Some(w));
        }
        if let Some(rid) = request_id {
            if let Some(w) = self.store.find_withdraw_by_request_id(rid).await? {
                return Ok(Some(w));
            }
        }
        if let Some(alloc) = self.store.find_allocation_by_nullifier(nullifier).await? {
            if let Some(wid) = alloc.withdraw_request_id {
                return Ok(self.store.get_withdraw_request(&wid).await?);
            }
        }
        Ok(None)
    }

    async fn on_withdraw_executed(
        &self,
        envelope: &EventEnvelope,
        nullifier: B256,
        request_id: Option<&str>,
    ) -> Result<(), EventError> {
        let Some(pre) = self.locate_withdraw(nullifier, request_id).await? else {
            warn!(nullifier = %nullifier, "WithdrawExecuted for unknown request");
            return Err(EventError::UnknownNullifier(nullifier));
        };
        let id = pre.id.clone();

        self.store
            .set_execute_status(
                &id,
                ExecuteStatus::Success,
                ExecuteContext {
                    chain_id: Some(envelope.chain_id),
                    tx_hash: Some(envelope.tx_hash),
                    block_number: Some(envelope.block_number),
                },
            )
            .await?;
        self.store
            .set_payout_status(&id, PayoutStatus::Completed)
            .await?;

        // Spent allocations move pending → used.
        for alloc_id in &pre.allocation_ids {
            match self.store.mark_allocation_used(*alloc_id).await {
                Ok(()) => {}
                Err(e) if e.is_stale() => {
                    warn!(allocation = %alloc_id, "allocation not pending at execute")
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.store.recompute_main_status(&id).await?;

        info!(request = %id, nullifier = %nullifier, "withdraw executed");
        self.publish_withdraw(Some(pre), &id).await;
        Ok(())
    }

    async fn on_payout(
        &self,
        nullifier: B256,
        status: PayoutStatus,
        reason: Option<String>,
    ) -> Result<(), EventError> {
        let Some(pre) = self.store.find_withdraw_by_nullifier(nullifier).await? else {
            return Err(EventError::UnknownNullifier(nullifier));
        };
        let id = pre.id.clone();
        self.store.set_payout_status(&id, status).await?;
        if let Some(reason) = reason {
            self.store.set_withdraw_last_error(&id, reason).await?;
        }
        self.store.recompute_main_status(&id).await?;
        info!(request = %id, payout = ?status, "payout event applied");
        self.publish_withdraw(Some(pre), &id).await;
        Ok(())
    }

    async fn on_hook(
        &self,
        nullifier: B256,
        status: HookStatus,
        reason: Option<String>,
    ) -> Result<(), EventError> {
        let Some(pre) = self.store.find_withdraw_by_nullifier(nullifier).await? else {
            return Err(EventError::UnknownNullifier(nullifier));
        };
        let id = pre.id.clone();
        self.store.set_hook_status(&id, status).await?;
        if let Some(reason) = reason {
            self.store.set_withdraw_last_error(&id, reason).await?;
        }
        self.store.recompute_main_status(&id).await?;
        info!(request = %id, hook = ?status, "hook event applied");
        self.publish_withdraw(Some(pre), &id).await;
        Ok(())
    }

    async fn on_fallback_transferred(&self, nullifier: B256) -> Result<(), EventError> {
        let Some(pre) = self.store.find_withdraw_by_nullifier(nullifier).await? else {
            return Err(EventError::UnknownNullifier(nullifier));
        };
        let id = pre.id.clone();
        self.store.set_fallback_transferred(&id).await?;
        self.store.recompute_main_status(&id).await?;
        info!(request = %id, "fallback transferred");
        self.publish_withdraw(Some(pre), &id).await;
        Ok(())
    }

    async fn on_fallback_failed(&self, nullifier: B256, reason: String) -> Result<(), EventError> {
        let Some(pre) = self.store.find_withdraw_by_nullifier(nullifier).await? else {
            return Err(EventError::UnknownNullifier(nullifier));
        };
        let id = pre.id.clone();
        self.store.set_fallback_error(&id, reason).await?;
        self.store.recompute_main_status(&id).await?;
        warn!(request = %id, "fallback failed");
        self.publish_withdraw(Some(pre), &id).await;
        Ok(())
    }

    async fn on_manually_resolved(&self, nullifier: B256) -> Result<(), EventError> {
        let Some(pre) = self.store.find_withdraw_by_nullifier(nullifier).await? else {
            return Err(EventError::UnknownNullifier(nullifier));
        };
        let id = pre.id.clone();
        self.store
            .pin_main_status(&id, MainStatus::ManuallyResolved)
            .await?;
        info!(request = %id, "manually resolved");
        self.publish_withdraw(Some(pre), &id).await;
        Ok(())
    }

    // -- notifications ------------------------------------------------------

    async fn publish_checkbook(&self, pre: Option<Checkbook>, id: CheckbookId) {
        if let Ok(Some(post)) = self.store.get_checkbook(id).await {
            self.notifier.publish(
                SubscriptionKey::CheckbooksByAddress(post.owner),
                ChangeMessage::CheckbookUpdate {
                    pre: pre.map(Box::new),
                    post: Box::new(post),
                },
            );
        }
    }

    async fn publish_withdraw(&self, pre: Option<WithdrawRequest>, id: &str) {
        if let Ok(Some(post)) = self.store.get_withdraw_request(id).await {
            self.notifier.publish(
                SubscriptionKey::WithdrawRequestsByAddress(post.owner),
                ChangeMessage::WithdrawRequestUpdate {
                    pre: pre.map(Box::new),
                    post: Box::new(post),
                },
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
