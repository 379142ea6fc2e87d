//! WithdrawRequest orchestrator.
//!
//! Owns the four-stage lifecycle: creation (validation, allocation
//! locking, proof-task enqueue), the prover request construction, manual
//! execute retries, payout/hook/fallback retries, and cancellation.
//! Payout and hook stages themselves advance through chain events; the
//! orchestrator only enforces preconditions and retry budgets.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::B256;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::*;
use crate::error::{StoreError, WithdrawError};
use crate::notifier::{ChangeMessage, ChangeNotifier, SubscriptionKey};
use crate::prover_client::{CommitmentGroup, Credential, WithdrawProofRequest};
use crate::proof_pipeline::submit_withdraw;
use crate::queue_root::QueueRootManager;
use crate::scanner_client::RootScanner;
use crate::store::*;
use crate::tx_queue::TxSubmitter;
use crate::types::{
    deposit_id_be32, leaf_hash, Amount, Intent, MultichainSignature, UniversalAddress,
};

/// Per-stage retry budget for payout, hook and fallback.
const STAGE_RETRY_CAP: u32 = 5;

/// Creation input, as delivered by the API surface.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateWithdrawal {
    pub allocation_ids: Vec<AllocationId>,
    pub intent: Intent,
    pub signature: MultichainSignature,
    #[serde(default)]
    pub min_output: Option<B256>,
}

pub struct WithdrawOrchestrator<T> {
    store: Arc<InMemoryStore>,
    submitter: Arc<T>,
    notifier: Arc<ChangeNotifier>,
    management_chain_id: u32,
}

impl<T: TxSubmitter> WithdrawOrchestrator<T> {
    pub fn new(
        store: Arc<InMemoryStore>,
        submitter: Arc<T>,
        notifier: Arc<ChangeNotifier>,
        management_chain_id: u32,
    ) -> Self {
        Self {
            store,
            submitter,
            notifier,
            management_chain_id,
        }
    }

    // -- creation -----------------------------------------------------------

    pub async fn create(&self, input: CreateWithdrawal) -> Result<WithdrawRequest, WithdrawError> {
        if input.allocation_ids.is_empty() {
            return Err(WithdrawError::EmptyAllocationSet);
        }

        // Load and validate every allocation before touching anything.
        let mut allocations = Vec::with_capacity(input.allocation_ids.len());
        let mut owner: Option<UniversalAddress> = None;
        for id in &input.allocation_ids {
            let alloc = self
                .store
                .get_allocation(*id)
                .await?
                .ok_or_else(|| WithdrawError::AllocationNotFound(id.to_string()))?;
            if alloc.status != AllocationStatus::Idle {
                return Err(WithdrawError::AllocationNotIdle(id.to_string()));
            }
            if alloc.nullifier.is_none() {
                return Err(WithdrawError::MissingNullifier(id.to_string()));
            }
            let checkbook = self
                .store
                .get_checkbook(id.checkbook)
                .await?
                .ok_or_else(|| WithdrawError::AllocationNotFound(id.to_string()))?;
            match owner {
                None => owner = Some(checkbook.owner),
                Some(existing) if existing.same_owner(&checkbook.owner) => {}
                Some(_) => return Err(WithdrawError::MixedOwners),
            }
            allocations.push(alloc);
        }
        let Some(owner) = owner else {
            return Err(WithdrawError::EmptyAllocationSet);
        };

        let amount = Amount::sum(allocations.iter().map(|a| &a.amount))?;
        let provisional_nullifier = allocations[0]
            .nullifier
            .ok_or_else(|| WithdrawError::MissingNullifier(allocations[0].id.to_string()))?;

        // A prior request holding this nullifier is recycled only once its
        // allocations have come back to idle.
        if let Some(prior) = self
            .store
            .find_withdraw_by_nullifier(provisional_nullifier)
            .await?
        {
            let mut recyclable = true;
            for id in &prior.allocation_ids {
                let idle = self
                    .store
                    .get_allocation(*id)
                    .await?
                    .map_or(true, |a| a.status == AllocationStatus::Idle);
                if !idle {
                    recyclable = false;
                    break;
                }
            }
            if !recyclable {
                return Err(WithdrawError::NullifierInUse(
                    provisional_nullifier.to_string(),
                ));
            }
            info!(prior = %prior.id, "recycling stale withdraw request");
            self.store.delete_withdraw_request(&prior.id).await?;
        }

        let id = Uuid::new_v4().to_string();
        let recipient = *input.intent.beneficiary();
        let mut request = WithdrawRequest::new(
            id.clone(),
            owner,
            input.allocation_ids.clone(),
            input.intent,
            recipient,
            amount,
            provisional_nullifier,
        );
        request.signature = Some(input.signature);
        request.min_output = input.min_output;
        self.store.create_withdraw_request(request).await?;

        // Lock the allocations to the new request; roll back wholesale if
        // any has been raced away.
        let mut locked: Vec<AllocationId> = Vec::new();
        for alloc_id in &input.allocation_ids {
            match self.store.lock_allocation(*alloc_id, &id).await {
                Ok(()) => locked.push(*alloc_id),
                Err(e) => {
                    for unlock in &locked {
                        let _ = self.store.release_allocation(*unlock, &id).await;
                    }
                    self.store.delete_withdraw_request(&id).await?;
                    return Err(if e.is_stale() {
                        WithdrawError::AllocationNotIdle(alloc_id.to_string())
                    } else {
                        e.into()
                    });
                }
            }
        }

        self.enqueue_proof_task(&id).await?;
        let created = self
            .store
            .get_withdraw_request(&id)
            .await?
            .ok_or_else(|| StoreError::not_found("withdraw_request", &id))?;

        info!(
            request = %id,
            owner = %owner,
            amount = %amount,
            allocations = created.allocation_ids.len(),
            "withdraw request created"
        );
        self.publish(None, &created);
        Ok(created)
    }

    async fn enqueue_proof_task(&self, request_id: &str) -> Result<(), WithdrawError> {
        let task = ProofTask::new(
            format!("wproof-{request_id}"),
            ProofTaskPayload::Withdraw {
                withdraw_request_id: request_id.to_string(),
            },
        );
        match self.store.create_proof_task(task).await {
            Ok(()) | Err(StoreError::Duplicate { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // -- stage 2: execute ---------------------------------------------------

    /// Manual execute retry. The automatic path runs from the proof
    /// pipeline handoff; this one re-files the submission after a
    /// retryable failure.
    pub async fn execute(&self, request_id: &str) -> Result<(), WithdrawError> {
        let pre = self
            .store
            .get_withdraw_request(request_id)
            .await?
            .ok_or_else(|| WithdrawError::NotFound(request_id.into()))?;

        submit_withdraw(
            self.store.as_ref(),
            self.submitter.as_ref(),
            self.management_chain_id,
            request_id,
        )
        .await
        .map_err(|e| match e {
            StoreError::Stale { reason, .. } => WithdrawError::Precondition(reason),
            other => WithdrawError::Store(other),
        })?;

        if let Ok(Some(post)) = self.store.get_withdraw_request(request_id).await {
            self.publish(Some(pre), &post);
        }
        Ok(())
    }

    // -- stages 3 & 4: payout / hook / fallback retries ---------------------

    pub async fn retry_payout(&self, request_id: &str) -> Result<(), WithdrawError> {
        let pre = self.load(request_id).await?;
        if pre.payout_status != PayoutStatus::Failed {
            return Err(WithdrawError::Precondition(
                "payout has not failed".into(),
            ));
        }
        self.bump(request_id, RetryStage::Payout, "payout").await?;
        self.store
            .set_payout_status(request_id, PayoutStatus::Pending)
            .await?;
        self.store.recompute_main_status(request_id).await?;
        info!(request = %request_id, "payout retry filed");
        self.publish_current(pre, request_id).await;
        Ok(())
    }

    pub async fn retry_hook(&self, request_id: &str) -> Result<(), WithdrawError> {
        let pre = self.load(request_id).await?;
        if pre.hook_status != HookStatus::Failed {
            return Err(WithdrawError::Precondition("hook has not failed".into()));
        }
        self.bump(request_id, RetryStage::Hook, "hook").await?;
        self.store
            .set_hook_status(request_id, HookStatus::Pending)
            .await?;
        self.store.recompute_main_status(request_id).await?;
        info!(request = %request_id, "hook retry filed");
        self.publish_current(pre, request_id).await;
        Ok(())
    }

    pub async fn retry_fallback(&self, request_id: &str) -> Result<(), WithdrawError> {
        let pre = self.load(request_id).await?;
        if pre.fallback_transferred {
            return Err(WithdrawError::Precondition(
                "fallback already transferred".into(),
            ));
        }
        if pre.hook_status != HookStatus::Failed && pre.payout_status != PayoutStatus::Failed {
            return Err(WithdrawError::Precondition(
                "nothing for the fallback to recover".into(),
            ));
        }
        self.bump(request_id, RetryStage::Fallback, "fallback").await?;
        info!(request = %request_id, "fallback retry filed");
        self.publish_current(pre, request_id).await;
        Ok(())
    }

    async fn bump(
        &self,
        request_id: &str,
        stage: RetryStage,
        label: &'static str,
    ) -> Result<(), WithdrawError> {
        self.store
            .bump_stage_retries(request_id, stage, STAGE_RETRY_CAP)
            .await
            .map_err(|e| {
                if e.is_stale() {
                    WithdrawError::RetryLimit(label)
                } else {
                    WithdrawError::Store(e)
                }
            })?;
        Ok(())
    }

    // -- cancellation -------------------------------------------------------

    /// Permitted while no funds are committed on chain.
    pub async fn cancel(&self, request_id: &str) -> Result<(), WithdrawError> {
        let pre = self.load(request_id).await?;
        if pre.execute_status == ExecuteStatus::Success {
            return Err(WithdrawError::CancelAfterExecute);
        }

        for alloc_id in &pre.allocation_ids {
            match self.store.release_allocation(*alloc_id, request_id).await {
                Ok(()) => {}
                Err(e) if e.is_stale() => {
                    warn!(allocation = %alloc_id, "allocation not held by cancelled request")
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.store
            .pin_main_status(request_id, MainStatus::Cancelled)
            .await?;

        info!(request = %request_id, "withdraw request cancelled");
        self.publish_current(pre, request_id).await;
        Ok(())
    }

    // -- helpers ------------------------------------------------------------

    async fn load(&self, request_id: &str) -> Result<WithdrawRequest, WithdrawError> {
        self.store
            .get_withdraw_request(request_id)
            .await?
            .ok_or_else(|| WithdrawError::NotFound(request_id.into()))
    }

    async fn publish_current(&self, pre: WithdrawRequest, request_id: &str) {
        if let Ok(Some(post)) = self.store.get_withdraw_request(request_id).await {
            self.publish(Some(pre), &post);
        }
    }

    fn publish(&self, pre: Option<WithdrawRequest>, post: &WithdrawRequest) {
        self.notifier.publish(
            SubscriptionKey::WithdrawRequestsByAddress(post.owner),
            ChangeMessage::WithdrawRequestUpdate {
                pre: pre.map(Box::new),
                post: Box::new(post.clone()),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Prover request construction
// ---------------------------------------------------------------------------

/// Builds the prover input for a withdraw request: one commitment group
/// per touched checkbook, canonically ordered, each selected allocation
/// carrying its membership witness and the commitment's queue-root
/// neighbourhood.
pub async fn build_withdraw_proof_request<C: RootScanner>(
    store: &InMemoryStore,
    queue_roots: &QueueRootManager<InMemoryStore, C>,
    request: &WithdrawRequest,
) -> Result<WithdrawProofRequest, WithdrawError> {
    let signature = request
        .signature
        .clone()
        .ok_or_else(|| WithdrawError::Precondition("request carries no signature".into()))?;

    // Selected allocations grouped by checkbook, seq-sorted by the map.
    let mut selected: BTreeMap<CheckbookId, Vec<AllocationId>> = BTreeMap::new();
    for id in &request.allocation_ids {
        selected.entry(id.checkbook).or_default().push(*id);
    }

    let mut groups = Vec::with_capacity(selected.len());
    for (checkbook_id, mut ids) in selected {
        ids.sort_by_key(|id| id.seq);
        let checkbook = store
            .get_checkbook(checkbook_id)
            .await?
            .ok_or_else(|| WithdrawError::AllocationNotFound(checkbook_id.to_string()))?;
        let commitment = checkbook.commitment.ok_or_else(|| {
            WithdrawError::Precondition(format!("checkbook {checkbook_id} has no commitment yet"))
        })?;

        // Leaf hashes over the whole checkbook, in seq order.
        let all = store.list_checkbook_allocations(checkbook_id).await?;
        let leaves: Vec<(u8, B256)> = all
            .iter()
            .map(|a| (a.id.seq, leaf_hash(a.id.seq, a.amount)))
            .collect();

        let info = queue_roots
            .get_commitment_queue_info(commitment)
            .await
            .map_err(WithdrawError::from_queue_root)?
            .ok_or_else(|| {
                WithdrawError::Precondition(format!(
                    "commitment {commitment} not yet in the root chain"
                ))
            })?;
        if info.truncated {
            // Soft failure: the caller reschedules once the chain view is
            // complete.
            return Err(WithdrawError::Precondition(
                "forward root chain truncated".into(),
            ));
        }

        let mut credentials = Vec::with_capacity(ids.len());
        for id in &ids {
            let position = leaves
                .iter()
                .position(|(seq, _)| *seq == id.seq)
                .ok_or_else(|| WithdrawError::AllocationNotFound(id.to_string()))?;
            let amount = all[position].amount;
            credentials.push(Credential {
                left_hashes: leaves[..position].iter().map(|(_, h)| *h).collect(),
                right_hashes: leaves[position + 1..].iter().map(|(_, h)| *h).collect(),
                deposit_id: B256::from(deposit_id_be32(checkbook_id.deposit_id)),
                chain_id: checkbook_id.chain_id,
                token_key: checkbook.token_key.clone(),
                seq: id.seq,
                amount,
            });
        }

        groups.push(CommitmentGroup {
            checkbook_id,
            commitment,
            root_before_commitment: info.old_root,
            commitments_after: info.commitments_after,
            credentials,
        });
    }

    // Canonical ordering for the prover.
    groups.sort_by_key(|g| (g.checkbook_id.deposit_id, g.checkbook_id.chain_id));

    Ok(WithdrawProofRequest {
        owner: request.owner,
        intent: request.intent.clone(),
        signature,
        commitment_groups: groups,
        min_output: request.min_output,
        language: None,
        chain_names: Vec::new(),
    })
}

impl WithdrawError {
    fn from_queue_root(e: crate::error::QueueRootError) -> Self {
        match e {
            crate::error::QueueRootError::Store(s) => WithdrawError::Store(s),
            other => WithdrawError::Precondition(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScannerError;
    use crate::scanner_client::RootUpdate;
    use crate::types::{nullifier_hash, ZERO_ROOT};
    use std::sync::Mutex as StdMutex;

    struct NoScanner;

    impl RootScanner for NoScanner {
        async fn root_updated_by_new_root(
            &self,
            root: B256,
            _chain_id: u32,
        ) -> Result<RootUpdate, ScannerError> {
            Err(ScannerError::UnknownRoot(root.to_string()))
        }
    }

    struct RecordingSubmitter {
        enqueued: StdMutex<Vec<(u32, TxPayload)>>,
    }

    impl TxSubmitter for RecordingSubmitter {
        async fn enqueue(&self, chain_id: u32, payload: TxPayload) -> Result<String, StoreError> {
            self.enqueued.lock().unwrap().push((chain_id, payload));
            Ok("queued".into())
        }
    }

    type TestOrchestrator = WithdrawOrchestrator<RecordingSubmitter>;

    fn orchestrator() -> (
        Arc<InMemoryStore>,
        Arc<QueueRootManager<InMemoryStore, NoScanner>>,
        TestOrchestrator,
    ) {
        let store = Arc::new(InMemoryStore::new());
        let queue_roots = Arc::new(QueueRootManager::new(store.clone(), NoScanner));
        let orch = WithdrawOrchestrator::new(
            store.clone(),
            Arc::new(RecordingSubmitter {
                enqueued: StdMutex::new(vec![]),
            }),
            Arc::new(ChangeNotifier::new()),
            714,
        );
        (store, queue_roots, orch)
    }

    fn owner() -> UniversalAddress {
        UniversalAddress::parse(714, "0x00000000000000000000000000000000000000aa").unwrap()
    }

    fn signature() -> MultichainSignature {
        MultichainSignature {
            chain_id: 714,
            signature_data: "0xsigned".into(),
            public_key: None,
        }
    }

    fn raw_intent() -> Intent {
        Intent::RawToken {
            beneficiary: UniversalAddress::parse(
                60,
                "0x00000000000000000000000000000000000000bb",
            )
            .unwrap(),
            token_symbol: "USDT".into(),
        }
    }

    /// Checkbook with a known commitment and `count` idle allocations with
    /// nullifiers assigned.
    async fn seed_checkbook(
        store: &InMemoryStore,
        deposit_id: u64,
        commitment: B256,
        count: u8,
    ) -> Vec<AllocationId> {
        let id = CheckbookId::new(714, deposit_id);
        let mut cb = Checkbook::new(id, owner(), Amount::from_u64(100 * count as u64));
        cb.token_key = "USDT".into();
        store.create_checkbook(cb).await.unwrap();
        store
            .set_checkbook_proof(id, commitment, vec![1], vec![2])
            .await
            .unwrap();

        let mut ids = Vec::new();
        for seq in 0..count {
            let alloc_id = AllocationId::new(id, seq);
            store
                .create_allocation(Allocation::new(alloc_id, Amount::from_u64(100)))
                .await
                .unwrap();
            store
                .set_allocation_nullifier(
                    alloc_id,
                    nullifier_hash(commitment, seq, Amount::from_u64(100)),
                )
                .await
                .unwrap();
            ids.push(alloc_id);
        }
        ids
    }

    async fn seed_chain(store: &InMemoryStore, commitments: &[B256]) {
        let mut prev = ZERO_ROOT;
        for (i, c) in commitments.iter().enumerate() {
            let root = B256::repeat_byte(0x30 + i as u8);
            store
                .insert_queue_root(QueueRoot {
                    root,
                    previous_root: prev,
                    created_by_commitment: *c,
                    is_recent_root: false,
                    chain_id: 714,
                    block_number: i as u64,
                    created_at: now_epoch(),
                    updated_at: now_epoch(),
                })
                .await
                .unwrap();
            prev = root;
        }
        store.set_recent_root(714, prev).await.unwrap();
    }

    #[tokio::test]
    async fn cross_checkbook_create_builds_sorted_groups() {
        let (store, queue_roots, orch) = orchestrator();
        let c1 = B256::repeat_byte(0xc1);
        let c2 = B256::repeat_byte(0xc2);
        // Seed in reverse deposit order to exercise the canonical sort.
        let a2 = seed_checkbook(store.as_ref(), 20, c2, 2).await;
        let a1 = seed_checkbook(store.as_ref(), 10, c1, 2).await;
        seed_chain(store.as_ref(), &[c1, c2]).await;

        let mut allocation_ids = a2.clone();
        allocation_ids.extend(&a1);
        let created = orch
            .create(CreateWithdrawal {
                allocation_ids: allocation_ids.clone(),
                intent: raw_intent(),
                signature: signature(),
                min_output: None,
            })
            .await
            .unwrap();

        assert_eq!(created.amount, Amount::from_u64(400));
        // Provisional nullifier is the first listed allocation's.
        let first = store.get_allocation(a2[0]).await.unwrap().unwrap();
        assert_eq!(created.withdraw_nullifier, first.nullifier.unwrap());

        // Allocations are all locked to this request.
        for id in &allocation_ids {
            let alloc = store.get_allocation(*id).await.unwrap().unwrap();
            assert_eq!(alloc.status, AllocationStatus::Pending);
            assert_eq!(alloc.withdraw_request_id.as_deref(), Some(created.id.as_str()));
        }

        // A proof task was queued.
        assert_eq!(
            store
                .list_proof_tasks_in(&[TaskStatus::Pending])
                .await
                .unwrap()
                .len(),
            1
        );

        // Prover input: two groups sorted by deposit id, with the right
        // neighbourhoods.
        let request = store
            .get_withdraw_request(&created.id)
            .await
            .unwrap()
            .unwrap();
        let proof_request =
            build_withdraw_proof_request(store.as_ref(), queue_roots.as_ref(), &request)
                .await
                .unwrap();
        assert_eq!(proof_request.commitment_groups.len(), 2);
        let g1 = &proof_request.commitment_groups[0];
        let g2 = &proof_request.commitment_groups[1];
        assert_eq!(g1.checkbook_id.deposit_id, 10);
        assert_eq!(g2.checkbook_id.deposit_id, 20);
        assert_eq!(g1.root_before_commitment, ZERO_ROOT);
        assert_eq!(g1.commitments_after, vec![c2]);
        assert!(g2.commitments_after.is_empty());

        // Witness shape: seq 0 has everything on the right, seq 1 on the left.
        assert!(g1.credentials[0].left_hashes.is_empty());
        assert_eq!(g1.credentials[0].right_hashes.len(), 1);
        assert_eq!(g1.credentials[1].left_hashes.len(), 1);
        assert!(g1.credentials[1].right_hashes.is_empty());
    }

    #[tokio::test]
    async fn creation_rejects_bad_inputs() {
        let (store, _queue_roots, orch) = orchestrator();
        let c1 = B256::repeat_byte(0xc1);
        let a1 = seed_checkbook(store.as_ref(), 1, c1, 2).await;

        // Empty set.
        assert!(matches!(
            orch.create(CreateWithdrawal {
                allocation_ids: vec![],
                intent: raw_intent(),
                signature: signature(),
                min_output: None,
            })
            .await,
            Err(WithdrawError::EmptyAllocationSet)
        ));

        // Mixed owners.
        let other_owner_cb = CheckbookId::new(714, 2);
        let mut cb = Checkbook::new(
            other_owner_cb,
            UniversalAddress::parse(714, "0x00000000000000000000000000000000000000cc").unwrap(),
            Amount::from_u64(100),
        );
        cb.token_key = "USDT".into();
        store.create_checkbook(cb).await.unwrap();
        let foreign = AllocationId::new(other_owner_cb, 0);
        store
            .create_allocation(Allocation::new(foreign, Amount::from_u64(100)))
            .await
            .unwrap();
        store
            .set_allocation_nullifier(foreign, B256::repeat_byte(0x0f))
            .await
            .unwrap();
        assert!(matches!(
            orch.create(CreateWithdrawal {
                allocation_ids: vec![a1[0], foreign],
                intent: raw_intent(),
                signature: signature(),
                min_output: None,
            })
            .await,
            Err(WithdrawError::MixedOwners)
        ));

        // Missing nullifier.
        let bare = AllocationId::new(CheckbookId::new(714, 1), 5);
        store
            .create_allocation(Allocation::new(bare, Amount::from_u64(100)))
            .await
            .unwrap();
        assert!(matches!(
            orch.create(CreateWithdrawal {
                allocation_ids: vec![bare],
                intent: raw_intent(),
                signature: signature(),
                min_output: None,
            })
            .await,
            Err(WithdrawError::MissingNullifier(_))
        ));

        // Nothing was locked by the failed attempts.
        for id in &a1 {
            let alloc = store.get_allocation(*id).await.unwrap().unwrap();
            assert_eq!(alloc.status, AllocationStatus::Idle);
        }
    }

    #[tokio::test]
    async fn cancel_releases_and_recreation_recycles() {
        let (store, _queue_roots, orch) = orchestrator();
        let c1 = B256::repeat_byte(0xc1);
        let ids = seed_checkbook(store.as_ref(), 1, c1, 2).await;

        let create_input = CreateWithdrawal {
            allocation_ids: ids.clone(),
            intent: raw_intent(),
            signature: signature(),
            min_output: None,
        };
        let first = orch.create(create_input.clone()).await.unwrap();

        // Same nullifier while the first request is live: rejected.
        assert!(matches!(
            orch.create(create_input.clone()).await,
            Err(WithdrawError::AllocationNotIdle(_))
        ));

        orch.cancel(&first.id).await.unwrap();
        for id in &ids {
            let alloc = store.get_allocation(*id).await.unwrap().unwrap();
            assert_eq!(alloc.status, AllocationStatus::Idle);
        }
        let cancelled = store.get_withdraw_request(&first.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, MainStatus::Cancelled);

        // Recreation with the same set deletes the stale row and succeeds.
        let second = orch.create(create_input).await.unwrap();
        assert_ne!(second.id, first.id);
        assert!(store
            .get_withdraw_request(&first.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cancel_after_execute_success_is_rejected() {
        let (store, _queue_roots, orch) = orchestrator();
        let c1 = B256::repeat_byte(0xc1);
        let ids = seed_checkbook(store.as_ref(), 1, c1, 1).await;
        let created = orch
            .create(CreateWithdrawal {
                allocation_ids: ids.clone(),
                intent: raw_intent(),
                signature: signature(),
                min_output: None,
            })
            .await
            .unwrap();

        store
            .set_execute_status(&created.id, ExecuteStatus::Success, ExecuteContext::default())
            .await
            .unwrap();
        assert!(matches!(
            orch.cancel(&created.id).await,
            Err(WithdrawError::CancelAfterExecute)
        ));
        // Allocation still held.
        let alloc = store.get_allocation(ids[0]).await.unwrap().unwrap();
        assert_eq!(alloc.status, AllocationStatus::Pending);
    }

    #[tokio::test]
    async fn stage_retries_enforce_preconditions_and_caps() {
        let (store, _queue_roots, orch) = orchestrator();
        let c1 = B256::repeat_byte(0xc1);
        let ids = seed_checkbook(store.as_ref(), 1, c1, 1).await;
        let created = orch
            .create(CreateWithdrawal {
                allocation_ids: ids,
                intent: raw_intent(),
                signature: signature(),
                min_output: None,
            })
            .await
            .unwrap();

        // Payout has not failed yet.
        assert!(matches!(
            orch.retry_payout(&created.id).await,
            Err(WithdrawError::Precondition(_))
        ));

        store
            .set_payout_status(&created.id, PayoutStatus::Failed)
            .await
            .unwrap();
        for _ in 0..STAGE_RETRY_CAP {
            orch.retry_payout(&created.id).await.unwrap();
            store
                .set_payout_status(&created.id, PayoutStatus::Failed)
                .await
                .unwrap();
        }
        assert!(matches!(
            orch.retry_payout(&created.id).await,
            Err(WithdrawError::RetryLimit("payout"))
        ));
    }

    #[tokio::test]
    async fn execute_requires_a_completed_proof() {
        let (_store, _queue_roots, orch) = orchestrator();
        assert!(matches!(
            orch.execute("missing").await,
            Err(WithdrawError::NotFound(_))
        ));

        let (store, _qr, orch) = orchestrator();
        let c1 = B256::repeat_byte(0xc1);
        let ids = seed_checkbook(store.as_ref(), 1, c1, 1).await;
        let created = orch
            .create(CreateWithdrawal {
                allocation_ids: ids,
                intent: raw_intent(),
                signature: signature(),
                min_output: None,
            })
            .await
            .unwrap();
        assert!(matches!(
            orch.execute(&created.id).await,
            Err(WithdrawError::Precondition(_))
        ));
    }
}
