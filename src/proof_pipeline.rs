//! Persistent proof-generation pipeline.
//!
//! Tasks survive restarts in the task store. A worker ticks every five
//! seconds, claims up to ten due tasks in `(priority, created_at)` order,
//! and dispatches each under a per-task in-flight lock. Prover failures
//! back off exponentially within a small retry budget; protocol
//! violations (empty proof, undecodable public values) fail the owning
//! entity instead of retrying.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::entities::*;
use crate::error::{ProverError, StoreError};
use crate::prover_client::{AllocationLeaf, CommitmentProofRequest, Prover};
use crate::public_values::{CommitmentPublicValues, WithdrawPublicValues};
use crate::queue_root::QueueRootManager;
use crate::scanner_client::{NullifierAudit, RootScanner};
use crate::store::*;
use crate::tx_queue::TxSubmitter;
use crate::withdraw::build_withdraw_proof_request;

/// Worker tick.
const WORK_INTERVAL: Duration = Duration::from_secs(5);
/// Tasks claimed per tick.
const WORK_BATCH: usize = 10;

fn backoff_delay_secs(retry_count: u32) -> u64 {
    (10u64.saturating_mul(1u64 << retry_count.min(16))).min(600)
}

pub struct ProofPipeline<P, C, T, A> {
    store: Arc<InMemoryStore>,
    prover: Arc<P>,
    queue_roots: Arc<QueueRootManager<InMemoryStore, C>>,
    submitter: Arc<T>,
    audit: Arc<A>,
    management_chain_id: u32,
    /// Guards against two workers touching the same task.
    in_flight: DashMap<String, ()>,
}

impl<P, C, T, A> ProofPipeline<P, C, T, A>
where
    P: Prover,
    C: RootScanner,
    T: TxSubmitter,
    A: NullifierAudit,
{
    pub fn new(
        store: Arc<InMemoryStore>,
        prover: Arc<P>,
        queue_roots: Arc<QueueRootManager<InMemoryStore, C>>,
        submitter: Arc<T>,
        audit: Arc<A>,
        management_chain_id: u32,
    ) -> Self {
        Self {
            store,
            prover,
            queue_roots,
            submitter,
            audit,
            management_chain_id,
            in_flight: DashMap::new(),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("proof pipeline started");
        let mut tick = tokio::time::interval(WORK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => Arc::clone(&self).tick().await,
            }
        }
        info!("proof pipeline stopped");
    }

    async fn tick(self: Arc<Self>) {
        let due = match self.store.due_proof_tasks(now_epoch(), WORK_BATCH).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "proof task fetch failed");
                return;
            }
        };
        for task in due {
            let id = task.id.clone();
            if self.in_flight.insert(id.clone(), ()).is_some() {
                continue;
            }
            match self.store.claim_proof_task(&id).await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    self.in_flight.remove(&id);
                    continue;
                }
            }
            let pipeline = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = pipeline.process(task).await {
                    error!(task = %id, error = %e, "proof task processing failed");
                }
                pipeline.in_flight.remove(&id);
            });
        }
    }

    pub async fn process(&self, task: ProofTask) -> Result<(), StoreError> {
        match &task.payload {
            ProofTaskPayload::Checkbook { checkbook_id } => {
                self.process_checkbook(&task, *checkbook_id).await
            }
            ProofTaskPayload::Withdraw {
                withdraw_request_id,
            } => {
                let id = withdraw_request_id.clone();
                self.process_withdraw(&task, &id).await
            }
        }
    }

    // -- checkbook proofs ---------------------------------------------------

    async fn process_checkbook(&self, task: &ProofTask, id: CheckbookId) -> Result<(), StoreError> {
        let Some(checkbook) = self.store.get_checkbook(id).await? else {
            return self.fail_task(task, "checkbook gone".into(), None).await;
        };
        let allocations = self.store.list_checkbook_allocations(id).await?;
        if allocations.is_empty() {
            return self
                .fail_task(task, "checkbook has no allocations".into(), Some(id))
                .await;
        }

        self.store
            .advance_checkbook(id, CheckbookStatus::GeneratingProof)
            .await?;

        let request = CommitmentProofRequest {
            chain_id: id.chain_id,
            deposit_id: id.deposit_id,
            token_key: checkbook.token_key.clone(),
            allocatable_amount: checkbook.allocatable_amount,
            owner: checkbook.owner,
            allocations: allocations
                .iter()
                .map(|a| AllocationLeaf {
                    seq: a.id.seq,
                    amount: a.amount,
                })
                .collect(),
        };

        let response = match self.prover.build_commitment(&request).await {
            Ok(resp) => resp,
            Err(e) if is_prover_protocol_violation(&e) => {
                return self.fail_task(task, e.to_string(), Some(id)).await;
            }
            Err(e) => return self.retry_task(task, e.to_string(), Some(id), None).await,
        };

        let public = match CommitmentPublicValues::decode(&response.public_values) {
            Ok(p) => p,
            Err(e) => return self.fail_task(task, e.to_string(), Some(id)).await,
        };

        // Handoff: persist artifacts, derive nullifiers, queue the
        // commitment submission.
        self.store
            .set_checkbook_proof(
                id,
                public.commitment,
                response.proof.clone(),
                response.public_values.clone(),
            )
            .await?;
        self.store
            .advance_checkbook(id, CheckbookStatus::SubmittingCommitment)
            .await?;

        for alloc in &allocations {
            let nullifier =
                crate::types::nullifier_hash(public.commitment, alloc.id.seq, alloc.amount);
            match self.store.set_allocation_nullifier(alloc.id, nullifier).await {
                Ok(()) => {}
                Err(e) if e.is_stale() => {
                    warn!(allocation = %alloc.id, "nullifier already assigned differently")
                }
                Err(e) => return Err(e),
            }
        }

        self.store
            .complete_proof_task(
                &task.id,
                ProofArtifact {
                    proof: response.proof.clone(),
                    public_values: response.public_values.clone(),
                },
            )
            .await?;

        self.submitter
            .enqueue(
                self.management_chain_id,
                TxPayload::Commitment {
                    checkbook_id: id,
                    token_key: checkbook.token_key,
                    allocatable_amount: checkbook.allocatable_amount,
                    commitment: public.commitment,
                    proof: response.proof,
                    public_values: response.public_values,
                },
            )
            .await?;

        info!(checkbook = %id, commitment = %public.commitment, "commitment proof complete");
        Ok(())
    }

    // -- withdraw proofs ----------------------------------------------------

    async fn process_withdraw(&self, task: &ProofTask, request_id: &str) -> Result<(), StoreError> {
        let Some(request) = self.store.get_withdraw_request(request_id).await? else {
            return self.fail_task(task, "withdraw request gone".into(), None).await;
        };
        if request.execute_status.is_terminal() {
            debug!(request = %request_id, "withdraw already settled, dropping proof task");
            return self.store.complete_proof_task(
                &task.id,
                ProofArtifact {
                    proof: request.proof.unwrap_or_default(),
                    public_values: request.public_values.unwrap_or_default(),
                },
            )
            .await;
        }

        self.store
            .set_proof_status(request_id, ProofStatus::InProgress)
            .await?;
        self.store.recompute_main_status(request_id).await?;

        let proof_request = match build_withdraw_proof_request(
            self.store.as_ref(),
            self.queue_roots.as_ref(),
            &request,
        )
        .await
        {
            Ok(req) => req,
            // Includes the truncated-forward-chain soft failure.
            Err(e) => return self.retry_task(task, e.to_string(), None, Some(request_id)).await,
        };

        let response = match self.prover.generate_withdraw_proof(&proof_request).await {
            Ok(resp) => resp,
            Err(e) if is_prover_protocol_violation(&e) => {
                return self
                    .fail_withdraw_proof(task, request_id, e.to_string())
                    .await;
            }
            Err(e) => {
                return self
                    .retry_task(task, e.to_string(), None, Some(request_id))
                    .await
            }
        };

        let public = match WithdrawPublicValues::decode(&response.artifact.public_values) {
            Ok(p) => p,
            Err(e) => {
                return self
                    .fail_withdraw_proof(task, request_id, e.to_string())
                    .await;
            }
        };

        // Chain events key on the proof's nullifiers[0]; rewrite ours when
        // the prover disagrees with the pre-proof placeholder.
        let authoritative = public.first_nullifier();
        if authoritative != request.withdraw_nullifier {
            info!(
                request = %request_id,
                old = %request.withdraw_nullifier,
                new = %authoritative,
                "prover rewrote the withdraw nullifier"
            );
            self.store
                .rewrite_withdraw_nullifier(request_id, authoritative)
                .await?;
        }

        self.store
            .set_withdraw_proof(
                request_id,
                response.artifact.proof.clone(),
                response.artifact.public_values.clone(),
            )
            .await?;
        self.store
            .set_proof_status(request_id, ProofStatus::Completed)
            .await?;
        self.store.recompute_main_status(request_id).await?;

        self.store
            .complete_proof_task(
                &task.id,
                ProofArtifact {
                    proof: response.artifact.proof,
                    public_values: response.artifact.public_values,
                },
            )
            .await?;

        info!(request = %request_id, nullifier = %authoritative, "withdraw proof complete");
        submit_withdraw(
            self.store.as_ref(),
            self.submitter.as_ref(),
            self.management_chain_id,
            request_id,
        )
        .await
    }

    // -- failure paths ------------------------------------------------------

    async fn retry_task(
        &self,
        task: &ProofTask,
        error: String,
        checkbook: Option<CheckbookId>,
        withdraw: Option<&str>,
    ) -> Result<(), StoreError> {
        let next_retry = task.retry_count + 1;
        if next_retry > task.max_retries {
            warn!(task = %task.id, error = %error, "proof retry budget exhausted");
            if let Some(id) = withdraw {
                return self.fail_withdraw_proof(task, id, error).await;
            }
            return self.fail_task(task, error, checkbook).await;
        }
        let delay = backoff_delay_secs(task.retry_count);
        debug!(task = %task.id, retry = next_retry, delay_secs = delay, error = %error, "proof task rescheduled");
        self.store
            .retry_proof_task(&task.id, next_retry, now_epoch() + delay, error)
            .await
    }

    async fn fail_task(
        &self,
        task: &ProofTask,
        error: String,
        checkbook: Option<CheckbookId>,
    ) -> Result<(), StoreError> {
        self.store.fail_proof_task(&task.id, error.clone()).await?;
        if let Some(id) = checkbook {
            self.store
                .fail_checkbook(id, CheckbookStatus::ProofFailed, error)
                .await?;
        }
        Ok(())
    }

    /// Terminal proof failure for a withdraw: the allocations stay pending
    /// until the user cancels.
    async fn fail_withdraw_proof(
        &self,
        task: &ProofTask,
        request_id: &str,
        error: String,
    ) -> Result<(), StoreError> {
        self.store.fail_proof_task(&task.id, error.clone()).await?;
        self.store
            .set_proof_status(request_id, ProofStatus::Failed)
            .await?;
        self.store.set_withdraw_last_error(request_id, error).await?;
        self.store.recompute_main_status(request_id).await?;
        Ok(())
    }

    // -- recovery -----------------------------------------------------------

    /// Startup pass: interrupted tasks return to pending; completed
    /// withdraw proofs whose submission never happened are resumed, unless
    /// the scanner shows the nullifier already consumed.
    pub async fn recover(&self) -> Result<(), StoreError> {
        for task in self
            .store
            .list_proof_tasks_in(&[TaskStatus::Processing])
            .await?
        {
            info!(task = %task.id, "resetting interrupted proof task");
            self.store
                .retry_proof_task(
                    &task.id,
                    task.retry_count,
                    now_epoch(),
                    "reset after restart".into(),
                )
                .await?;
        }

        for task in self
            .store
            .list_proof_tasks_in(&[TaskStatus::Completed])
            .await?
        {
            let ProofTaskPayload::Withdraw {
                withdraw_request_id,
            } = &task.payload
            else {
                continue;
            };
            let Some(request) = self.store.get_withdraw_request(withdraw_request_id).await? else {
                continue;
            };
            if request.execute_status != ExecuteStatus::Pending
                || request.proof_status != ProofStatus::Completed
            {
                continue;
            }
            match self
                .audit
                .nullifier_used(self.management_chain_id, request.withdraw_nullifier)
                .await
            {
                Ok(true) => {
                    info!(request = %request.id, "nullifier already consumed on chain, marking executed");
                    self.store
                        .set_execute_status(
                            &request.id,
                            ExecuteStatus::Success,
                            ExecuteContext::default(),
                        )
                        .await?;
                    self.store.recompute_main_status(&request.id).await?;
                }
                Ok(false) => {
                    info!(request = %request.id, "resuming withdraw submission after restart");
                    submit_withdraw(
                        self.store.as_ref(),
                        self.submitter.as_ref(),
                        self.management_chain_id,
                        &request.id,
                    )
                    .await?;
                }
                Err(e) => {
                    warn!(request = %request.id, error = %e, "nullifier audit failed, resuming submission");
                    submit_withdraw(
                        self.store.as_ref(),
                        self.submitter.as_ref(),
                        self.management_chain_id,
                        &request.id,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }
}

fn is_prover_protocol_violation(error: &ProverError) -> bool {
    matches!(
        error,
        ProverError::EmptyProof | ProverError::EmptyPublicValues | ProverError::BadPublicValues(_)
    )
}

/// Files the withdraw submission with the transaction queue. Callable from
/// the pipeline handoff, manual execute retries and startup recovery.
pub async fn submit_withdraw<T: TxSubmitter>(
    store: &InMemoryStore,
    submitter: &T,
    management_chain_id: u32,
    request_id: &str,
) -> Result<(), StoreError> {
    let Some(request) = store.get_withdraw_request(request_id).await? else {
        return Err(StoreError::not_found("withdraw_request", request_id));
    };

    // Fix up an inconsistent proof status when the artifacts are present.
    if request.proof_status != ProofStatus::Completed {
        if request.proof.is_some() && request.public_values.is_some() {
            store
                .set_proof_status(request_id, ProofStatus::Completed)
                .await?;
        } else {
            return Err(StoreError::stale(
                "withdraw_request",
                request_id,
                "proof not completed",
            ));
        }
    }
    if request.execute_status.is_terminal() {
        return Err(StoreError::stale(
            "withdraw_request",
            request_id,
            "execute already terminal",
        ));
    }

    let proof = request.proof.clone().unwrap_or_default();
    let public_values = request.public_values.clone().unwrap_or_default();
    let public = WithdrawPublicValues::decode(&public_values)
        .map_err(|e| StoreError::stale("withdraw_request", request_id, e.to_string()))?;

    submitter
        .enqueue(
            management_chain_id,
            TxPayload::Withdraw {
                withdraw_request_id: request_id.to_string(),
                token_key: public.token_key.clone(),
                recipient: request.recipient.data,
                amount: request.amount,
                queue_root: public.commitment_root,
                proof,
                public_values,
            },
        )
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
