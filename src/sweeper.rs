//! Wall-clock timeout sweeper.
//!
//! Proof and execute stages that sit past their deadline are failed so a
//! user can cancel or retry instead of waiting forever. Writes go through
//! the guarded store operations and tolerate losing to a writer that
//! already moved the stage to a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::entities::*;
use crate::error::StoreError;
use crate::store::*;

/// Sweep cycle.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Stage deadline.
const STAGE_TIMEOUT_SECS: u64 = 300;

pub struct TimeoutSweeper {
    store: Arc<InMemoryStore>,
}

impl TimeoutSweeper {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self { store }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("timeout sweeper started");
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.sweep(now_epoch()).await {
                        error!(error = %e, "timeout sweep failed");
                    }
                }
            }
        }
        info!("timeout sweeper stopped");
    }

    pub async fn sweep(&self, now: u64) -> Result<(), StoreError> {
        let cutoff = now.saturating_sub(STAGE_TIMEOUT_SECS);
        for request in self.store.list_withdraw_requests().await? {
            if request.proof_status == ProofStatus::InProgress && request.created_at < cutoff {
                warn!(request = %request.id, "proof stage timed out");
                self.store
                    .set_proof_status(&request.id, ProofStatus::Failed)
                    .await?;
                self.store
                    .set_withdraw_last_error(&request.id, "proof generation timed out".into())
                    .await?;
                self.store.recompute_main_status(&request.id).await?;
                continue;
            }

            let execute_expired = match request.execute_status {
                ExecuteStatus::Pending => request.created_at < cutoff,
                ExecuteStatus::Submitted => request.updated_at < cutoff,
                _ => false,
            };
            if execute_expired {
                warn!(request = %request.id, status = ?request.execute_status, "execute stage timed out");
                // Another writer may have settled the stage meanwhile; the
                // guarded update simply reports that nothing was written.
                let wrote = self
                    .store
                    .set_execute_status(
                        &request.id,
                        ExecuteStatus::VerifyFailed,
                        ExecuteContext::default(),
                    )
                    .await?;
                if wrote {
                    self.store
                        .set_withdraw_last_error(&request.id, "execute stage timed out".into())
                        .await?;
                    self.store.recompute_main_status(&request.id).await?;
                }
            }
        }
        Ok(())
    }
}
