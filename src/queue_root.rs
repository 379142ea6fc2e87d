//! Commitment queue-root linked list.
//!
//! Roots form a singly-linked chain `previous_root → root`, reconstructed
//! from `CommitmentRootUpdated` events and backward-filled from the block
//! scanner when the local chain has gaps. Traversal is bounded: backfill
//! stops after 100 hops, forward walks after 1000. A truncated forward
//! chain is reported to the caller as a soft failure to reschedule, never
//! as a truncated `old_root`.

use std::sync::Arc;

use alloy_primitives::B256;
use tracing::{debug, info, warn};

use crate::entities::{now_epoch, QueueRoot};
use crate::error::QueueRootError;
use crate::scanner_client::RootScanner;
use crate::store::QueueRootStore;
use crate::types::ZERO_ROOT;

/// Maximum scanner hops when filling a gap behind an unknown `old_root`.
pub const BACKFILL_CAP: usize = 100;
/// Maximum hops of a forward traversal.
pub const FORWARD_CAP: usize = 1000;

/// Neighbour view of one commitment inside the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentQueueInfo {
    pub old_root: B256,
    pub new_root: B256,
    /// `created_by_commitment` of every forward successor, in chain order.
    pub commitments_after: Vec<B256>,
    /// The forward walk hit `FORWARD_CAP`; callers must treat the chain as
    /// incomplete and reschedule.
    pub truncated: bool,
}

pub struct QueueRootManager<S, C> {
    store: Arc<S>,
    scanner: C,
}

impl<S: QueueRootStore, C: RootScanner> QueueRootManager<S, C> {
    pub fn new(store: Arc<S>, scanner: C) -> Self {
        Self { store, scanner }
    }

    /// Idempotent insert of a new chain node. Returns every commitment
    /// whose node was inserted by this call (backfilled plus the new one),
    /// so the caller can promote the checkbooks they complete.
    pub async fn process_commitment_root_updated(
        &self,
        chain_id: u32,
        block_number: u64,
        old_root: B256,
        new_root: B256,
        commitment: B256,
    ) -> Result<Vec<B256>, QueueRootError> {
        let mut inserted_commitments = Vec::new();

        if old_root != ZERO_ROOT && self.store.get_queue_root(old_root).await?.is_none() {
            let backfilled = self.backfill(chain_id, old_root).await?;
            inserted_commitments.extend(backfilled);
        }

        let node = QueueRoot {
            root: new_root,
            previous_root: old_root,
            created_by_commitment: commitment,
            is_recent_root: false,
            chain_id,
            block_number,
            created_at: now_epoch(),
            updated_at: now_epoch(),
        };
        let fresh = self.store.insert_queue_root(node).await?;
        if fresh {
            inserted_commitments.push(commitment);
            self.store.set_recent_root(chain_id, new_root).await?;
            info!(
                chain_id,
                root = %new_root,
                previous = %old_root,
                backfilled = inserted_commitments.len().saturating_sub(1),
                "queue root appended"
            );
        } else {
            debug!(chain_id, root = %new_root, "queue root already known");
        }

        Ok(inserted_commitments)
    }

    /// Walks backward through the scanner from `missing` until a locally
    /// known node or the all-zero root, then inserts the traversed nodes
    /// oldest-first. Nothing is inserted when the cap is hit: a partial
    /// backfill would orphan the chain.
    async fn backfill(&self, chain_id: u32, missing: B256) -> Result<Vec<B256>, QueueRootError> {
        let mut pending: Vec<QueueRoot> = Vec::new();
        let mut cursor = missing;

        for _ in 0..BACKFILL_CAP {
            let update = self
                .scanner
                .root_updated_by_new_root(cursor, chain_id)
                .await?;
            pending.push(QueueRoot {
                root: update.new_root,
                previous_root: update.old_root,
                created_by_commitment: update.commitment,
                is_recent_root: false,
                chain_id,
                block_number: update.block_number,
                created_at: now_epoch(),
                updated_at: now_epoch(),
            });

            if update.old_root == ZERO_ROOT
                || self.store.get_queue_root(update.old_root).await?.is_some()
            {
                let mut commitments = Vec::with_capacity(pending.len());
                for node in pending.into_iter().rev() {
                    let commitment = node.created_by_commitment;
                    if self.store.insert_queue_root(node).await? {
                        commitments.push(commitment);
                    }
                }
                info!(
                    chain_id,
                    filled = commitments.len(),
                    from = %missing,
                    "queue root gap backfilled"
                );
                return Ok(commitments);
            }
            cursor = update.old_root;
        }

        warn!(chain_id, root = %missing, cap = BACKFILL_CAP, "queue root backfill cap reached");
        Err(QueueRootError::BackfillCapExceeded(
            BACKFILL_CAP,
            missing.to_string(),
        ))
    }

    /// Neighbour query for proof inputs: the roots around the commitment
    /// plus every later commitment in chain order.
    pub async fn get_commitment_queue_info(
        &self,
        commitment: B256,
    ) -> Result<Option<CommitmentQueueInfo>, QueueRootError> {
        let Some(node) = self.store.find_queue_root_by_commitment(commitment).await? else {
            return Ok(None);
        };
        let (commitments_after, truncated) = self.forward_commitments(node.root).await?;
        Ok(Some(CommitmentQueueInfo {
            old_root: node.previous_root,
            new_root: node.root,
            commitments_after,
            truncated,
        }))
    }

    /// Forward traversal from a root, returning the commitments that built
    /// each successive node.
    pub async fn get_commitment_chain_from_root(
        &self,
        start: B256,
    ) -> Result<(Vec<B256>, bool), QueueRootError> {
        self.forward_commitments(start).await
    }

    async fn forward_commitments(&self, start: B256) -> Result<(Vec<B256>, bool), QueueRootError> {
        let mut commitments = Vec::new();
        let mut cursor = start;
        for _ in 0..FORWARD_CAP {
            match self.store.get_queue_root_successor(cursor).await? {
                Some(next) => {
                    commitments.push(next.created_by_commitment);
                    cursor = next.root;
                }
                None => return Ok((commitments, false)),
            }
        }
        warn!(start = %start, cap = FORWARD_CAP, "forward root traversal truncated");
        Ok((commitments, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScannerError;
    use crate::scanner_client::RootUpdate;
    use crate::store::InMemoryStore;
    use std::collections::HashMap;

    struct MapScanner {
        by_new_root: HashMap<B256, RootUpdate>,
    }

    impl RootScanner for MapScanner {
        async fn root_updated_by_new_root(
            &self,
            root: B256,
            _chain_id: u32,
        ) -> Result<RootUpdate, ScannerError> {
            self.by_new_root
                .get(&root)
                .cloned()
                .ok_or_else(|| ScannerError::UnknownRoot(root.to_string()))
        }
    }

    fn root(n: u8) -> B256 {
        B256::repeat_byte(n)
    }

    fn commitment(n: u8) -> B256 {
        B256::repeat_byte(0xc0 | n)
    }

    /// Scanner knowledge of a linear chain r[i-1] → r[i].
    fn chain_scanner(roots: &[B256]) -> MapScanner {
        let mut by_new_root = HashMap::new();
        for i in 1..roots.len() {
            by_new_root.insert(
                roots[i],
                RootUpdate {
                    old_root: roots[i - 1],
                    new_root: roots[i],
                    commitment: commitment(i as u8),
                    block_number: i as u64,
                },
            );
        }
        MapScanner { by_new_root }
    }

    async fn seed_node<S: QueueRootStore>(store: &S, prev: B256, node: B256, c: B256) {
        store
            .insert_queue_root(QueueRoot {
                root: node,
                previous_root: prev,
                created_by_commitment: c,
                is_recent_root: false,
                chain_id: 714,
                block_number: 0,
                created_at: now_epoch(),
                updated_at: now_epoch(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backfill_connects_the_gap() {
        // Local: R0(zero) → R1. Event: old=R4, new=R5. Scanner knows R2..R4.
        let store = Arc::new(InMemoryStore::new());
        let r: Vec<B256> = (1..=5).map(root).collect();
        seed_node(store.as_ref(), ZERO_ROOT, r[0], commitment(1)).await;
        store.set_recent_root(714, r[0]).await.unwrap();

        let scanner = chain_scanner(&[r[0], r[1], r[2], r[3]]);
        let mgr = QueueRootManager::new(store.clone(), scanner);

        let inserted = mgr
            .process_commitment_root_updated(714, 10, r[3], r[4], commitment(5))
            .await
            .unwrap();
        // R2, R3, R4 backfilled plus R5 itself.
        assert_eq!(inserted.len(), 4);

        // Chain is fully linked and only R5 is recent.
        for i in 1..5 {
            let node = store.get_queue_root(r[i]).await.unwrap().unwrap();
            assert_eq!(node.previous_root, r[i - 1]);
            assert_eq!(node.is_recent_root, i == 4);
        }
        let (after, truncated) = mgr.get_commitment_chain_from_root(r[0]).await.unwrap();
        assert!(!truncated);
        assert_eq!(after.len(), 4);
    }

    #[tokio::test]
    async fn duplicate_event_is_noop() {
        let store = Arc::new(InMemoryStore::new());
        let mgr = QueueRootManager::new(
            store.clone(),
            MapScanner {
                by_new_root: HashMap::new(),
            },
        );
        let first = mgr
            .process_commitment_root_updated(714, 1, ZERO_ROOT, root(1), commitment(1))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        let second = mgr
            .process_commitment_root_updated(714, 1, ZERO_ROOT, root(1), commitment(1))
            .await
            .unwrap();
        assert!(second.is_empty());
        assert!(store
            .get_queue_root(root(1))
            .await
            .unwrap()
            .unwrap()
            .is_recent_root);
    }

    #[tokio::test]
    async fn backfill_hop_bounds() {
        fn numbered_roots(count: u16) -> Vec<B256> {
            std::iter::once(ZERO_ROOT)
                .chain((1..=count).map(|i| {
                    let mut b = [0u8; 32];
                    b[30] = (i >> 8) as u8;
                    b[31] = i as u8;
                    B256::from(b)
                }))
                .collect()
        }

        // 1, 99 and exactly 100 missing nodes: within the cap.
        for missing in [1usize, 99, 100] {
            let store = Arc::new(InMemoryStore::new());
            let roots = numbered_roots(missing as u16 + 1);
            let scanner = chain_scanner(&roots);
            let mgr = QueueRootManager::new(store.clone(), scanner);

            let last = roots[roots.len() - 1];
            let prev = roots[roots.len() - 2];
            let inserted = mgr
                .process_commitment_root_updated(714, 1, prev, last, commitment(0))
                .await
                .unwrap();
            assert_eq!(inserted.len(), missing + 1);
        }

        // 102 missing nodes behind the event: the walk cannot reach a known
        // node within 100 hops and the fill is refused wholesale.
        let store = Arc::new(InMemoryStore::new());
        let roots = numbered_roots(103);
        let mgr = QueueRootManager::new(store.clone(), chain_scanner(&roots));
        let last = roots[roots.len() - 1];
        let prev = roots[roots.len() - 2];
        let err = mgr
            .process_commitment_root_updated(714, 1, prev, last, commitment(0))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueRootError::BackfillCapExceeded(..)));
        // Nothing was inserted.
        assert!(store.get_queue_root(prev).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forward_walk_caps_at_1000() {
        let store = Arc::new(InMemoryStore::new());
        // Linear chain of 1001 nodes after genesis.
        let mut prev = ZERO_ROOT;
        let mut roots = Vec::new();
        for i in 1..=1001u16 {
            let mut b = [0u8; 32];
            b[29] = 1;
            b[30] = (i >> 8) as u8;
            b[31] = i as u8;
            let r = B256::from(b);
            seed_node(store.as_ref(), prev, r, commitment((i % 250) as u8)).await;
            roots.push(r);
            prev = r;
        }
        let mgr = QueueRootManager::new(
            store.clone(),
            MapScanner {
                by_new_root: HashMap::new(),
            },
        );

        // From the genesis: 1001 successors exist, capped at 1000.
        let (after, truncated) = mgr.get_commitment_chain_from_root(ZERO_ROOT).await.unwrap();
        assert!(truncated);
        assert_eq!(after.len(), 1000);

        // From one node before the end: single hop, no truncation.
        let (after, truncated) = mgr
            .get_commitment_chain_from_root(roots[999])
            .await
            .unwrap();
        assert!(!truncated);
        assert_eq!(after.len(), 1);

        // 999 hops.
        let (after, truncated) = mgr.get_commitment_chain_from_root(roots[1]).await.unwrap();
        assert!(!truncated);
        assert_eq!(after.len(), 999);
    }

    #[tokio::test]
    async fn queue_info_reports_neighbours() {
        let store = Arc::new(InMemoryStore::new());
        let r1 = root(1);
        let r2 = root(2);
        let r3 = root(3);
        seed_node(store.as_ref(), ZERO_ROOT, r1, commitment(1)).await;
        seed_node(store.as_ref(), r1, r2, commitment(2)).await;
        seed_node(store.as_ref(), r2, r3, commitment(3)).await;

        let mgr = QueueRootManager::new(
            store.clone(),
            MapScanner {
                by_new_root: HashMap::new(),
            },
        );
        let info = mgr
            .get_commitment_queue_info(commitment(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.old_root, r1);
        assert_eq!(info.new_root, r2);
        assert_eq!(info.commitments_after, vec![commitment(3)]);
        assert!(!info.truncated);

        assert!(mgr
            .get_commitment_queue_info(commitment(9))
            .await
            .unwrap()
            .is_none());
    }
}
