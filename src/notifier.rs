//! Typed status-change fan-out.
//!
//! Connections register a channel and subscribe to keys (addresses or
//! asset ids). A publish consults the reverse index and non-blocking
//! sends to every subscriber; a full channel drops the message for that
//! subscriber and never blocks the publisher.

use std::collections::HashSet;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::entities::{Allocation, Checkbook, WithdrawRequest};
use crate::types::{Amount, AssetId, UniversalAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    DepositsByAddress(UniversalAddress),
    CheckbooksByAddress(UniversalAddress),
    WithdrawRequestsByAddress(UniversalAddress),
    PricesByAssetId(AssetId),
}

/// Change messages carry the pre-image (when one exists) and the
/// post-image of the entity.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeMessage {
    CheckbookUpdate {
        pre: Option<Box<Checkbook>>,
        post: Box<Checkbook>,
    },
    CheckUpdate {
        pre: Option<Box<Allocation>>,
        post: Box<Allocation>,
    },
    WithdrawRequestUpdate {
        pre: Option<Box<WithdrawRequest>>,
        post: Box<WithdrawRequest>,
    },
    DepositUpdate {
        owner: UniversalAddress,
        chain_id: u32,
        deposit_id: u64,
        amount: Amount,
        used: bool,
    },
    PriceUpdate {
        asset_id: AssetId,
        price: String,
    },
}

pub struct ChangeNotifier {
    channels: DashMap<String, mpsc::Sender<ChangeMessage>>,
    subscriptions: DashMap<String, HashSet<SubscriptionKey>>,
    index: DashMap<SubscriptionKey, HashSet<String>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            subscriptions: DashMap::new(),
            index: DashMap::new(),
        }
    }

    /// Registers a connection and returns its message stream.
    pub fn register(&self, conn_id: &str, buffer: usize) -> mpsc::Receiver<ChangeMessage> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.channels.insert(conn_id.to_string(), tx);
        self.subscriptions
            .insert(conn_id.to_string(), HashSet::new());
        rx
    }

    pub fn subscribe(&self, conn_id: &str, key: SubscriptionKey) {
        if let Some(mut subs) = self.subscriptions.get_mut(conn_id) {
            subs.insert(key);
        } else {
            return;
        }
        self.index
            .entry(key)
            .or_default()
            .insert(conn_id.to_string());
    }

    pub fn unsubscribe(&self, conn_id: &str, key: SubscriptionKey) {
        if let Some(mut subs) = self.subscriptions.get_mut(conn_id) {
            subs.remove(&key);
        }
        if let Some(mut conns) = self.index.get_mut(&key) {
            conns.remove(conn_id);
        }
    }

    /// Drops a connection and every subscription it held.
    pub fn disconnect(&self, conn_id: &str) {
        self.channels.remove(conn_id);
        if let Some((_, keys)) = self.subscriptions.remove(conn_id) {
            for key in keys {
                if let Some(mut conns) = self.index.get_mut(&key) {
                    conns.remove(conn_id);
                }
            }
        }
    }

    /// Non-blocking fan-out to every subscriber of the key.
    pub fn publish(&self, key: SubscriptionKey, message: ChangeMessage) {
        let Some(conns) = self.index.get(&key).map(|c| c.value().clone()) else {
            return;
        };
        for conn_id in conns {
            let Some(tx) = self.channels.get(&conn_id).map(|t| t.value().clone()) else {
                continue;
            };
            if tx.try_send(message.clone()).is_err() {
                // Slow consumer: the message is dropped for this
                // subscriber only.
                debug!(conn_id = %conn_id, "notifier channel full, message dropped");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> UniversalAddress {
        let mut data = [0u8; 32];
        data[31] = byte;
        UniversalAddress::new(714, alloy_primitives::B256::from(data))
    }

    fn deposit_update(owner: UniversalAddress) -> ChangeMessage {
        ChangeMessage::DepositUpdate {
            owner,
            chain_id: 714,
            deposit_id: 1,
            amount: Amount::from_u64(100),
            used: false,
        }
    }

    #[tokio::test]
    async fn publish_reaches_only_matching_subscribers() {
        let notifier = ChangeNotifier::new();
        let mut rx_a = notifier.register("conn-a", 8);
        let mut rx_b = notifier.register("conn-b", 8);

        notifier.subscribe("conn-a", SubscriptionKey::DepositsByAddress(addr(1)));
        notifier.subscribe("conn-b", SubscriptionKey::DepositsByAddress(addr(2)));

        notifier.publish(
            SubscriptionKey::DepositsByAddress(addr(1)),
            deposit_update(addr(1)),
        );

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_channel_drops_without_blocking() {
        let notifier = ChangeNotifier::new();
        let mut rx = notifier.register("conn-a", 1);
        let key = SubscriptionKey::DepositsByAddress(addr(1));
        notifier.subscribe("conn-a", key);

        notifier.publish(key, deposit_update(addr(1)));
        notifier.publish(key, deposit_update(addr(1))); // dropped, no block

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_clears_reverse_index() {
        let notifier = ChangeNotifier::new();
        let _rx = notifier.register("conn-a", 4);
        let key = SubscriptionKey::CheckbooksByAddress(addr(1));
        notifier.subscribe("conn-a", key);
        notifier.disconnect("conn-a");

        assert_eq!(notifier.subscriber_count(), 0);
        // Publishing after disconnect is a no-op.
        notifier.publish(key, deposit_update(addr(1)));
    }
}
