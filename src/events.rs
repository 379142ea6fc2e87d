//! Typed chain events delivered by the message bus.
//!
//! Envelopes deserialise strictly at the stream boundary: unknown event
//! names or malformed payloads are rejected before any handler runs.
//! The idempotency key is `(chain_id, tx_hash, log_index)`.

use std::fmt;

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::types::Amount;

/// Idempotency key of one event envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub chain_id: u32,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.chain_id, self.tx_hash, self.log_index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// SLIP-44 id of the emitting chain.
    pub chain_id: u32,
    pub contract_address: String,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_timestamp: u64,
    #[serde(flatten)]
    pub data: EventData,
}

impl EventEnvelope {
    pub fn key(&self) -> EventKey {
        EventKey {
            chain_id: self.chain_id,
            tx_hash: self.tx_hash,
            log_index: self.log_index,
        }
    }

    pub fn event_name(&self) -> &'static str {
        self.data.name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_name", content = "event_data")]
pub enum EventData {
    DepositReceived {
        deposit_id: u64,
        depositor: String,
        /// Raw amount in source-chain decimals; converted to management
        /// decimals exactly once at ingestion.
        amount: Amount,
        #[serde(default)]
        token_id: Option<u16>,
    },
    DepositRecorded {
        deposit_id: u64,
        /// keccak256 of the token symbol (indexed-string event argument).
        token_key_hash: B256,
        gross_amount: Amount,
        fee_total_locked: Amount,
        allocatable_amount: Amount,
        /// Possibly the upgraded 32-byte owner form.
        owner: String,
        #[serde(default)]
        token_id: Option<u16>,
    },
    DepositUsed {
        deposit_id: u64,
        commitment: B256,
    },
    CommitmentRootUpdated {
        old_root: B256,
        new_root: B256,
        commitment: B256,
    },
    WithdrawRequested {
        nullifier: B256,
        amount: Amount,
    },
    WithdrawExecuted {
        nullifier: B256,
        #[serde(default)]
        request_id: Option<String>,
    },
    IntentManagerWithdrawExecuted {
        nullifier: B256,
        #[serde(default)]
        request_id: Option<String>,
    },
    PayoutExecuted {
        nullifier: B256,
    },
    PayoutFailed {
        nullifier: B256,
        reason: String,
    },
    HookExecuted {
        nullifier: B256,
    },
    HookFailed {
        nullifier: B256,
        reason: String,
    },
    FallbackTransferred {
        nullifier: B256,
    },
    FallbackFailed {
        nullifier: B256,
        reason: String,
    },
    ManuallyResolved {
        nullifier: B256,
    },
    PayoutRetryRecordCreated {
        nullifier: B256,
    },
    FallbackRetryRecordCreated {
        nullifier: B256,
    },
}

impl EventData {
    pub fn name(&self) -> &'static str {
        match self {
            EventData::DepositReceived { .. } => "DepositReceived",
            EventData::DepositRecorded { .. } => "DepositRecorded",
            EventData::DepositUsed { .. } => "DepositUsed",
            EventData::CommitmentRootUpdated { .. } => "CommitmentRootUpdated",
            EventData::WithdrawRequested { .. } => "WithdrawRequested",
            EventData::WithdrawExecuted { .. } => "WithdrawExecuted",
            EventData::IntentManagerWithdrawExecuted { .. } => "IntentManagerWithdrawExecuted",
            EventData::PayoutExecuted { .. } => "PayoutExecuted",
            EventData::PayoutFailed { .. } => "PayoutFailed",
            EventData::HookExecuted { .. } => "HookExecuted",
            EventData::HookFailed { .. } => "HookFailed",
            EventData::FallbackTransferred { .. } => "FallbackTransferred",
            EventData::FallbackFailed { .. } => "FallbackFailed",
            EventData::ManuallyResolved { .. } => "ManuallyResolved",
            EventData::PayoutRetryRecordCreated { .. } => "PayoutRetryRecordCreated",
            EventData::FallbackRetryRecordCreated { .. } => "FallbackRetryRecordCreated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let raw = r#"{
            "chain_id": 714,
            "contract_address": "0x9999999999999999999999999999999999999999",
            "block_number": 1200,
            "tx_hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "log_index": 3,
            "block_timestamp": 1700000000,
            "event_name": "DepositUsed",
            "event_data": {
                "deposit_id": 42,
                "commitment": "0xc1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1"
            }
        }"#;
        let env: EventEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.event_name(), "DepositUsed");
        assert_eq!(env.key().to_string().split(':').next().unwrap(), "714");

        let back = serde_json::to_string(&env).unwrap();
        let env2: EventEnvelope = serde_json::from_str(&back).unwrap();
        assert_eq!(env2.key(), env.key());
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        let raw = r#"{
            "chain_id": 714,
            "contract_address": "0x9999999999999999999999999999999999999999",
            "block_number": 1,
            "tx_hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "log_index": 0,
            "block_timestamp": 1,
            "event_name": "SomethingElse",
            "event_data": {}
        }"#;
        assert!(serde_json::from_str::<EventEnvelope>(raw).is_err());
    }

    #[test]
    fn malformed_payload_is_rejected() {
        // DepositUsed without its commitment field.
        let raw = r#"{
            "chain_id": 714,
            "contract_address": "0x9999999999999999999999999999999999999999",
            "block_number": 1,
            "tx_hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "log_index": 0,
            "block_timestamp": 1,
            "event_name": "DepositUsed",
            "event_data": { "deposit_id": 42 }
        }"#;
        assert!(serde_json::from_str::<EventEnvelope>(raw).is_err());
    }
}
