//! ABI codec for prover public values and ZKPay contract calldata.
//!
//! The prover's `public_values` blob is stored verbatim and passed through
//! to the chain unchanged; this module only decodes it to read the fields
//! the backend keys on (the commitment for checkbooks, `nullifiers[0]`
//! for withdrawals).

use alloy_primitives::{Bytes, B256};
use alloy_sol_types::{sol, SolCall, SolValue};

use crate::error::ProverError;
use crate::types::Amount;

sol! {
    /// Public values accompanying a withdraw proof.
    struct WithdrawPublicValuesAbi {
        bytes32 commitmentRoot;
        bytes32[] nullifiers;
        uint256 amount;
        uint8 intentType;
        uint32 slip44ChainId;
        uint32 adapterId;
        string tokenKey;
        bytes32 beneficiaryData;
        bytes32 minOutput;
        uint32 sourceChainId;
        string sourceTokenKey;
    }

    /// Public values accompanying a checkbook commitment proof.
    struct CommitmentPublicValuesAbi {
        bytes32 commitment;
        uint256 allocatableAmount;
        uint32 slip44ChainId;
        string tokenKey;
    }

    function executeCommitment(bytes proof, bytes encodedPublicValues);
    function executeWithdraw(bytes proof, bytes encodedPublicValues);
}

/// Decoded withdraw public values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawPublicValues {
    pub commitment_root: B256,
    pub nullifiers: Vec<B256>,
    pub amount: Amount,
    pub intent_type: u8,
    pub slip44_chain_id: u32,
    pub adapter_id: u32,
    pub token_key: String,
    pub beneficiary_data: B256,
    pub min_output: B256,
    pub source_chain_id: u32,
    pub source_token_key: String,
}

impl WithdrawPublicValues {
    pub fn decode(data: &[u8]) -> Result<Self, ProverError> {
        if data.is_empty() {
            return Err(ProverError::EmptyPublicValues);
        }
        let abi = WithdrawPublicValuesAbi::abi_decode(data)
            .map_err(|e| ProverError::BadPublicValues(e.to_string()))?;
        if abi.nullifiers.is_empty() {
            return Err(ProverError::BadPublicValues(
                "withdraw public values carry no nullifiers".into(),
            ));
        }
        Ok(Self {
            commitment_root: abi.commitmentRoot,
            nullifiers: abi.nullifiers,
            amount: Amount(abi.amount),
            intent_type: abi.intentType,
            slip44_chain_id: abi.slip44ChainId,
            adapter_id: abi.adapterId,
            token_key: abi.tokenKey,
            beneficiary_data: abi.beneficiaryData,
            min_output: abi.minOutput,
            source_chain_id: abi.sourceChainId,
            source_token_key: abi.sourceTokenKey,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        WithdrawPublicValuesAbi {
            commitmentRoot: self.commitment_root,
            nullifiers: self.nullifiers.clone(),
            amount: self.amount.0,
            intentType: self.intent_type,
            slip44ChainId: self.slip44_chain_id,
            adapterId: self.adapter_id,
            tokenKey: self.token_key.clone(),
            beneficiaryData: self.beneficiary_data,
            minOutput: self.min_output,
            sourceChainId: self.source_chain_id,
            sourceTokenKey: self.source_token_key.clone(),
        }
        .abi_encode()
    }

    /// The authoritative withdraw nullifier: chain events key on this.
    pub fn first_nullifier(&self) -> B256 {
        self.nullifiers[0]
    }
}

/// Decoded checkbook commitment public values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentPublicValues {
    pub commitment: B256,
    pub allocatable_amount: Amount,
    pub slip44_chain_id: u32,
    pub token_key: String,
}

impl CommitmentPublicValues {
    pub fn decode(data: &[u8]) -> Result<Self, ProverError> {
        if data.is_empty() {
            return Err(ProverError::EmptyPublicValues);
        }
        let abi = CommitmentPublicValuesAbi::abi_decode(data)
            .map_err(|e| ProverError::BadPublicValues(e.to_string()))?;
        Ok(Self {
            commitment: abi.commitment,
            allocatable_amount: Amount(abi.allocatableAmount),
            slip44_chain_id: abi.slip44ChainId,
            token_key: abi.tokenKey,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        CommitmentPublicValuesAbi {
            commitment: self.commitment,
            allocatableAmount: self.allocatable_amount.0,
            slip44ChainId: self.slip44_chain_id,
            tokenKey: self.token_key.clone(),
        }
        .abi_encode()
    }
}

/// `executeCommitment(proof, encodedPublicValues)` calldata.
pub fn encode_execute_commitment(proof: &[u8], public_values: &[u8]) -> Vec<u8> {
    executeCommitmentCall {
        proof: Bytes::copy_from_slice(proof),
        encodedPublicValues: Bytes::copy_from_slice(public_values),
    }
    .abi_encode()
}

/// `executeWithdraw(proof, encodedPublicValues)` calldata.
pub fn encode_execute_withdraw(proof: &[u8], public_values: &[u8]) -> Vec<u8> {
    executeWithdrawCall {
        proof: Bytes::copy_from_slice(proof),
        encodedPublicValues: Bytes::copy_from_slice(public_values),
    }
    .abi_encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    fn sample_withdraw() -> WithdrawPublicValues {
        WithdrawPublicValues {
            commitment_root: B256::repeat_byte(0x10),
            nullifiers: vec![B256::repeat_byte(0xaa), B256::repeat_byte(0xbb)],
            amount: Amount(U256::from(2_000_000_000_000_000_000u128)),
            intent_type: 1,
            slip44_chain_id: 714,
            adapter_id: 7,
            token_key: "USDT".into(),
            beneficiary_data: B256::repeat_byte(0x01),
            min_output: B256::ZERO,
            source_chain_id: 195,
            source_token_key: "TRX-USDT".into(),
        }
    }

    #[test]
    fn withdraw_public_values_round_trip() {
        let pv = sample_withdraw();
        let encoded = pv.encode();
        let decoded = WithdrawPublicValues::decode(&encoded).unwrap();
        assert_eq!(decoded, pv);
        assert_eq!(decoded.first_nullifier(), B256::repeat_byte(0xaa));
    }

    #[test]
    fn empty_or_garbage_public_values_fail() {
        assert!(matches!(
            WithdrawPublicValues::decode(&[]),
            Err(ProverError::EmptyPublicValues)
        ));
        assert!(matches!(
            WithdrawPublicValues::decode(&[0u8; 7]),
            Err(ProverError::BadPublicValues(_))
        ));
    }

    #[test]
    fn nullifier_free_public_values_are_rejected() {
        let mut pv = sample_withdraw();
        pv.nullifiers.clear();
        let encoded = pv.encode();
        assert!(matches!(
            WithdrawPublicValues::decode(&encoded),
            Err(ProverError::BadPublicValues(_))
        ));
    }

    #[test]
    fn commitment_public_values_round_trip() {
        let pv = CommitmentPublicValues {
            commitment: B256::repeat_byte(0xc1),
            allocatable_amount: Amount(U256::from(10u64).pow(U256::from(18u64))),
            slip44_chain_id: 714,
            token_key: "USDT".into(),
        };
        let decoded = CommitmentPublicValues::decode(&pv.encode()).unwrap();
        assert_eq!(decoded, pv);
    }

    #[test]
    fn execute_calldata_carries_selector() {
        let data = encode_execute_withdraw(&[1, 2, 3], &[4, 5]);
        assert_eq!(&data[..4], executeWithdrawCall::SELECTOR.as_slice());
        let decoded = executeWithdrawCall::abi_decode(&data).unwrap();
        assert_eq!(decoded.proof.as_ref(), &[1, 2, 3]);
        assert_eq!(decoded.encodedPublicValues.as_ref(), &[4, 5]);
    }
}
