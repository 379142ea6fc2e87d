//! HTTP client for the external ZKVM prover.
//!
//! Two endpoints: `BuildCommitment` for checkbook proofs and
//! `GenerateWithdrawProofV2` for withdraw proofs. Proof bytes cross the
//! wire as base64; the returned `public_values` blob is stored verbatim
//! and later passed to the chain unchanged.

use std::future::Future;
use std::time::Duration;

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::entities::CheckbookId;
use crate::error::ProverError;
use crate::types::{Amount, Intent, MultichainSignature, UniversalAddress};

/// Serde helper: `Vec<u8>` as standard base64.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// One allocation leaf of a checkbook, in seq order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLeaf {
    pub seq: u8,
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentProofRequest {
    pub chain_id: u32,
    pub deposit_id: u64,
    pub token_key: String,
    pub allocatable_amount: Amount,
    pub owner: UniversalAddress,
    pub allocations: Vec<AllocationLeaf>,
}

/// Membership witness for one selected allocation: the leaf hashes
/// strictly before and after its position within the checkbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub left_hashes: Vec<B256>,
    pub right_hashes: Vec<B256>,
    /// 32-byte big-endian deposit id (8 bytes right-aligned).
    pub deposit_id: B256,
    pub chain_id: u32,
    pub token_key: String,
    pub seq: u8,
    pub amount: Amount,
}

/// Per-checkbook grouping of selected allocations plus the queue-root
/// neighbourhood of its commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentGroup {
    pub checkbook_id: CheckbookId,
    pub commitment: B256,
    /// All-zero on the genesis commitment.
    pub root_before_commitment: B256,
    pub commitments_after: Vec<B256>,
    pub credentials: Vec<Credential>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawProofRequest {
    pub owner: UniversalAddress,
    pub intent: Intent,
    pub signature: MultichainSignature,
    pub commitment_groups: Vec<CommitmentGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_output: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain_names: Vec<String>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofResponse {
    #[serde(with = "base64_bytes")]
    pub proof: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub public_values: Vec<u8>,
}

impl ProofResponse {
    /// The prover protocol guarantees non-empty artifacts; anything else
    /// is a protocol violation that fails the proof stage.
    pub fn validate(&self) -> Result<(), ProverError> {
        if self.proof.is_empty() {
            return Err(ProverError::EmptyProof);
        }
        if self.public_values.is_empty() {
            return Err(ProverError::EmptyPublicValues);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawProofResponse {
    #[serde(flatten)]
    pub artifact: ProofResponse,
    /// The returned `nullifiers[0]` is the authoritative withdraw
    /// nullifier.
    pub nullifiers: Vec<B256>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub trait Prover: Send + Sync + 'static {
    fn build_commitment(
        &self,
        request: &CommitmentProofRequest,
    ) -> impl Future<Output = Result<ProofResponse, ProverError>> + Send;

    fn generate_withdraw_proof(
        &self,
        request: &WithdrawProofRequest,
    ) -> impl Future<Output = Result<WithdrawProofResponse, ProverError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ProverClient {
    base_url: String,
    http: reqwest::Client,
}

impl ProverClient {
    pub fn new(base_url: &str) -> Self {
        // Proving is slow; the client timeout covers the full request.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn post_json<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp, ProverError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ProverError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProverError::Status(status.as_u16(), body));
        }
        resp.json::<Resp>()
            .await
            .map_err(|e| ProverError::Http(e.to_string()))
    }
}

impl Prover for ProverClient {
    async fn build_commitment(
        &self,
        request: &CommitmentProofRequest,
    ) -> Result<ProofResponse, ProverError> {
        let resp: ProofResponse = self.post_json("/v1/build-commitment", request).await?;
        resp.validate()?;
        Ok(resp)
    }

    async fn generate_withdraw_proof(
        &self,
        request: &WithdrawProofRequest,
    ) -> Result<WithdrawProofResponse, ProverError> {
        let resp: WithdrawProofResponse = self
            .post_json("/v1/generate-withdraw-proof-v2", request)
            .await?;
        resp.artifact.validate()?;
        if resp.nullifiers.is_empty() {
            return Err(ProverError::BadPublicValues(
                "withdraw proof carries no nullifiers".into(),
            ));
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_response_base64_round_trip() {
        let resp = ProofResponse {
            proof: vec![1, 2, 3, 255],
            public_values: vec![9, 8],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("AQID/w=="));
        let back: ProofResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.proof, resp.proof);
        assert_eq!(back.public_values, resp.public_values);
    }

    #[test]
    fn empty_artifacts_are_protocol_violations() {
        let empty_proof = ProofResponse {
            proof: vec![],
            public_values: vec![1],
        };
        assert!(matches!(empty_proof.validate(), Err(ProverError::EmptyProof)));

        let empty_values = ProofResponse {
            proof: vec![1],
            public_values: vec![],
        };
        assert!(matches!(
            empty_values.validate(),
            Err(ProverError::EmptyPublicValues)
        ));
    }

    #[test]
    fn withdraw_response_flattens_artifact() {
        let raw = r#"{
            "proof": "AQID",
            "public_values": "BAUG",
            "nullifiers": ["0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"]
        }"#;
        let resp: WithdrawProofResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.artifact.proof, vec![1, 2, 3]);
        assert_eq!(resp.nullifiers.len(), 1);
    }
}
