//! HTTP client for the external block scanner.
//!
//! The scanner is the source of truth for historic `CommitmentRootUpdated`
//! events (queue-root backfill) and for nullifier-consumption audits
//! during recovery.

use std::future::Future;
use std::time::Duration;

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::error::ScannerError;

/// One historic root transition as the scanner saw it on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootUpdate {
    pub old_root: B256,
    pub new_root: B256,
    pub commitment: B256,
    pub block_number: u64,
}

/// Backward lookups against the scanner, behind a trait so the queue-root
/// manager is testable without HTTP.
pub trait RootScanner: Send + Sync + 'static {
    fn root_updated_by_new_root(
        &self,
        root: B256,
        chain_id: u32,
    ) -> impl Future<Output = Result<RootUpdate, ScannerError>> + Send;
}

/// Nullifier-consumption audit used by startup recovery before resuming a
/// withdraw submission.
pub trait NullifierAudit: Send + Sync + 'static {
    fn nullifier_used(
        &self,
        chain_id: u32,
        nullifier: B256,
    ) -> impl Future<Output = Result<bool, ScannerError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ScannerClient {
    base_url: String,
    http: reqwest::Client,
}

impl ScannerClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ScannerError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| ScannerError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ScannerError::Status(status.as_u16(), body));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ScannerError::Http(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct RootUpdateResponse {
    update: Option<RootUpdate>,
}

#[derive(Debug, Deserialize)]
struct NullifierUsedResponse {
    used: bool,
}

impl RootScanner for ScannerClient {
    async fn root_updated_by_new_root(
        &self,
        root: B256,
        chain_id: u32,
    ) -> Result<RootUpdate, ScannerError> {
        let resp: RootUpdateResponse = self
            .get_json(
                "/v1/commitment-root-updated",
                &[
                    ("new_root", root.to_string()),
                    ("chain_id", chain_id.to_string()),
                ],
            )
            .await?;
        resp.update
            .ok_or_else(|| ScannerError::UnknownRoot(root.to_string()))
    }
}

impl NullifierAudit for ScannerClient {
    async fn nullifier_used(&self, chain_id: u32, nullifier: B256) -> Result<bool, ScannerError> {
        let resp: NullifierUsedResponse = self
            .get_json(
                "/v1/nullifier-used",
                &[
                    ("chain_id", chain_id.to_string()),
                    ("nullifier", nullifier.to_string()),
                ],
            )
            .await?;
        Ok(resp.used)
    }
}
