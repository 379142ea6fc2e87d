use std::collections::HashMap;
use std::env;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{ChainIdMap, DecimalConverter, MANAGEMENT_CHAIN_ID};

/// How transactions for a network are signed. Key material itself is
/// mediated by the external key manager; the backend only carries the
/// alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMethod {
    PrivateKey,
    Kms,
}

/// Gas price policy: ask the RPC (× 1.2 headroom) or pin a fixed wei value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "wei")]
pub enum GasPrice {
    Auto,
    Fixed(u128),
}

/// Gas limit applied to submissions when the RPC estimate is not used.
pub const DEFAULT_GAS_LIMIT: u64 = 1_500_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// SLIP-44 chain id, the canonical id throughout the backend.
    pub chain_id: u32,
    pub evm_chain_id: u64,
    /// Ordered endpoint list; a failed primary rotates to the next.
    pub rpc_endpoints: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub signing_method: SigningMethod,
    pub key_alias: String,
    #[serde(default = "default_gas_price")]
    pub gas_price: GasPrice,
    /// 0 selects `DEFAULT_GAS_LIMIT`.
    #[serde(default)]
    pub gas_limit: u64,
    pub zkpay_contract: Address,
}

fn default_true() -> bool {
    true
}

fn default_gas_price() -> GasPrice {
    GasPrice::Auto
}

impl NetworkConfig {
    pub fn effective_gas_limit(&self) -> u64 {
        if self.gas_limit == 0 {
            DEFAULT_GAS_LIMIT
        } else {
            self.gas_limit
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDecimals {
    pub chain_id: u32,
    #[serde(default)]
    pub token_id: Option<u16>,
    pub decimals: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Ops surface
    pub host: String,
    pub port: u16,

    // External services
    pub prover_url: String,
    pub scanner_url: String,

    pub management_chain_id: u32,
    /// Runtime override for the management-chain ZKPay proxy. Other
    /// chains always use their per-network address.
    pub zkpay_proxy_override: Option<Address>,

    pub networks: Vec<NetworkConfig>,
    pub token_decimals: Vec<TokenDecimals>,

    /// Symbols whose indexed-string hashes the event processor can resolve.
    pub known_tokens: Vec<String>,

    /// Allocations minted per checkbook (seq 0..n-1).
    pub allocations_per_checkbook: u8,

    /// Accelerated receipt probe delays after withdraw submission.
    pub probe_delays_secs: Vec<u64>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let prover_url = require_env("ZKPAY_PROVER_URL")?;
        validate_service_url(&prover_url, "ZKPAY_PROVER_URL")?;
        let scanner_url = require_env("ZKPAY_SCANNER_URL")?;
        validate_service_url(&scanner_url, "ZKPAY_SCANNER_URL")?;

        let networks_raw = require_env("ZKPAY_NETWORKS")?;
        let networks: Vec<NetworkConfig> = serde_json::from_str(&networks_raw)
            .map_err(|e| ConfigError::Invalid("ZKPAY_NETWORKS".into(), e.to_string()))?;
        if networks.is_empty() {
            return Err(ConfigError::Invalid(
                "ZKPAY_NETWORKS".into(),
                "at least one network is required".into(),
            ));
        }
        for net in &networks {
            if net.rpc_endpoints.is_empty() {
                return Err(ConfigError::Invalid(
                    "ZKPAY_NETWORKS".into(),
                    format!("network {} has no rpc endpoints", net.chain_id),
                ));
            }
            if net.zkpay_contract == Address::ZERO {
                return Err(ConfigError::Invalid(
                    "ZKPAY_NETWORKS".into(),
                    format!("network {} has a zero ZKPay contract", net.chain_id),
                ));
            }
        }

        let management_chain_id = parse_env_or("ZKPAY_MANAGEMENT_CHAIN", MANAGEMENT_CHAIN_ID)?;
        if !networks.iter().any(|n| n.chain_id == management_chain_id) {
            return Err(ConfigError::Invalid(
                "ZKPAY_MANAGEMENT_CHAIN".into(),
                format!("management chain {management_chain_id} is not in ZKPAY_NETWORKS"),
            ));
        }

        let token_decimals: Vec<TokenDecimals> = match env::var("ZKPAY_TOKEN_DECIMALS") {
            Ok(raw) if !raw.is_empty() => serde_json::from_str(&raw)
                .map_err(|e| ConfigError::Invalid("ZKPAY_TOKEN_DECIMALS".into(), e.to_string()))?,
            _ => Vec::new(),
        };

        let known_tokens: Vec<String> = env::var("ZKPAY_KNOWN_TOKENS")
            .unwrap_or_else(|_| "USDT,USDC,ETH,BNB,TRX".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let zkpay_proxy_override = match env::var("ZKPAY_PROXY_OVERRIDE") {
            Ok(raw) if !raw.is_empty() => Some(raw.parse::<Address>().map_err(|_| {
                ConfigError::Invalid(
                    "ZKPAY_PROXY_OVERRIDE".into(),
                    "must be a 20-byte hex address".into(),
                )
            })?),
            _ => None,
        };

        let allocations_per_checkbook: u8 = parse_env_or("ZKPAY_ALLOCATIONS_PER_CHECKBOOK", 16)?;
        if allocations_per_checkbook == 0 {
            return Err(ConfigError::Invalid(
                "ZKPAY_ALLOCATIONS_PER_CHECKBOOK".into(),
                "must be > 0".into(),
            ));
        }

        Ok(Self {
            host: env::var("ZKPAY_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parse_env_or("ZKPAY_PORT", 3090)?,
            prover_url,
            scanner_url,
            management_chain_id,
            zkpay_proxy_override,
            networks,
            token_decimals,
            known_tokens,
            allocations_per_checkbook,
            probe_delays_secs: vec![2, 5, 10],
        })
    }

    pub fn network(&self, chain_id: u32) -> Option<&NetworkConfig> {
        self.networks
            .iter()
            .find(|n| n.chain_id == chain_id && n.enabled)
    }

    pub fn management_network(&self) -> &NetworkConfig {
        // Presence is validated in from_env.
        self.networks
            .iter()
            .find(|n| n.chain_id == self.management_chain_id)
            .expect("management network validated at startup")
    }

    /// ZKPay contract for a chain. The runtime override applies to the
    /// management chain only.
    pub fn zkpay_contract_for(&self, chain_id: u32) -> Option<Address> {
        if chain_id == self.management_chain_id {
            if let Some(addr) = self.zkpay_proxy_override {
                return Some(addr);
            }
        }
        self.network(chain_id).map(|n| n.zkpay_contract)
    }

    pub fn decimal_converter(&self) -> DecimalConverter {
        let mut table = HashMap::new();
        for entry in &self.token_decimals {
            table.insert((entry.chain_id, entry.token_id), entry.decimals);
        }
        DecimalConverter::new(table)
    }

    pub fn chain_id_map(&self) -> ChainIdMap {
        let mut map = ChainIdMap::default();
        for net in &self.networks {
            map.insert(net.chain_id, net.evm_chain_id);
        }
        map
    }

    /// Raw key material for a network's signer alias, from the key
    /// manager's env handoff (`ZKPAY_KEY_<ALIAS>`, hex).
    pub fn signer_key_hex(&self, alias: &str) -> Result<String, ConfigError> {
        let var = format!("ZKPAY_KEY_{}", alias.to_ascii_uppercase());
        require_env(&var)
    }
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    env::var(name)
        .map_err(|_| ConfigError::Missing(name.into()))
        .and_then(|v| {
            if v.is_empty() {
                Err(ConfigError::Missing(name.into()))
            } else {
                Ok(v)
            }
        })
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name.into(), format!("could not parse '{v}'"))),
        _ => Ok(default),
    }
}

fn validate_service_url(url: &str, name: &str) -> Result<(), ConfigError> {
    let lower = url.to_lowercase();
    if lower.starts_with("https://") {
        return Ok(());
    }
    if lower.starts_with("http://") {
        let host_part = lower.trim_start_matches("http://");
        if host_part.starts_with("localhost")
            || host_part.starts_with("127.0.0.1")
            || host_part.starts_with("[::1]")
        {
            return Ok(());
        }
        return Err(ConfigError::Invalid(
            name.into(),
            "must use HTTPS for non-localhost URLs".into(),
        ));
    }
    Err(ConfigError::Invalid(
        name.into(),
        "must start with https:// (or http:// for localhost)".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(chain_id: u32, evm: u64) -> NetworkConfig {
        NetworkConfig {
            chain_id,
            evm_chain_id: evm,
            rpc_endpoints: vec!["https://rpc.example".into()],
            enabled: true,
            signing_method: SigningMethod::PrivateKey,
            key_alias: "ops".into(),
            gas_price: GasPrice::Auto,
            gas_limit: 0,
            zkpay_contract: Address::repeat_byte(0x11),
        }
    }

    fn config_with(networks: Vec<NetworkConfig>) -> Config {
        Config {
            host: "0.0.0.0".into(),
            port: 3090,
            prover_url: "http://localhost:9100".into(),
            scanner_url: "http://localhost:9200".into(),
            management_chain_id: 714,
            zkpay_proxy_override: None,
            networks,
            token_decimals: vec![TokenDecimals {
                chain_id: 195,
                token_id: None,
                decimals: 6,
            }],
            known_tokens: vec!["USDT".into()],
            allocations_per_checkbook: 16,
            probe_delays_secs: vec![2, 5, 10],
        }
    }

    #[test]
    fn proxy_override_is_management_chain_only() {
        let mut cfg = config_with(vec![network(714, 56), network(60, 1)]);
        let override_addr = Address::repeat_byte(0xaa);
        cfg.zkpay_proxy_override = Some(override_addr);

        assert_eq!(cfg.zkpay_contract_for(714), Some(override_addr));
        assert_eq!(cfg.zkpay_contract_for(60), Some(Address::repeat_byte(0x11)));
        assert_eq!(cfg.zkpay_contract_for(999), None);
    }

    #[test]
    fn disabled_networks_are_invisible() {
        let mut net = network(60, 1);
        net.enabled = false;
        let cfg = config_with(vec![network(714, 56), net]);
        assert!(cfg.network(60).is_none());
        assert!(cfg.network(714).is_some());
    }

    #[test]
    fn gas_limit_zero_selects_default() {
        let net = network(714, 56);
        assert_eq!(net.effective_gas_limit(), DEFAULT_GAS_LIMIT);
        let fixed = NetworkConfig {
            gas_limit: 800_000,
            ..net
        };
        assert_eq!(fixed.effective_gas_limit(), 800_000);
    }

    #[test]
    fn network_json_shape() {
        let raw = r#"{
            "chain_id": 714,
            "evm_chain_id": 56,
            "rpc_endpoints": ["https://bsc.example"],
            "signing_method": "private_key",
            "key_alias": "mgmt",
            "zkpay_contract": "0x1111111111111111111111111111111111111111"
        }"#;
        let net: NetworkConfig = serde_json::from_str(raw).unwrap();
        assert!(net.enabled);
        assert_eq!(net.gas_price, GasPrice::Auto);
        assert_eq!(net.effective_gas_limit(), DEFAULT_GAS_LIMIT);
    }
}
