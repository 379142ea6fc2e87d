//! Core domain types: universal addresses, amounts, intents, hashing.
//!
//! All amounts are non-negative big integers carried as `U256`, serialised
//! as decimal strings, and rendered as 32-byte big-endian buffers in proof
//! inputs. All addresses are normalised to the 32-byte universal form at
//! the service boundary; raw 20-byte EVM forms never reach storage.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use alloy_primitives::{keccak256, Address, B256, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;

/// SLIP-44 id of the management chain, where commitments and withdraw
/// requests are verified.
pub const MANAGEMENT_CHAIN_ID: u32 = 714;

/// Decimals every amount is normalised to before storage.
pub const MANAGEMENT_DECIMALS: u32 = 18;

/// The all-zero root terminating every queue-root chain.
pub const ZERO_ROOT: B256 = B256::ZERO;

// ---------------------------------------------------------------------------
// Universal address
// ---------------------------------------------------------------------------

/// Chain-qualified 32-byte address, the canonical in-memory and in-storage
/// address form. EVM addresses are left-padded into the data field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniversalAddress {
    pub chain_id: u32,
    pub data: B256,
}

impl UniversalAddress {
    pub fn new(chain_id: u32, data: B256) -> Self {
        Self { chain_id, data }
    }

    /// Wraps a 20-byte EVM address, left-padding to 32 bytes.
    pub fn from_evm(chain_id: u32, addr: Address) -> Self {
        let mut data = [0u8; 32];
        data[12..].copy_from_slice(addr.as_slice());
        Self {
            chain_id,
            data: B256::from(data),
        }
    }

    /// Parses either a 20-byte or a 32-byte 0x-hex string.
    pub fn parse(chain_id: u32, s: &str) -> Result<Self, TypeError> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        match stripped.len() {
            40 => {
                let addr =
                    Address::from_str(s).map_err(|_| TypeError::BadAddress(s.to_string()))?;
                Ok(Self::from_evm(chain_id, addr))
            }
            64 => {
                let data = B256::from_str(s).map_err(|_| TypeError::BadAddress(s.to_string()))?;
                Ok(Self { chain_id, data })
            }
            _ => Err(TypeError::BadAddress(s.to_string())),
        }
    }

    /// True if this is already the upgraded 32-byte form (any of the first
    /// twelve bytes set), as opposed to a padded EVM address.
    pub fn is_wide(&self) -> bool {
        self.data.as_slice()[..12].iter().any(|b| *b != 0)
    }

    /// Owner comparison: same chain, same bytes. Hex case differences are
    /// erased by parsing, so byte equality is the case-insensitive compare.
    pub fn same_owner(&self, other: &UniversalAddress) -> bool {
        self.chain_id == other.chain_id && self.data == other.data
    }
}

impl fmt::Display for UniversalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.data)
    }
}

// ---------------------------------------------------------------------------
// Amount
// ---------------------------------------------------------------------------

/// Non-negative big-integer amount. Stored as a decimal string, rendered
/// as 32-byte big-endian in proof inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Amount(pub U256);

impl Amount {
    pub const ZERO: Amount = Amount(U256::ZERO);

    pub fn from_u64(v: u64) -> Self {
        Amount(U256::from(v))
    }

    pub fn to_be_bytes32(&self) -> [u8; 32] {
        self.0.to_be_bytes::<32>()
    }

    pub fn checked_add(&self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Sums a slice, erroring on overflow.
    pub fn sum<'a, I: IntoIterator<Item = &'a Amount>>(amounts: I) -> Result<Amount, TypeError> {
        let mut acc = Amount::ZERO;
        for a in amounts {
            acc = acc.checked_add(*a).ok_or(TypeError::AmountOverflow)?;
        }
        Ok(acc)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        U256::from_str_radix(s, 10)
            .map(Amount)
            .map_err(|_| TypeError::BadAmount(s.to_string()))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Nullifier of one allocation: `keccak256(commitment ∥ seq ∥ amount_be32)`.
pub fn nullifier_hash(commitment: B256, seq: u8, amount: Amount) -> B256 {
    let mut buf = [0u8; 32 + 1 + 32];
    buf[..32].copy_from_slice(commitment.as_slice());
    buf[32] = seq;
    buf[33..].copy_from_slice(&amount.to_be_bytes32());
    keccak256(buf)
}

/// Leaf hash of one allocation inside its checkbook: `keccak256(seq ∥ amount_be32)`.
pub fn leaf_hash(seq: u8, amount: Amount) -> B256 {
    let mut buf = [0u8; 1 + 32];
    buf[0] = seq;
    buf[1..].copy_from_slice(&amount.to_be_bytes32());
    keccak256(buf)
}

/// Indexed-string hash used by chain events for token keys.
pub fn token_key_hash(symbol: &str) -> B256 {
    keccak256(symbol.as_bytes())
}

/// 32-byte big-endian rendering of a deposit id (8 bytes right-aligned).
pub fn deposit_id_be32(deposit_id: u64) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf[24..].copy_from_slice(&deposit_id.to_be_bytes());
    buf
}

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

/// Packed asset identifier: 4-byte chain id, 4-byte adapter id, 2-byte
/// token id, rest reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetId(pub B256);

impl AssetId {
    pub fn chain_id(&self) -> u32 {
        u32::from_be_bytes(self.0.as_slice()[..4].try_into().unwrap())
    }

    pub fn adapter_id(&self) -> u32 {
        u32::from_be_bytes(self.0.as_slice()[4..8].try_into().unwrap())
    }

    pub fn token_id(&self) -> u16 {
        u16::from_be_bytes(self.0.as_slice()[8..10].try_into().unwrap())
    }

    pub fn pack(chain_id: u32, adapter_id: u32, token_id: u16) -> Self {
        let mut buf = [0u8; 32];
        buf[..4].copy_from_slice(&chain_id.to_be_bytes());
        buf[4..8].copy_from_slice(&adapter_id.to_be_bytes());
        buf[8..10].copy_from_slice(&token_id.to_be_bytes());
        AssetId(B256::from(buf))
    }
}

/// How the destination chain settles the withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Intent {
    /// Plain transfer of the named token to the beneficiary.
    RawToken {
        beneficiary: UniversalAddress,
        #[serde(rename = "tokenSymbol")]
        token_symbol: String,
    },
    /// Deposit into the yield adapter identified by the packed asset id.
    AssetToken {
        #[serde(rename = "assetId")]
        asset_id: AssetId,
        beneficiary: UniversalAddress,
    },
}

impl Intent {
    /// Wire discriminant used in public values (0 = RawToken, 1 = AssetToken).
    pub fn intent_type(&self) -> u8 {
        match self {
            Intent::RawToken { .. } => 0,
            Intent::AssetToken { .. } => 1,
        }
    }

    pub fn beneficiary(&self) -> &UniversalAddress {
        match self {
            Intent::RawToken { beneficiary, .. } => beneficiary,
            Intent::AssetToken { beneficiary, .. } => beneficiary,
        }
    }

    /// Destination chain id: the beneficiary chain for raw transfers, the
    /// packed asset chain for adapter deposits.
    pub fn destination_chain_id(&self) -> u32 {
        match self {
            Intent::RawToken { beneficiary, .. } => beneficiary.chain_id,
            Intent::AssetToken { asset_id, .. } => asset_id.chain_id(),
        }
    }

    /// True when settlement involves a post-payout hook on the destination
    /// IntentManager.
    pub fn requires_hook(&self) -> bool {
        matches!(self, Intent::AssetToken { .. })
    }
}

/// User signature over a withdraw request, in the signing chain's native
/// scheme. Passed through to the prover verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultichainSignature {
    pub chain_id: u32,
    pub signature_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Decimal conversion
// ---------------------------------------------------------------------------

/// Scales raw chain amounts into the 18-decimal management form. Applied
/// exactly once, at event ingestion; the management amount is the canonical
/// stored value.
#[derive(Debug, Clone, Default)]
pub struct DecimalConverter {
    /// Decimals per `(chain_id, token_id)`; `token_id = None` is the chain
    /// default.
    table: HashMap<(u32, Option<u16>), u32>,
}

impl DecimalConverter {
    pub fn new(table: HashMap<(u32, Option<u16>), u32>) -> Self {
        Self { table }
    }

    fn decimals_for(&self, chain_id: u32, token_id: Option<u16>) -> u32 {
        if let Some(d) = self.table.get(&(chain_id, token_id)) {
            return *d;
        }
        if let Some(d) = self.table.get(&(chain_id, None)) {
            return *d;
        }
        MANAGEMENT_DECIMALS
    }

    pub fn to_management(
        &self,
        raw: Amount,
        source_chain_id: u32,
        token_id: Option<u16>,
    ) -> Result<Amount, TypeError> {
        let decimals = self.decimals_for(source_chain_id, token_id);
        if decimals == MANAGEMENT_DECIMALS {
            return Ok(raw);
        }
        if decimals < MANAGEMENT_DECIMALS {
            let factor = U256::from(10u64).pow(U256::from(MANAGEMENT_DECIMALS - decimals));
            raw.0
                .checked_mul(factor)
                .map(Amount)
                .ok_or(TypeError::AmountOverflow)
        } else {
            let factor = U256::from(10u64).pow(U256::from(decimals - MANAGEMENT_DECIMALS));
            Ok(Amount(raw.0 / factor))
        }
    }
}

// ---------------------------------------------------------------------------
// Chain-id mapping
// ---------------------------------------------------------------------------

/// SLIP-44 ↔ EVM chain-id bimap, sourced from the network config. Pollers
/// accept either form and try the counterpart when the supplied id is
/// unknown.
#[derive(Debug, Clone, Default)]
pub struct ChainIdMap {
    slip44_to_evm: HashMap<u32, u64>,
    evm_to_slip44: HashMap<u64, u32>,
}

impl ChainIdMap {
    pub fn insert(&mut self, slip44: u32, evm: u64) {
        self.slip44_to_evm.insert(slip44, evm);
        self.evm_to_slip44.insert(evm, slip44);
    }

    pub fn evm_of(&self, slip44: u32) -> Option<u64> {
        self.slip44_to_evm.get(&slip44).copied()
    }

    pub fn slip44_of(&self, evm: u64) -> Option<u32> {
        self.evm_to_slip44.get(&evm).copied()
    }

    /// Normalises an id that may be either form to SLIP-44.
    pub fn normalise(&self, id: u64) -> Option<u32> {
        let as_u32 = u32::try_from(id).ok();
        if let Some(s) = as_u32.filter(|s| self.slip44_to_evm.contains_key(s)) {
            return Some(s);
        }
        self.slip44_of(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universal_address_pads_evm_form() {
        let a = UniversalAddress::parse(60, "0x00000000000000000000000000000000000000aB").unwrap();
        assert!(!a.is_wide());
        assert_eq!(a.data.as_slice()[31], 0xab);

        let wide = UniversalAddress::parse(
            195,
            "0x0100000000000000000000000000000000000000000000000000000000000002",
        )
        .unwrap();
        assert!(wide.is_wide());
        assert!(UniversalAddress::parse(60, "0x1234").is_err());
    }

    #[test]
    fn owner_compare_erases_hex_case() {
        let lower = UniversalAddress::parse(60, "0xabcdef0000000000000000000000000000000001").unwrap();
        let upper = UniversalAddress::parse(60, "0xABCDEF0000000000000000000000000000000001").unwrap();
        assert!(lower.same_owner(&upper));
        let other_chain = UniversalAddress { chain_id: 714, ..lower };
        assert!(!lower.same_owner(&other_chain));
    }

    #[test]
    fn amount_decimal_round_trip() {
        let a: Amount = "1000000000000000000".parse().unwrap();
        assert_eq!(a.to_string(), "1000000000000000000");
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"1000000000000000000\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
        assert!("0x10".parse::<Amount>().is_err());
        assert!("-1".parse::<Amount>().is_err());
    }

    #[test]
    fn nullifier_is_commitment_seq_amount() {
        let commitment = B256::repeat_byte(0xc1);
        let amount = Amount::from_u64(5000);
        let n0 = nullifier_hash(commitment, 0, amount);
        let n1 = nullifier_hash(commitment, 1, amount);
        assert_ne!(n0, n1);

        let mut buf = Vec::new();
        buf.extend_from_slice(commitment.as_slice());
        buf.push(0);
        buf.extend_from_slice(&amount.to_be_bytes32());
        assert_eq!(n0, keccak256(&buf));
    }

    #[test]
    fn asset_id_unpacks_fields() {
        let id = AssetId::pack(60, 7, 2);
        assert_eq!(id.chain_id(), 60);
        assert_eq!(id.adapter_id(), 7);
        assert_eq!(id.token_id(), 2);
    }

    #[test]
    fn intent_tagged_serde() {
        let raw = Intent::RawToken {
            beneficiary: UniversalAddress::parse(60, "0x00000000000000000000000000000000000000aB")
                .unwrap(),
            token_symbol: "USDT".into(),
        };
        let json = serde_json::to_value(&raw).unwrap();
        assert_eq!(json["type"], "RawToken");
        assert_eq!(json["tokenSymbol"], "USDT");
        let back: Intent = serde_json::from_value(json).unwrap();
        assert_eq!(back, raw);
        assert_eq!(back.intent_type(), 0);
        assert!(!back.requires_hook());

        let asset = Intent::AssetToken {
            asset_id: AssetId::pack(60, 1, 9),
            beneficiary: *raw.beneficiary(),
        };
        assert_eq!(asset.intent_type(), 1);
        assert!(asset.requires_hook());
        assert_eq!(asset.destination_chain_id(), 60);
    }

    #[test]
    fn decimal_converter_scales_to_management() {
        let mut table = HashMap::new();
        table.insert((195u32, None), 6u32);
        table.insert((195u32, Some(2u16)), 8u32);
        table.insert((888u32, None), 24u32);
        let conv = DecimalConverter::new(table);

        // 6 → 18: multiply by 1e12
        let up = conv
            .to_management(Amount::from_u64(1_000_000), 195, None)
            .unwrap();
        assert_eq!(up.to_string(), "1000000000000000000");

        // per-token override: 8 → 18
        let tok = conv
            .to_management(Amount::from_u64(100_000_000), 195, Some(2))
            .unwrap();
        assert_eq!(tok.to_string(), "1000000000000000000");

        // 24 → 18: divide by 1e6
        let down = conv
            .to_management("1000000000000000000000000".parse().unwrap(), 888, None)
            .unwrap();
        assert_eq!(down.to_string(), "1000000000000000000");

        // unknown chain: pass-through at 18
        let same = conv.to_management(Amount::from_u64(42), 1, None).unwrap();
        assert_eq!(same, Amount::from_u64(42));
    }

    #[test]
    fn chain_id_map_normalises_both_forms() {
        let mut map = ChainIdMap::default();
        map.insert(714, 56);
        map.insert(60, 1);
        assert_eq!(map.normalise(714), Some(714));
        assert_eq!(map.normalise(56), Some(714));
        assert_eq!(map.normalise(1), Some(60));
        assert_eq!(map.normalise(999), None);
    }
}
