//! EIP-155 legacy transaction assembly and signing.
//!
//! Only legacy transactions are emitted. The signing hash covers
//! `(nonce, gas_price, gas_limit, to, value, data, chain_id, 0, 0)`;
//! the signature strategy is a trait so key custody stays with the
//! external key manager (raw-key signing is implemented, KMS is an
//! external interface).

use std::future::Future;

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_rlp::{Encodable, Header};
use k256::ecdsa::{RecoveryId, SigningKey, VerifyingKey};
use thiserror::Error;

use crate::chain_client::ChainRpc;
use crate::config::GasPrice;
use crate::error::RpcError;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("invalid key material: {0}")]
    Key(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("recovered sender {recovered} does not match signer {expected}")]
    SenderMismatch { recovered: Address, expected: Address },
}

/// Unsigned EIP-155 legacy transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

/// Recoverable secp256k1 signature with the raw recovery id (0/1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub r: U256,
    pub s: U256,
    pub recovery_id: u8,
}

impl LegacyTx {
    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.nonce.encode(out);
        self.gas_price.encode(out);
        self.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.data.as_slice().encode(out);
    }

    fn fields_length(&self) -> usize {
        self.nonce.length()
            + self.gas_price.length()
            + self.gas_limit.length()
            + self.to.length()
            + self.value.length()
            + self.data.as_slice().length()
    }

    /// keccak256 of the EIP-155 signing payload.
    pub fn signing_hash(&self) -> B256 {
        let payload_length = self.fields_length() + self.chain_id.length() + 2 * 0u8.length();
        let mut out = Vec::with_capacity(payload_length + 8);
        Header {
            list: true,
            payload_length,
        }
        .encode(&mut out);
        self.encode_fields(&mut out);
        self.chain_id.encode(&mut out);
        0u8.encode(&mut out);
        0u8.encode(&mut out);
        keccak256(&out)
    }

    /// RLP of the signed transaction, ready for `eth_sendRawTransaction`.
    pub fn encode_signed(&self, sig: &RecoverableSignature) -> Vec<u8> {
        let v = self.chain_id * 2 + 35 + sig.recovery_id as u64;
        let payload_length = self.fields_length() + v.length() + sig.r.length() + sig.s.length();
        let mut out = Vec::with_capacity(payload_length + 8);
        Header {
            list: true,
            payload_length,
        }
        .encode(&mut out);
        self.encode_fields(&mut out);
        v.encode(&mut out);
        sig.r.encode(&mut out);
        sig.s.encode(&mut out);
        out
    }
}

// ---------------------------------------------------------------------------
// Signer strategies
// ---------------------------------------------------------------------------

pub trait TxSigner: Send + Sync + 'static {
    fn address(&self) -> Address;

    fn sign_hash(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<RecoverableSignature, SignError>> + Send;
}

/// Raw-key signing strategy.
pub struct LocalKeySigner {
    key: SigningKey,
    address: Address,
}

impl LocalKeySigner {
    pub fn from_hex(hex_key: &str) -> Result<Self, SignError> {
        let stripped = hex_key.strip_prefix("0x").unwrap_or(hex_key);
        let bytes = hex::decode(stripped).map_err(|e| SignError::Key(e.to_string()))?;
        let key = SigningKey::from_slice(&bytes).map_err(|e| SignError::Key(e.to_string()))?;
        let address = Address::from_public_key(key.verifying_key());
        Ok(Self { key, address })
    }
}

impl TxSigner for LocalKeySigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_hash(&self, hash: B256) -> Result<RecoverableSignature, SignError> {
        let (sig, recid) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|e| SignError::Signing(e.to_string()))?;
        // Chains reject high-s signatures; normalising flips the parity.
        let (sig, recid) = match sig.normalize_s() {
            Some(normalized) => (
                normalized,
                RecoveryId::from_byte(recid.to_byte() ^ 1)
                    .ok_or_else(|| SignError::Signing("recovery id out of range".into()))?,
            ),
            None => (sig, recid),
        };
        let (r_bytes, s_bytes) = sig.split_bytes();
        Ok(RecoverableSignature {
            r: U256::from_be_slice(r_bytes.as_slice()),
            s: U256::from_be_slice(s_bytes.as_slice()),
            recovery_id: recid.to_byte(),
        })
    }
}

/// Verifies that the signature recovers to the expected sender.
pub fn verify_sender(
    hash: B256,
    sig: &RecoverableSignature,
    expected: Address,
) -> Result<(), SignError> {
    let mut sig_bytes = [0u8; 64];
    sig_bytes[..32].copy_from_slice(&sig.r.to_be_bytes::<32>());
    sig_bytes[32..].copy_from_slice(&sig.s.to_be_bytes::<32>());
    let signature = k256::ecdsa::Signature::from_slice(&sig_bytes)
        .map_err(|e| SignError::Signing(e.to_string()))?;
    let recid = RecoveryId::from_byte(sig.recovery_id)
        .ok_or_else(|| SignError::Signing("recovery id out of range".into()))?;
    let key = VerifyingKey::recover_from_prehash(hash.as_slice(), &signature, recid)
        .map_err(|e| SignError::Signing(e.to_string()))?;
    let recovered = Address::from_public_key(&key);
    if recovered != expected {
        return Err(SignError::SenderMismatch {
            recovered,
            expected,
        });
    }
    Ok(())
}

/// Resolves the configured gas price policy: fixed wei, or the RPC
/// suggestion with 20% headroom.
pub async fn resolve_gas_price<R: ChainRpc>(rpc: &R, policy: GasPrice) -> Result<u128, RpcError> {
    match policy {
        GasPrice::Fixed(wei) => Ok(wei),
        GasPrice::Auto => {
            let suggested = rpc.suggest_gas_price().await?;
            Ok(suggested.saturating_add(suggested / 5))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    /// The worked example from the EIP-155 specification.
    fn eip155_example() -> LegacyTx {
        LegacyTx {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: Address::from_str("0x3535353535353535353535353535353535353535").unwrap(),
            value: U256::from(1_000_000_000_000_000_000u128),
            data: vec![],
            chain_id: 1,
        }
    }

    #[test]
    fn eip155_signing_hash_matches_reference() {
        let tx = eip155_example();
        assert_eq!(
            tx.signing_hash().to_string(),
            "0xdaf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[tokio::test]
    async fn eip155_signature_matches_reference() {
        let signer = LocalKeySigner::from_hex(
            "0x4646464646464646464646464646464646464646464646464646464646464646",
        )
        .unwrap();
        assert_eq!(
            signer.address().to_string().to_lowercase(),
            "0x9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f"
        );

        let tx = eip155_example();
        let sig = signer.sign_hash(tx.signing_hash()).await.unwrap();
        assert_eq!(
            sig.r,
            U256::from_str_radix(
                "28ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276",
                16
            )
            .unwrap()
        );
        assert_eq!(
            sig.s,
            U256::from_str_radix(
                "67cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83",
                16
            )
            .unwrap()
        );
        // v = chain_id * 2 + 35 + recovery_id = 37 in the reference.
        assert_eq!(sig.recovery_id, 0);

        verify_sender(tx.signing_hash(), &sig, signer.address()).unwrap();
    }

    #[tokio::test]
    async fn tampered_signature_fails_sender_check() {
        let signer = LocalKeySigner::from_hex(
            "0x4646464646464646464646464646464646464646464646464646464646464646",
        )
        .unwrap();
        let tx = eip155_example();
        let mut sig = signer.sign_hash(tx.signing_hash()).await.unwrap();
        sig.recovery_id ^= 1;
        assert!(verify_sender(tx.signing_hash(), &sig, signer.address()).is_err());
    }

    #[test]
    fn signed_encoding_is_canonical_rlp() {
        let tx = eip155_example();
        let sig = RecoverableSignature {
            r: U256::from(1u64),
            s: U256::from(2u64),
            recovery_id: 0,
        };
        let raw = tx.encode_signed(&sig);
        // List header present and v lands at chain_id*2+35.
        assert!(raw[0] >= 0xc0);
        assert!(raw.ends_with(&[37, 1, 2]));
    }

    #[test]
    fn bad_key_material_is_rejected() {
        assert!(LocalKeySigner::from_hex("0x1234").is_err());
        assert!(LocalKeySigner::from_hex("zz").is_err());
    }
}
