//! Core protocol types shared across the engine, flows, and adapter contracts.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::SwapError;

/// Ledger amount in base units (satoshi/wei style).
pub type Amount = primitive_types::U256;

/// Lowercase asset ticker (e.g. "btc", "eth").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Asset(String);

impl Asset {
    /// Creates an asset from a ticker. Tickers are normalized to lowercase.
    pub fn new(ticker: &str) -> Result<Self, SwapError> {
        if ticker.is_empty() || !ticker.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SwapError::Construction(format!(
                "invalid asset ticker {:?}",
                ticker
            )));
        }
        Ok(Self(ticker.to_ascii_lowercase()))
    }

    pub fn ticker(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Directed currency pair: the asset this party sells and the asset it buys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetPair {
    pub sell: Asset,
    pub buy: Asset,
}

impl AssetPair {
    pub fn new(sell: Asset, buy: Asset) -> Result<Self, SwapError> {
        if sell == buy {
            return Err(SwapError::Construction(format!(
                "cannot swap {} for itself",
                sell
            )));
        }
        Ok(Self { sell, buy })
    }
}

impl fmt::Display for AssetPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}2{}", self.sell, self.buy)
    }
}

/// Which side of the handshake this party plays.
///
/// The owner generates the secret and locks the UTXO-style script first; the
/// participant locks the account/contract leg second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Participant,
}

/// Broadcast transaction identifier, chain-format agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub String);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger address, chain-format agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public key participating in a UTXO-style lock script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(pub String);

/// Random 32-byte preimage known initially only to the owner side.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(#[serde(with = "hex_bytes")] pub [u8; 32]);

impl Secret {
    /// Generates a fresh random secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// One-way hash of the secret; the value both locks are keyed by.
    pub fn hash(&self) -> SecretHash {
        let digest = Sha256::digest(self.0);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        SecretHash(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, SwapError> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| SwapError::Construction(format!("invalid secret hex: {}", e)))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| SwapError::Construction("secret must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Secret {
    // Never leak the preimage through logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// SHA-256 hash of a [`Secret`].
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretHash(#[serde(with = "hex_bytes")] pub [u8; 32]);

impl SecretHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHash({})", self.to_hex())
    }
}

impl fmt::Display for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Parameter set defining one UTXO-style lock instance.
///
/// Immutable once created; shared with the counterpart over the message channel.
/// `lock_time` is an absolute unix-seconds expiry beyond which only the original
/// locker may reclaim the funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptValues {
    pub secret_hash: SecretHash,
    pub owner_public_key: PublicKey,
    pub recipient_public_key: PublicKey,
    pub lock_time: u64,
}

/// One unspent output sitting on a script address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unspent {
    pub tx_id: TxId,
    pub amount: Amount,
    pub confirmations: u32,
}

/// Requested fee estimation speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeSpeed {
    Slow,
    Normal,
    Fast,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(de)?;
        let raw = hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        raw.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}
