//! Swap secrets and secret hashing

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::fmt;

/// Hash function binding a payment to the swap secret
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretHashAlgo {
    #[default]
    Sha256,
    Keccak256,
}

impl SecretHashAlgo {
    pub fn hash(&self, data: &[u8]) -> [u8; 32] {
        match self {
            SecretHashAlgo::Sha256 => Sha256::digest(data).into(),
            SecretHashAlgo::Keccak256 => Keccak256::digest(data).into(),
        }
    }
}

/// 32-byte preimage known to the maker until it spends the taker payment
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret(#[serde(with = "hex")] [u8; 32]);

impl Secret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a secret revealed on chain
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn hash(&self, algo: SecretHashAlgo) -> [u8; 32] {
        algo.hash(&self.0)
    }

    pub fn matches(&self, algo: SecretHashAlgo, secret_hash: &[u8; 32]) -> bool {
        &self.hash(algo) == secret_hash
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}
