//! Cryptographic primitives for ShardLease
//!
//! Provides:
//! - Blake3 content hashing (fast, parallelizable)
//! - Ed25519 node identities and detached signatures

use crate::error::{Result, ShardLeaseError};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Ed25519 secret key size (32 bytes)
pub const SECRET_KEY_SIZE: usize = 32;

/// Blake3 hash wrapper for content addressing
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    /// Compute Blake3 hash of data
    pub fn compute(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    /// Compute Blake3 hash of data using multiple threads (for large data)
    pub fn compute_parallel(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update_rayon(data);
        Self(hasher.finalize())
    }

    /// Hash of the concatenation `left || right`
    pub fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(left);
        hasher.update(right);
        Self(hasher.finalize())
    }

    /// Hash of the empty input, used to pad audit trees
    pub fn empty() -> Self {
        Self::compute(&[])
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Wrap a finished hasher state
    pub fn from_hasher(hasher: &blake3::Hasher) -> Self {
        Self(hasher.finalize())
    }

    /// Get the raw hash bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Parse from hex string
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hash = blake3::Hash::from_hex(hex)
            .map_err(|e| ShardLeaseError::Format(format!("invalid hash {hex:?}: {e}")))?;
        Ok(Self(hash))
    }

    /// Verify that data matches this hash
    pub fn verify(&self, data: &[u8]) -> bool {
        let computed = if data.len() >= crate::PARALLEL_HASH_THRESHOLD {
            Self::compute_parallel(data)
        } else {
            Self::compute(data)
        };
        self == &computed
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for ContentHash {
    type Err = ShardLeaseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

// Hex on the wire (JSON), raw bytes in bincode records.
impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(self.as_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let hex: String = Deserialize::deserialize(deserializer)?;
            return Self::from_hex(&hex).map_err(serde::de::Error::custom);
        }
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("Invalid hash length"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(blake3::Hash::from_bytes(arr)))
    }
}

/// Ed25519 node key pair.
///
/// The node identity is the lowercase hex of the 32-byte verifying key, so a
/// signature can be checked against an identity string without any lookup.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing: SigningKey::generate(&mut rng),
        }
    }

    /// Create from raw secret bytes
    pub fn from_secret_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&bytes),
        }
    }

    /// Parse a hex-encoded 32-byte secret
    pub fn from_secret_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| ShardLeaseError::Format(format!("invalid secret key: {e}")))?;
        let bytes: [u8; SECRET_KEY_SIZE] = bytes.try_into().map_err(|b: Vec<u8>| {
            ShardLeaseError::Format(format!(
                "secret key must be {SECRET_KEY_SIZE} bytes, got {}",
                b.len()
            ))
        })?;
        Ok(Self::from_secret_bytes(bytes))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// Load the key stored at `path`, generating and saving one if absent
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let secret = std::fs::read_to_string(path)?;
            return Self::from_secret_hex(&secret);
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, keypair.secret_hex())?;
        Ok(keypair)
    }

    /// Public identity of this key pair
    pub fn identity(&self) -> String {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Sign `message`, returning the hex-encoded 64-byte signature
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing.sign(message).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({}, [REDACTED])", self.identity())
    }
}

/// Parse an identity string into its verifying key
pub fn identity_key(identity: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(identity)
        .map_err(|e| ShardLeaseError::Format(format!("invalid identity {identity:?}: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ShardLeaseError::Format(format!("identity {identity:?} is not 32 bytes")))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| ShardLeaseError::Format(format!("identity {identity:?} is not a key: {e}")))
}

/// Check a hex signature over `message` against an identity.
///
/// Any decode failure counts as a bad signature.
pub fn verify_signature(identity: &str, message: &[u8], signature: &str) -> bool {
    let Ok(key) = identity_key(identity) else {
        return false;
    };
    let Ok(bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&bytes)).is_ok()
}
