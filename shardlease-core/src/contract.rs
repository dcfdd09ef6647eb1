//! Storage contracts
//!
//! A contract binds a renter and a farmer to store one shard, identified by
//! its content hash, for a time window. Both parties sign the contract's
//! canonical byte form: a compact JSON object whose keys are sorted and which
//! leaves out the two signature fields.

use crate::crypto::{identity_key, verify_signature, ContentHash, Keypair};
use crate::error::{Result, ShardLeaseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current contract format version
pub const CONTRACT_VERSION: u32 = 0;

/// Party to a contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Renter,
    Farmer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Renter => write!(f, "renter"),
            Role::Farmer => write!(f, "farmer"),
        }
    }
}

impl FromStr for Role {
    type Err = ShardLeaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "renter" => Ok(Role::Renter),
            "farmer" => Ok(Role::Farmer),
            _ => Err(ShardLeaseError::Format(format!("unknown contract role: {s}"))),
        }
    }
}

/// Signed agreement to store one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    #[serde(default)]
    pub version: u32,
    pub renter_id: String,
    #[serde(default)]
    pub renter_signature: Option<String>,
    #[serde(default)]
    pub farmer_id: Option<String>,
    #[serde(default)]
    pub farmer_signature: Option<String>,
    pub data_hash: ContentHash,
    pub data_size: u64,
    /// Milliseconds since the UNIX epoch
    pub store_begin: i64,
    /// Milliseconds since the UNIX epoch
    pub store_end: i64,
    pub audit_count: u32,
    #[serde(default)]
    pub payment_storage_price: u64,
    #[serde(default)]
    pub payment_download_price: u64,
    #[serde(default)]
    pub payment_destination: Option<String>,
}

// Field order here is the canonical key order. Keep it sorted.
#[derive(Serialize)]
struct CanonicalContract<'a> {
    audit_count: u32,
    data_hash: &'a ContentHash,
    data_size: u64,
    farmer_id: &'a Option<String>,
    payment_destination: &'a Option<String>,
    payment_download_price: u64,
    payment_storage_price: u64,
    renter_id: &'a str,
    store_begin: i64,
    store_end: i64,
    version: u32,
}

impl Contract {
    /// Create an unsigned contract on behalf of a renter
    pub fn new(
        renter_id: impl Into<String>,
        data_hash: ContentHash,
        data_size: u64,
        store_begin: i64,
        store_end: i64,
        audit_count: u32,
    ) -> Self {
        Self {
            version: CONTRACT_VERSION,
            renter_id: renter_id.into(),
            renter_signature: None,
            farmer_id: None,
            farmer_signature: None,
            data_hash,
            data_size,
            store_begin,
            store_end,
            audit_count,
            payment_storage_price: 0,
            payment_download_price: 0,
            payment_destination: None,
        }
    }

    /// Decode and validate a contract received as a JSON object
    pub fn from_object(value: serde_json::Value) -> Result<Self> {
        let contract: Contract = serde_json::from_value(value)
            .map_err(|e| ShardLeaseError::Format(format!("invalid contract: {e}")))?;
        contract.validate()?;
        Ok(contract)
    }

    pub fn to_object(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Check field-level invariants
    pub fn validate(&self) -> Result<()> {
        identity_key(&self.renter_id)?;
        if let Some(farmer_id) = &self.farmer_id {
            identity_key(farmer_id)?;
        }
        if self.data_size == 0 {
            return Err(ShardLeaseError::Format(
                "contract data_size must be positive".to_string(),
            ));
        }
        if self.audit_count == 0 {
            return Err(ShardLeaseError::Format(
                "contract audit_count must be positive".to_string(),
            ));
        }
        if self.store_begin > self.store_end {
            return Err(ShardLeaseError::Format(format!(
                "contract store_begin {} is after store_end {}",
                self.store_begin, self.store_end
            )));
        }
        Ok(())
    }

    /// Bytes covered by both signatures
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let canonical = CanonicalContract {
            audit_count: self.audit_count,
            data_hash: &self.data_hash,
            data_size: self.data_size,
            farmer_id: &self.farmer_id,
            payment_destination: &self.payment_destination,
            payment_download_price: self.payment_download_price,
            payment_storage_price: self.payment_storage_price,
            renter_id: &self.renter_id,
            store_begin: self.store_begin,
            store_end: self.store_end,
            version: self.version,
        };
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// Identity of the given party, if known
    pub fn party(&self, role: Role) -> Option<&str> {
        match role {
            Role::Renter => Some(self.renter_id.as_str()),
            Role::Farmer => self.farmer_id.as_deref(),
        }
    }

    pub fn signature(&self, role: Role) -> Option<&str> {
        match role {
            Role::Renter => self.renter_signature.as_deref(),
            Role::Farmer => self.farmer_signature.as_deref(),
        }
    }

    /// Sign as `role`.
    ///
    /// The renter key must match `renter_id`. A farmer signing a contract
    /// with no farmer yet claims it; since that changes the canonical bytes,
    /// any earlier renter signature stops verifying.
    pub fn sign(&mut self, role: Role, keypair: &Keypair) -> Result<()> {
        let identity = keypair.identity();
        match role {
            Role::Renter => {
                if identity != self.renter_id {
                    return Err(ShardLeaseError::InvalidSignature(format!(
                        "key {identity} is not the renter {}",
                        self.renter_id
                    )));
                }
            }
            Role::Farmer => {
                if let Some(farmer_id) = &self.farmer_id {
                    if *farmer_id != identity {
                        return Err(ShardLeaseError::InvalidSignature(format!(
                            "key {identity} is not the farmer {farmer_id}"
                        )));
                    }
                } else {
                    self.farmer_id = Some(identity);
                }
            }
        }

        let signature = keypair.sign(&self.canonical_bytes()?);
        match role {
            Role::Renter => self.renter_signature = Some(signature),
            Role::Farmer => self.farmer_signature = Some(signature),
        }
        Ok(())
    }

    /// Check the `role` signature against `identity`
    pub fn verify(&self, role: Role, identity: &str) -> bool {
        let Some(signature) = self.signature(role) else {
            return false;
        };
        match self.canonical_bytes() {
            Ok(bytes) => verify_signature(identity, &bytes, signature),
            Err(_) => false,
        }
    }

    /// Both parties signed and both signatures verify against the
    /// identities named in the contract
    pub fn is_complete(&self) -> bool {
        match &self.farmer_id {
            Some(farmer_id) => {
                self.verify(Role::Renter, &self.renter_id) && self.verify(Role::Farmer, farmer_id)
            }
            None => false,
        }
    }

    /// Whether `at` lies in `[store_begin, store_end]`
    pub fn in_store_window(&self, at: i64) -> bool {
        self.store_begin <= at && at <= self.store_end
    }

    /// Whether `other` proposes the same lease, ignoring who the farmer is
    /// and every signature
    pub fn same_terms(&self, other: &Contract) -> bool {
        self.version == other.version
            && self.renter_id == other.renter_id
            && self.data_hash == other.data_hash
            && self.data_size == other.data_size
            && self.store_begin == other.store_begin
            && self.store_end == other.store_end
            && self.audit_count == other.audit_count
            && self.payment_storage_price == other.payment_storage_price
            && self.payment_download_price == other.payment_download_price
            && self.payment_destination == other.payment_destination
    }
}

/// Lifecycle of a contract as seen by one node.
///
/// Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    /// Created and signed by the renter
    Shopped,
    /// Counter-signed by a farmer, waiting to be matched
    Offered,
    /// Matched; the shard is expected to be consigned
    Fulfilling,
    /// Shard stored; audits may occur
    Active,
    /// Reaped
    Retired,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Shopped => "shopped",
            NegotiationState::Offered => "offered",
            NegotiationState::Fulfilling => "fulfilling",
            NegotiationState::Active => "active",
            NegotiationState::Retired => "retired",
        }
    }

    /// Move to `next`; staying put is allowed, going back is not
    pub fn advance(&mut self, next: NegotiationState) -> Result<()> {
        if next < *self {
            return Err(ShardLeaseError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
