//! Negotiation protocol surface
//!
//! Requests arrive as a method name plus an untyped JSON parameter object.
//! They are decoded into [`Request`], routed by [`dispatch`] to a handler and
//! answered with a [`Response`].

use crate::context::NodeContext;
use crate::handlers;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardlease_core::error::{Result, ShardLeaseError};
use shardlease_core::{identity_key, Challenge, ContentHash, Contract, ProofPath, PublicRecord};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::debug;

/// How to reach a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Hex-encoded Ed25519 verifying key
    pub identity: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub port: u16,
}

impl Contact {
    pub fn new(identity: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            identity: identity.into(),
            hostname: hostname.into(),
            port,
        }
    }

    pub fn validate(&self) -> Result<()> {
        identity_key(&self.identity).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Offer,
    Audit,
    Consign,
    Retrieve,
}

impl Method {
    pub const ALL: [Method; 4] = [Method::Offer, Method::Audit, Method::Consign, Method::Retrieve];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Offer => "OFFER",
            Method::Audit => "AUDIT",
            Method::Consign => "CONSIGN",
            Method::Retrieve => "RETRIEVE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ShardLeaseError;

    fn from_str(s: &str) -> Result<Self> {
        Method::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| ShardLeaseError::Format(format!("unknown method: {s}")))
    }
}

#[derive(Debug, Clone)]
pub struct OfferRequest {
    pub contract: Contract,
    pub contact: Contact,
}

#[derive(Debug, Clone)]
pub struct AuditRequest {
    pub data_hash: ContentHash,
    pub contact: Contact,
    pub challenge: Challenge,
}

#[derive(Debug, Clone)]
pub struct ConsignRequest {
    pub data_hash: ContentHash,
    pub contact: Contact,
    pub shard: Vec<u8>,
    pub tree: PublicRecord,
}

#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    pub data_hash: ContentHash,
    pub contact: Option<Contact>,
}

/// A decoded RPC
#[derive(Debug, Clone)]
pub enum Request {
    Offer(OfferRequest),
    Audit(AuditRequest),
    Consign(ConsignRequest),
    Retrieve(RetrieveRequest),
}

#[derive(Deserialize)]
struct OfferParams {
    contract: Value,
    contact: Contact,
}

#[derive(Deserialize)]
struct AuditParams {
    data_hash: ContentHash,
    contact: Contact,
    challenge: Challenge,
}

#[derive(Deserialize)]
struct ConsignParams {
    data_hash: ContentHash,
    contact: Contact,
    data_shard: String,
    audit_tree: Vec<String>,
}

#[derive(Deserialize)]
struct RetrieveParams {
    data_hash: ContentHash,
    #[serde(default)]
    contact: Option<Contact>,
}

fn params<T: serde::de::DeserializeOwned>(method: Method, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| ShardLeaseError::Format(format!("invalid {method} params: {e}")))
}

impl Request {
    /// Decode `params` for `method`. Nothing is mutated on failure.
    pub fn parse(method: Method, value: Value) -> Result<Self> {
        let request = match method {
            Method::Offer => {
                let p: OfferParams = params(method, value)?;
                p.contact.validate()?;
                Request::Offer(OfferRequest {
                    contract: Contract::from_object(p.contract)?,
                    contact: p.contact,
                })
            }
            Method::Audit => {
                let p: AuditParams = params(method, value)?;
                p.contact.validate()?;
                Request::Audit(AuditRequest {
                    data_hash: p.data_hash,
                    contact: p.contact,
                    challenge: p.challenge,
                })
            }
            Method::Consign => {
                let p: ConsignParams = params(method, value)?;
                p.contact.validate()?;
                let shard = hex::decode(&p.data_shard)
                    .map_err(|e| ShardLeaseError::Format(format!("invalid data_shard: {e}")))?;
                Request::Consign(ConsignRequest {
                    data_hash: p.data_hash,
                    contact: p.contact,
                    shard,
                    tree: PublicRecord::from_hex(&p.audit_tree)?,
                })
            }
            Method::Retrieve => {
                let p: RetrieveParams = params(method, value)?;
                if let Some(contact) = &p.contact {
                    contact.validate()?;
                }
                Request::Retrieve(RetrieveRequest {
                    data_hash: p.data_hash,
                    contact: p.contact,
                })
            }
        };
        Ok(request)
    }

    pub fn method(&self) -> Method {
        match self {
            Request::Offer(_) => Method::Offer,
            Request::Audit(_) => Method::Audit,
            Request::Consign(_) => Method::Consign,
            Request::Retrieve(_) => Method::Retrieve,
        }
    }
}

/// Successful RPC results, serialized as the bare result object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Offer { contract: Contract },
    Audit { proof: ProofPath },
    Retrieve { data_shard: String },
    Consign {},
}

/// Route a decoded request to its handler
pub async fn dispatch(ctx: &NodeContext, request: Request) -> Result<Response> {
    match request {
        Request::Offer(req) => handlers::offer(ctx, req).await,
        Request::Audit(req) => handlers::audit(ctx, req).await,
        Request::Consign(req) => handlers::consign(ctx, req).await,
        Request::Retrieve(req) => handlers::retrieve(ctx, req).await,
    }
}

/// Decode, dispatch and encode one RPC, recording its outcome
pub async fn handle_rpc(ctx: &NodeContext, method: &str, params: Value) -> Result<Value> {
    let start = Instant::now();
    let method_label = method.to_string();

    let result = async {
        let method: Method = method.parse()?;
        let request = Request::parse(method, params)?;
        let response = dispatch(ctx, request).await?;
        Ok::<_, ShardLeaseError>(serde_json::to_value(response)?)
    }
    .await;

    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => {
            debug!(method = %method_label, error = %e, "RPC rejected");
            e.kind().as_str()
        }
    };
    ctx.metrics().record_rpc(&method_label, outcome, start.elapsed());

    result
}
