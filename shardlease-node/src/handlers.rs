//! OFFER, AUDIT, CONSIGN and RETRIEVE
//!
//! Validation failures are returned to the caller untouched. Only storage
//! medium failures are logged here (by the storage layer).

use crate::context::NodeContext;
use crate::pending::OfferMatch;
use crate::protocol::{AuditRequest, ConsignRequest, OfferRequest, Response, RetrieveRequest};
use shardlease_core::error::{Result, ShardLeaseError};
use shardlease_core::{
    leaf_count_for, now_millis, ContentHash, NegotiationState, ProofEngine, Role,
};
use shardlease_storage::{Activity, ContractKey, StorageItem};
use tracing::{debug, info, instrument};

/// Renter side: a farmer answers a solicitation.
///
/// The pending entry is removed before the match is delivered, so of several
/// concurrent OFFERs for one hash at most one succeeds.
#[instrument(skip_all, fields(data_hash = %req.contract.data_hash, farmer = %req.contact.identity))]
pub async fn offer(ctx: &NodeContext, req: OfferRequest) -> Result<Response> {
    let OfferRequest {
        mut contract,
        contact,
    } = req;
    let data_hash = contract.data_hash;

    let Some(solicited) = ctx.pending().terms(&data_hash) else {
        return Err(stale(&data_hash));
    };

    // The renter only ever signs the terms it asked for
    if !contract.same_terms(&solicited) {
        return Err(ShardLeaseError::InvalidSignature(
            "offer does not match the solicited terms".to_string(),
        ));
    }
    if contract.farmer_id.as_deref() != Some(contact.identity.as_str()) {
        return Err(ShardLeaseError::InvalidSignature(
            "farmer_id does not match the offering contact".to_string(),
        ));
    }
    if !contract.verify(Role::Farmer, &contact.identity) {
        return Err(ShardLeaseError::InvalidSignature(
            "farmer signature does not verify".to_string(),
        ));
    }

    // Filling farmer_id changed the signed bytes
    contract.sign(Role::Renter, ctx.keypair())?;
    if !contract.is_complete() {
        return Err(ShardLeaseError::IncompleteContract);
    }

    let Some(completion) = ctx.pending().take(&data_hash) else {
        debug!("Lost the race for this offer");
        return Err(stale(&data_hash));
    };

    let matched = OfferMatch {
        contact,
        contract: contract.clone(),
    };
    if completion.send(matched).is_err() {
        return Err(stale(&data_hash));
    }

    info!("Offer accepted");
    Ok(Response::Offer { contract })
}

fn stale(data_hash: &ContentHash) -> ShardLeaseError {
    ShardLeaseError::StaleOffer(data_hash.to_hex())
}

/// Farmer side: prove possession of a shard for one challenge.
///
/// Reads with `peek` so audits never look like renter access.
#[instrument(skip_all, fields(data_hash = %req.data_hash, renter = %req.contact.identity))]
pub async fn audit(ctx: &NodeContext, req: AuditRequest) -> Result<Response> {
    let AuditRequest {
        data_hash,
        contact,
        challenge,
    } = req;
    let not_found = || ShardLeaseError::ShardNotFound(data_hash.to_hex());

    let mut item = {
        let _guard = ctx.locks().lock(data_hash).await;
        ctx.storage().peek(data_hash).await?.ok_or_else(not_found)?
    };

    let shard = item.shard.take().ok_or_else(not_found)?;
    let tree = item.trees.remove(&contact.identity).ok_or_else(not_found)?;

    // Proving rehashes the whole shard
    let proof = tokio::task::spawn_blocking(move || {
        ProofEngine::new(&tree)?.prove_challenge(&shard, &challenge)
    })
    .await
    .map_err(|e| ShardLeaseError::Internal(format!("proof task failed: {e}")))??;

    ctx.touch(
        ContractKey::new(data_hash, ctx.identity(), contact.identity),
        Activity::Audit,
    )
    .await;

    debug!("Audit answered");
    Ok(Response::Audit { proof })
}

/// Farmer side: accept the shard for a contract the caller holds with us
#[instrument(skip_all, fields(data_hash = %req.data_hash, renter = %req.contact.identity, size = req.shard.len()))]
pub async fn consign(ctx: &NodeContext, req: ConsignRequest) -> Result<Response> {
    let ConsignRequest {
        data_hash,
        contact,
        shard,
        tree,
    } = req;

    let key = ContractKey::new(data_hash, ctx.identity(), contact.identity.clone());
    let missing = |key: &ContractKey| ShardLeaseError::ContractNotFound(key.to_string());

    // The reaper unlinks under the same lock, so the record read here is the
    // one the shard ends up stored against
    let _guard = ctx.locks().lock(data_hash).await;

    let lookup = key.clone();
    let record = ctx
        .contracts(move |store| store.get(&lookup))
        .await?
        .ok_or_else(|| missing(&key))?;
    let contract = record.contract;

    let size = shard.len() as u64;
    if size > contract.data_size {
        return Err(ShardLeaseError::SizeExceeded {
            size,
            limit: contract.data_size,
        });
    }

    let now = now_millis();
    if !contract.in_store_window(now) {
        return Err(ShardLeaseError::WindowViolation {
            at: now,
            begin: contract.store_begin,
            end: contract.store_end,
        });
    }

    let actual = ContentHash::compute(&shard);
    if actual != contract.data_hash {
        return Err(ShardLeaseError::HashMismatch {
            expected: contract.data_hash.to_hex(),
            actual: actual.to_hex(),
        });
    }

    let expected_leaves = leaf_count_for(contract.audit_count);
    if tree.len() != expected_leaves {
        return Err(ShardLeaseError::Format(format!(
            "audit tree has {} leaves, contract needs {expected_leaves}",
            tree.len()
        )));
    }

    // A retired or vanished contract cannot take a shard
    let activate = key.clone();
    ctx.contracts(move |store| {
        store.update(&activate, |record| record.state.advance(NegotiationState::Active))
    })
    .await?
    .ok_or_else(|| missing(&key))?;

    let mut item = ctx
        .storage()
        .peek(data_hash)
        .await?
        .unwrap_or_else(|| StorageItem::new(data_hash));
    item.shard = Some(shard);
    item.insert_contract(&contact.identity, contract, tree);
    ctx.storage().put(data_hash, &item).await?;

    ctx.metrics().record_shard_in(size as usize);
    info!("Shard consigned");
    Ok(Response::Consign {})
}

/// Farmer side: hand the shard back to a renter
#[instrument(skip_all, fields(data_hash = %req.data_hash))]
pub async fn retrieve(ctx: &NodeContext, req: RetrieveRequest) -> Result<Response> {
    let RetrieveRequest { data_hash, contact } = req;
    let not_found = || ShardLeaseError::ShardNotFound(data_hash.to_hex());

    let item = {
        let _guard = ctx.locks().lock(data_hash).await;
        ctx.storage().get(data_hash).await?.ok_or_else(not_found)?
    };
    let shard = item.shard.ok_or_else(not_found)?;

    let renters: Vec<String> = match contact {
        Some(contact) => vec![contact.identity],
        None => item.contracts.into_keys().collect(),
    };
    for renter in renters {
        ctx.touch(ContractKey::new(data_hash, ctx.identity(), renter), Activity::Access)
            .await;
    }

    ctx.metrics().record_shard_out(shard.len());
    debug!(size = shard.len(), "Shard retrieved");
    Ok(Response::Retrieve {
        data_shard: hex::encode(shard),
    })
}
