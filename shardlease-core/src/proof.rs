//! Merkle inclusion proofs for audit challenges
//!
//! The storing party keeps the public leaves of an audit tree next to the
//! shard. When challenged it recomputes the challenged leaf from the shard it
//! currently holds and returns the sibling hashes up to the root. The
//! verifier folds the path back up and compares against the private root.

use crate::audit::{audit_leaf, AuditTree, Challenge, PublicRecord};
use crate::crypto::ContentHash;
use crate::error::{Result, ShardLeaseError};
use serde::{Deserialize, Serialize};

/// Which side of the running hash a sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// parent = H(sibling || node)
    Left,
    /// parent = H(node || sibling)
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: ContentHash,
    pub side: Side,
}

/// Answer to one audit challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofPath {
    /// Hash of the shard bytes the prover holds right now
    pub shard_hash: ContentHash,
    /// Siblings from the leaf level up to just below the root
    pub path: Vec<ProofStep>,
}

/// Builds proofs from the levels of a stored audit tree
#[derive(Debug, Clone)]
pub struct ProofEngine {
    tree: AuditTree,
}

impl ProofEngine {
    /// Rebuild the tree levels from a public record
    pub fn new(record: &PublicRecord) -> Result<Self> {
        Ok(Self {
            tree: AuditTree::from_leaves(record.leaves().to_vec())?,
        })
    }

    pub fn from_tree(tree: AuditTree) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &AuditTree {
        &self.tree
    }

    /// Prove the leaf at `index` using the current shard bytes
    pub fn prove(&self, shard: &[u8], index: usize) -> Result<ProofPath> {
        if index >= self.tree.leaf_count() {
            return Err(ShardLeaseError::Format(format!(
                "challenge index {index} outside {} leaves",
                self.tree.leaf_count()
            )));
        }
        Ok(ProofPath {
            shard_hash: hash_shard(shard),
            path: self.siblings(index),
        })
    }

    /// Prove the leaf derived from `challenge`.
    ///
    /// Fails with `ChallengeNotFound` when no leaf equals
    /// `H(H(shard) || challenge)`, which is what a corrupted shard or an
    /// unknown challenge looks like from the prover's side.
    pub fn prove_challenge(&self, shard: &[u8], challenge: &Challenge) -> Result<ProofPath> {
        let shard_hash = hash_shard(shard);
        let leaf = audit_leaf(&shard_hash, challenge);
        let index = self
            .tree
            .leaves()
            .iter()
            .position(|candidate| *candidate == leaf)
            .ok_or(ShardLeaseError::ChallengeNotFound)?;
        Ok(ProofPath {
            shard_hash,
            path: self.siblings(index),
        })
    }

    fn siblings(&self, mut index: usize) -> Vec<ProofStep> {
        let levels = self.tree.levels();
        let mut path = Vec::with_capacity(levels.len().saturating_sub(1));
        for level in &levels[..levels.len() - 1] {
            let (sibling, side) = if index % 2 == 0 {
                (index + 1, Side::Right)
            } else {
                (index - 1, Side::Left)
            };
            path.push(ProofStep {
                hash: level[sibling],
                side,
            });
            index /= 2;
        }
        path
    }

    /// Check a proof against a private root. Never errors.
    pub fn verify(root: &ContentHash, depth: u32, challenge: &Challenge, proof: &ProofPath) -> bool {
        if proof.path.len() != depth as usize {
            return false;
        }
        let node = proof
            .path
            .iter()
            .fold(audit_leaf(&proof.shard_hash, challenge), |node, step| {
                match step.side {
                    Side::Left => ContentHash::hash_pair(step.hash.as_bytes(), node.as_bytes()),
                    Side::Right => ContentHash::hash_pair(node.as_bytes(), step.hash.as_bytes()),
                }
            });
        node == *root
    }

    /// Check an untyped proof as received off the wire
    pub fn verify_value(
        root: &ContentHash,
        depth: u32,
        challenge: &Challenge,
        proof: &serde_json::Value,
    ) -> bool {
        match ProofPath::deserialize(proof) {
            Ok(proof) => Self::verify(root, depth, challenge, &proof),
            Err(_) => false,
        }
    }
}

fn hash_shard(shard: &[u8]) -> ContentHash {
    if shard.len() >= crate::PARALLEL_HASH_THRESHOLD {
        ContentHash::compute_parallel(shard)
    } else {
        ContentHash::compute(shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditStream;
    use proptest::prelude::*;
    use serde_json::json;

    fn audited(shard: &[u8], audit_count: u32) -> AuditStream {
        let mut stream = AuditStream::new(audit_count).unwrap();
        stream.update(shard).unwrap();
        stream.finalize().unwrap();
        stream
    }

    #[test]
    fn test_prove_and_verify_every_challenge() {
        let shard = b"a shard worth auditing";
        let stream = audited(shard, 6);
        let private = stream.private_record().unwrap();
        let engine = ProofEngine::new(&stream.public_record().unwrap()).unwrap();

        for (i, challenge) in private.challenges.iter().enumerate() {
            let proof = engine.prove(shard, i).unwrap();
            assert_eq!(proof.path.len(), 3);
            assert!(ProofEngine::verify(&private.root, private.depth, challenge, &proof));
            assert!(private.verify_proof(i, &proof));

            let by_challenge = engine.prove_challenge(shard, challenge).unwrap();
            assert_eq!(by_challenge, proof);
        }
    }

    #[test]
    fn test_corrupted_shard_fails() {
        let shard = b"original bytes".to_vec();
        let stream = audited(&shard, 4);
        let private = stream.private_record().unwrap();
        let engine = ProofEngine::new(&stream.public_record().unwrap()).unwrap();

        let mut corrupted = shard.clone();
        corrupted[0] ^= 0xff;

        let proof = engine.prove(&corrupted, 1).unwrap();
        assert!(!private.verify_proof(1, &proof));

        assert!(matches!(
            engine.prove_challenge(&corrupted, &private.challenges[1]),
            Err(ShardLeaseError::ChallengeNotFound)
        ));
    }

    #[test]
    fn test_structural_mismatch_is_false() {
        let shard = b"structure";
        let stream = audited(shard, 4);
        let private = stream.private_record().unwrap();
        let engine = ProofEngine::new(&stream.public_record().unwrap()).unwrap();
        let mut proof = engine.prove(shard, 0).unwrap();

        assert!(!ProofEngine::verify(&private.root, private.depth + 1, &private.challenges[0], &proof));
        // wrong challenge for this leaf
        assert!(!ProofEngine::verify(&private.root, private.depth, &private.challenges[1], &proof));

        proof.path.pop();
        assert!(!private.verify_proof(0, &proof));
        assert!(!private.verify_proof(99, &proof));
    }

    #[test]
    fn test_verify_value_rejects_malformed() {
        let shard = b"wire";
        let stream = audited(shard, 2);
        let private = stream.private_record().unwrap();
        let engine = ProofEngine::new(&stream.public_record().unwrap()).unwrap();
        let proof = engine.prove(shard, 0).unwrap();

        let value = serde_json::to_value(&proof).unwrap();
        assert!(private.verify(0, &value));
        assert_eq!(value["path"][0]["side"], "right");

        assert!(!private.verify(0, &json!({"shard_hash": "abc", "path": []})));
        assert!(!private.verify(0, &json!("not a proof")));
        assert!(!private.verify(
            0,
            &json!({"shard_hash": proof.shard_hash.to_hex(), "path": [{"hash": "00", "side": "left"}]})
        ));
    }

    #[test]
    fn test_index_out_of_range() {
        let stream = audited(b"x", 2);
        let engine = ProofEngine::new(&stream.public_record().unwrap()).unwrap();
        assert!(matches!(engine.prove(b"x", 2), Err(ShardLeaseError::Format(_))));
    }

    #[test]
    fn test_single_leaf_tree_has_empty_path() {
        let stream = audited(b"solo", 1);
        let private = stream.private_record().unwrap();
        let engine = ProofEngine::new(&stream.public_record().unwrap()).unwrap();
        let proof = engine.prove(b"solo", 0).unwrap();
        assert!(proof.path.is_empty());
        assert!(private.verify_proof(0, &proof));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_every_index_verifies(
            shard in proptest::collection::vec(any::<u8>(), 1..1024),
            audit_count in 1u32..24,
            flip in any::<prop::sample::Index>(),
        ) {
            let stream = audited(&shard, audit_count);
            let private = stream.private_record().unwrap();
            let engine = ProofEngine::new(&stream.public_record().unwrap()).unwrap();

            for i in 0..audit_count as usize {
                let proof = engine.prove(&shard, i).unwrap();
                prop_assert!(private.verify_proof(i, &proof));
            }

            let mut corrupted = shard.clone();
            let at = flip.index(corrupted.len());
            corrupted[at] ^= 0x01;
            let proof = engine.prove(&corrupted, 0).unwrap();
            prop_assert!(!private.verify_proof(0, &proof));
        }
    }
}
