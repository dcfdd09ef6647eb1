//! Merkle audit records
//!
//! A renter prepares audits for a shard before handing it to a farmer:
//! `audit_count` random challenges are combined with the shard's content hash
//! into leaves `L_i = H(H(shard) || c_i)`, padded with `H("")` up to the next
//! power of two, and folded into a complete binary Merkle tree.
//!
//! The leaves form the [`PublicRecord`] given to the farmer. The root, depth
//! and challenges form the [`PrivateRecord`] the renter keeps to check proofs.

use crate::crypto::ContentHash;
use crate::error::{Result, ShardLeaseError};
use crate::proof::{ProofEngine, ProofPath};
use crate::HASH_SIZE;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer used when consuming shard streams
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A 256-bit random audit challenge
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Challenge([u8; HASH_SIZE]);

impl Challenge {
    /// Draw a fresh challenge from the OS random source
    pub fn random() -> Self {
        let mut bytes = [0u8; HASH_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let mut bytes = [0u8; HASH_SIZE];
        hex::decode_to_slice(value, &mut bytes)
            .map_err(|e| ShardLeaseError::Format(format!("invalid challenge {value:?}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Challenge({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Challenge {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Challenge {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex: String = Deserialize::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Compute the audit leaf for a shard hash and challenge
pub fn audit_leaf(shard_hash: &ContentHash, challenge: &Challenge) -> ContentHash {
    ContentHash::hash_pair(shard_hash.as_bytes(), challenge.as_bytes())
}

/// Number of leaves in the tree built for `audit_count` challenges
pub fn leaf_count_for(audit_count: u32) -> usize {
    (audit_count.max(1) as usize).next_power_of_two()
}

/// Complete binary Merkle tree stored as an array of levels.
///
/// `levels[0]` holds the leaves and the last level holds only the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditTree {
    levels: Vec<Vec<ContentHash>>,
}

impl AuditTree {
    /// Build the tree over `leaves`, whose count must be a non-zero power of two
    pub fn from_leaves(leaves: Vec<ContentHash>) -> Result<Self> {
        if leaves.is_empty() || !leaves.len().is_power_of_two() {
            return Err(ShardLeaseError::Format(format!(
                "audit tree needs a power-of-two leaf count, got {}",
                leaves.len()
            )));
        }

        let mut levels = vec![leaves];
        while levels[levels.len() - 1].len() > 1 {
            let next = levels[levels.len() - 1]
                .chunks_exact(2)
                .map(|pair| ContentHash::hash_pair(pair[0].as_bytes(), pair[1].as_bytes()))
                .collect();
            levels.push(next);
        }
        Ok(Self { levels })
    }

    pub fn root(&self) -> ContentHash {
        self.levels[self.levels.len() - 1][0]
    }

    /// `log2(leaf_count)`
    pub fn depth(&self) -> u32 {
        (self.levels.len() - 1) as u32
    }

    pub fn leaves(&self) -> &[ContentHash] {
        &self.levels[0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn levels(&self) -> &[Vec<ContentHash>] {
        &self.levels
    }

    /// Node at `(level, index)`, if it exists
    pub fn node(&self, level: usize, index: usize) -> Option<&ContentHash> {
        self.levels.get(level)?.get(index)
    }
}

/// Leaves of an audit tree, handed to the storing party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicRecord(Vec<ContentHash>);

impl PublicRecord {
    pub fn new(leaves: Vec<ContentHash>) -> Self {
        Self(leaves)
    }

    pub fn leaves(&self) -> &[ContentHash] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_leaves(self) -> Vec<ContentHash> {
        self.0
    }

    /// Hex-encoded leaves in audit slot order
    pub fn to_hex(&self) -> Vec<String> {
        self.0.iter().map(ContentHash::to_hex).collect()
    }

    /// Decode hex leaves, requiring a non-empty power-of-two list
    pub fn from_hex<S: AsRef<str>>(leaves: &[S]) -> Result<Self> {
        let leaves = leaves
            .iter()
            .map(|leaf| ContentHash::from_hex(leaf.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        if leaves.is_empty() || !leaves.len().is_power_of_two() {
            return Err(ShardLeaseError::Format(format!(
                "audit tree needs a power-of-two leaf count, got {}",
                leaves.len()
            )));
        }
        Ok(Self(leaves))
    }
}

/// Verifier-side secret: enough to check a proof, nothing to build one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateRecord {
    pub root: ContentHash,
    pub depth: u32,
    pub challenges: Vec<Challenge>,
}

impl PrivateRecord {
    /// Check a proof returned for the challenge at `index`.
    ///
    /// Out-of-range indices and undecodable proofs are reported as `false`.
    pub fn verify(&self, index: usize, proof: &serde_json::Value) -> bool {
        match self.challenges.get(index) {
            Some(challenge) => ProofEngine::verify_value(&self.root, self.depth, challenge, proof),
            None => false,
        }
    }

    /// Typed variant of [`PrivateRecord::verify`]
    pub fn verify_proof(&self, index: usize, proof: &ProofPath) -> bool {
        match self.challenges.get(index) {
            Some(challenge) => ProofEngine::verify(&self.root, self.depth, challenge, proof),
            None => false,
        }
    }
}

enum StreamState {
    Consuming(Box<blake3::Hasher>),
    Finalized {
        shard_hash: Option<ContentHash>,
        tree: AuditTree,
    },
}

/// Two-phase audit record builder.
///
/// Shard bytes are fed incrementally into a running hash; the tree is only
/// allocated on [`AuditStream::finalize`], so memory use is independent of
/// the shard size.
pub struct AuditStream {
    challenges: Vec<Challenge>,
    state: StreamState,
}

impl AuditStream {
    /// Prepare `audit_count` fresh random challenges
    pub fn new(audit_count: u32) -> Result<Self> {
        if audit_count == 0 {
            return Err(ShardLeaseError::Format(
                "audit count must be positive".to_string(),
            ));
        }
        let challenges = (0..audit_count).map(|_| Challenge::random()).collect();
        Self::with_challenges(challenges)
    }

    /// Prepare an audit over caller-supplied challenges
    pub fn with_challenges(challenges: Vec<Challenge>) -> Result<Self> {
        if challenges.is_empty() {
            return Err(ShardLeaseError::Format(
                "audit needs at least one challenge".to_string(),
            ));
        }
        Ok(Self {
            challenges,
            state: StreamState::Consuming(Box::new(blake3::Hasher::new())),
        })
    }

    /// Restore a finalized record from its challenges and public leaves.
    ///
    /// The result answers record queries but never saw the shard, so
    /// [`AuditStream::shard_hash`] is unavailable.
    pub fn from_records(challenges: Vec<Challenge>, leaves: PublicRecord) -> Result<Self> {
        if challenges.len() > leaves.len() {
            return Err(ShardLeaseError::Format(format!(
                "{} challenges do not fit in {} leaves",
                challenges.len(),
                leaves.len()
            )));
        }
        let tree = AuditTree::from_leaves(leaves.into_leaves())?;
        Ok(Self {
            challenges,
            state: StreamState::Finalized {
                shard_hash: None,
                tree,
            },
        })
    }

    pub fn challenges(&self) -> &[Challenge] {
        &self.challenges
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.state, StreamState::Finalized { .. })
    }

    /// Feed the next chunk of shard bytes
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.state {
            StreamState::Consuming(hasher) => {
                hasher.update(data);
                Ok(())
            }
            StreamState::Finalized { .. } => Err(ShardLeaseError::Shape),
        }
    }

    /// End the stream and build the tree
    pub fn finalize(&mut self) -> Result<()> {
        let shard_hash = match &self.state {
            StreamState::Consuming(hasher) => ContentHash::from_hasher(hasher),
            StreamState::Finalized { .. } => return Err(ShardLeaseError::Shape),
        };

        let leaf_count = self.challenges.len().next_power_of_two();
        let padding = ContentHash::empty();
        let leaves = (0..leaf_count)
            .map(|i| match self.challenges.get(i) {
                Some(challenge) => audit_leaf(&shard_hash, challenge),
                None => padding,
            })
            .collect();

        let tree = AuditTree::from_leaves(leaves)?;
        self.state = StreamState::Finalized {
            shard_hash: Some(shard_hash),
            tree,
        };
        Ok(())
    }

    /// Read `reader` to its end, then finalize
    pub fn consume<R: Read>(&mut self, mut reader: R) -> Result<()> {
        if self.is_finalized() {
            return Err(ShardLeaseError::Shape);
        }
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.update(&buffer[..n])?;
        }
        self.finalize()
    }

    /// Async variant of [`AuditStream::consume`]
    pub async fn consume_async<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> Result<()> {
        if self.is_finalized() {
            return Err(ShardLeaseError::Shape);
        }
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            self.update(&buffer[..n])?;
        }
        self.finalize()
    }

    pub fn tree(&self) -> Result<&AuditTree> {
        match &self.state {
            StreamState::Finalized { tree, .. } => Ok(tree),
            StreamState::Consuming(_) => Err(ShardLeaseError::NotFinalized),
        }
    }

    /// Content hash of the consumed shard
    pub fn shard_hash(&self) -> Result<ContentHash> {
        match &self.state {
            StreamState::Finalized {
                shard_hash: Some(hash),
                ..
            } => Ok(*hash),
            StreamState::Finalized { shard_hash: None, .. } => Err(ShardLeaseError::NotFound(
                "audit record restored without shard bytes".to_string(),
            )),
            StreamState::Consuming(_) => Err(ShardLeaseError::NotFinalized),
        }
    }

    pub fn public_record(&self) -> Result<PublicRecord> {
        Ok(PublicRecord::new(self.tree()?.leaves().to_vec()))
    }

    pub fn private_record(&self) -> Result<PrivateRecord> {
        let tree = self.tree()?;
        Ok(PrivateRecord {
            root: tree.root(),
            depth: tree.depth(),
            challenges: self.challenges.clone(),
        })
    }
}

impl Write for AuditStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn zero_challenges(n: usize) -> Vec<Challenge> {
        vec![Challenge::from_bytes([0u8; HASH_SIZE]); n]
    }

    fn audited(shard: &[u8], audit_count: u32) -> AuditStream {
        let mut stream = AuditStream::new(audit_count).unwrap();
        stream.update(shard).unwrap();
        stream.finalize().unwrap();
        stream
    }

    #[test]
    fn test_leaf_count_is_next_power_of_two() {
        assert_eq!(audited(b"test", 6).public_record().unwrap().len(), 8);
        assert_eq!(audited(b"test", 24).public_record().unwrap().len(), 32);
        assert_eq!(audited(b"test", 1).public_record().unwrap().len(), 1);
        assert_eq!(audited(b"test", 8).public_record().unwrap().len(), 8);
        assert_eq!(leaf_count_for(12), 16);
    }

    #[test]
    fn test_depth_and_root_pinned() {
        let mut stream = AuditStream::with_challenges(zero_challenges(6)).unwrap();
        stream.update(b"test").unwrap();
        stream.finalize().unwrap();

        let private = stream.private_record().unwrap();
        assert_eq!(private.depth, 3);
        assert_eq!(
            private.root.to_hex(),
            "621efe499f468bce59e4b614e8ba9b16bff7bdf1fa1acdb2266094df64942465"
        );

        let public = stream.public_record().unwrap();
        assert_eq!(
            public.leaves()[0].to_hex(),
            "19fc2d8ff5a54f80ff7fdae367f2f2b22bbf24b55e5fc1a90b47bee4d516e1d9"
        );
        assert_eq!(public.leaves()[6], ContentHash::empty());
        assert_eq!(public.leaves()[7], ContentHash::empty());
    }

    #[test]
    fn test_leaf_is_double_hash() {
        let challenge = Challenge::random();
        let mut stream = AuditStream::with_challenges(vec![challenge]).unwrap();
        stream.update(b"shard bytes").unwrap();
        stream.finalize().unwrap();

        let shard_hash = ContentHash::compute(b"shard bytes");
        let mut joined = shard_hash.as_bytes().to_vec();
        joined.extend_from_slice(challenge.as_bytes());
        let expected = ContentHash::compute(&joined);

        assert_eq!(stream.public_record().unwrap().leaves(), &[expected]);
        assert_eq!(stream.shard_hash().unwrap(), shard_hash);
        // single leaf tree: the leaf is the root
        assert_eq!(stream.private_record().unwrap().root, expected);
        assert_eq!(stream.private_record().unwrap().depth, 0);
    }

    #[test]
    fn test_chunked_input_matches_single_update() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let challenges: Vec<Challenge> = (0..5).map(|_| Challenge::random()).collect();

        let mut whole = AuditStream::with_challenges(challenges.clone()).unwrap();
        whole.update(&data).unwrap();
        whole.finalize().unwrap();

        let mut chunked = AuditStream::with_challenges(challenges.clone()).unwrap();
        for chunk in data.chunks(4096) {
            chunked.write_all(chunk).unwrap();
        }
        chunked.finalize().unwrap();

        let mut read = AuditStream::with_challenges(challenges).unwrap();
        read.consume(std::io::Cursor::new(&data)).unwrap();

        assert_eq!(whole.private_record().unwrap(), chunked.private_record().unwrap());
        assert_eq!(whole.public_record().unwrap(), read.public_record().unwrap());
    }

    #[tokio::test]
    async fn test_consume_async() {
        let challenges: Vec<Challenge> = (0..3).map(|_| Challenge::random()).collect();
        let mut sync = AuditStream::with_challenges(challenges.clone()).unwrap();
        sync.consume(&b"async shard"[..]).unwrap();

        let mut stream = AuditStream::with_challenges(challenges).unwrap();
        stream.consume_async(&b"async shard"[..]).await.unwrap();
        assert_eq!(stream.private_record().unwrap(), sync.private_record().unwrap());

        let err = stream.consume_async(&b"again"[..]).await.unwrap_err();
        assert!(matches!(err, ShardLeaseError::Shape));
    }

    #[test]
    fn test_zero_audit_count_rejected() {
        assert!(matches!(
            AuditStream::new(0),
            Err(ShardLeaseError::Format(_))
        ));
        assert!(AuditStream::with_challenges(Vec::new()).is_err());
    }

    #[test]
    fn test_consume_twice_is_shape_error() {
        let mut stream = AuditStream::new(4).unwrap();
        stream.consume(&b"once"[..]).unwrap();
        assert!(matches!(
            stream.consume(&b"twice"[..]),
            Err(ShardLeaseError::Shape)
        ));
        assert!(matches!(stream.update(b"more"), Err(ShardLeaseError::Shape)));
        assert!(matches!(stream.finalize(), Err(ShardLeaseError::Shape)));
        assert!(stream.write(b"more").is_err());
    }

    #[test]
    fn test_accessors_before_finalize() {
        let mut stream = AuditStream::new(4).unwrap();
        stream.update(b"partial").unwrap();
        assert!(matches!(
            stream.public_record(),
            Err(ShardLeaseError::NotFinalized)
        ));
        assert!(matches!(
            stream.private_record(),
            Err(ShardLeaseError::NotFinalized)
        ));
        assert!(matches!(stream.tree(), Err(ShardLeaseError::NotFinalized)));
    }

    #[test]
    fn test_from_records_validation() {
        let stream = audited(b"test", 3);
        let public = stream.public_record().unwrap();

        let too_many = (0..5).map(|_| Challenge::random()).collect();
        assert!(AuditStream::from_records(too_many, public.clone()).is_err());

        let odd = PublicRecord::new(public.leaves()[..3].to_vec());
        assert!(AuditStream::from_records(Vec::new(), odd).is_err());
        assert!(AuditStream::from_records(Vec::new(), PublicRecord::new(Vec::new())).is_err());

        let restored = AuditStream::from_records(stream.challenges().to_vec(), public).unwrap();
        assert!(restored.shard_hash().is_err());
    }

    #[test]
    fn test_record_serialization_shapes() {
        let stream = audited(b"test", 2);
        let public = serde_json::to_value(stream.public_record().unwrap()).unwrap();
        let leaves = public.as_array().unwrap();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].as_str().unwrap().len(), 64);

        let private = serde_json::to_value(stream.private_record().unwrap()).unwrap();
        assert_eq!(private["depth"], 1);
        assert_eq!(private["root"].as_str().unwrap().len(), 64);
        assert_eq!(private["challenges"].as_array().unwrap().len(), 2);

        let hex = stream.public_record().unwrap().to_hex();
        assert_eq!(
            PublicRecord::from_hex(&hex).unwrap(),
            stream.public_record().unwrap()
        );
        assert!(PublicRecord::from_hex(&hex[..1].iter().chain(&hex).collect::<Vec<_>>()).is_err());
    }

    #[test]
    fn test_tree_levels() {
        let stream = audited(b"levels", 4);
        let tree = stream.tree().unwrap();
        assert_eq!(tree.levels().len(), 3);
        assert_eq!(tree.leaf_count(), 4);
        let left = tree.node(1, 0).unwrap();
        let right = tree.node(1, 1).unwrap();
        assert_eq!(
            ContentHash::hash_pair(left.as_bytes(), right.as_bytes()),
            tree.root()
        );
        assert!(tree.node(3, 0).is_none());
    }

    proptest! {
        #[test]
        fn prop_from_records_reproduces_records(
            shard in proptest::collection::vec(any::<u8>(), 0..2048),
            audit_count in 1u32..40,
        ) {
            let original = audited(&shard, audit_count);
            let public = original.public_record().unwrap();
            let private = original.private_record().unwrap();

            let restored = AuditStream::from_records(
                original.challenges().to_vec(),
                public.clone(),
            ).unwrap();

            prop_assert_eq!(restored.public_record().unwrap(), public);
            let restored_private = restored.private_record().unwrap();
            prop_assert_eq!(restored_private.root, private.root);
            prop_assert_eq!(restored_private.depth, private.depth);
            prop_assert_eq!(
                1usize << private.depth,
                (audit_count as usize).next_power_of_two()
            );
        }
    }
}
