//! Renter-side table of shards awaiting a farmer's OFFER
//!
//! Each open entry holds a single-use completion. Taking the entry out of the
//! table and completing it are two steps, but only one caller can ever take a
//! given entry, so at most one OFFER per solicitation succeeds.

use crate::protocol::Contact;
use parking_lot::Mutex;
use shardlease_core::{ContentHash, Contract};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// A farmer that answered a solicitation, and the contract both sides signed
#[derive(Debug, Clone)]
pub struct OfferMatch {
    pub contact: Contact,
    pub contract: Contract,
}

/// Resolves once an OFFER has been accepted for the solicited shard.
///
/// Dropping it closes the entry.
pub type OfferReceiver = oneshot::Receiver<OfferMatch>;

struct Entry {
    terms: Contract,
    completion: oneshot::Sender<OfferMatch>,
}

#[derive(Default)]
pub struct PendingOffers {
    entries: Mutex<HashMap<ContentHash, Entry>>,
}

impl PendingOffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an entry for the solicited `terms`, replacing (and closing) any
    /// earlier one for the same shard
    pub fn open(&self, terms: Contract) -> OfferReceiver {
        let (completion, rx) = oneshot::channel();
        self.entries
            .lock()
            .insert(terms.data_hash, Entry { terms, completion });
        rx
    }

    /// Whether an OFFER for `data_hash` would currently be considered
    pub fn is_open(&self, data_hash: &ContentHash) -> bool {
        self.terms(data_hash).is_some()
    }

    /// The contract as solicited, while its entry is open
    pub fn terms(&self, data_hash: &ContentHash) -> Option<Contract> {
        self.entries
            .lock()
            .get(data_hash)
            .filter(|entry| !entry.completion.is_closed())
            .map(|entry| entry.terms.clone())
    }

    /// Remove the entry for `data_hash`.
    ///
    /// Returns `None` if it was never opened, already taken, or its receiver
    /// has been dropped.
    pub fn take(&self, data_hash: &ContentHash) -> Option<oneshot::Sender<OfferMatch>> {
        self.entries
            .lock()
            .remove(data_hash)
            .map(|entry| entry.completion)
            .filter(|tx| !tx.is_closed())
    }

    /// Close an entry without a match
    pub fn cancel(&self, data_hash: &ContentHash) -> bool {
        self.entries.lock().remove(data_hash).is_some()
    }

    /// Drop entries whose receivers are gone
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.completion.is_closed());
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardlease_core::Keypair;

    fn terms() -> Contract {
        Contract::new(Keypair::generate().identity(), ContentHash::compute(b"x"), 1, 0, 1, 1)
    }

    fn offer_match() -> OfferMatch {
        OfferMatch {
            contact: Contact::new(Keypair::generate().identity(), "127.0.0.1", 4000),
            contract: terms(),
        }
    }

    #[tokio::test]
    async fn test_take_once() {
        let pending = PendingOffers::new();
        let hash = ContentHash::compute(b"x");
        let solicited = terms();
        let rx = pending.open(solicited.clone());
        assert_eq!(pending.terms(&hash), Some(solicited));

        let tx = pending.take(&hash).unwrap();
        assert!(pending.take(&hash).is_none());
        assert!(!pending.is_open(&hash));

        tx.send(offer_match()).unwrap();
        assert!(rx.await.is_ok());
    }

    #[test]
    fn test_dropped_receiver_closes_entry() {
        let pending = PendingOffers::new();
        let hash = ContentHash::compute(b"x");
        drop(pending.open(terms()));

        assert!(!pending.is_open(&hash));
        assert_eq!(pending.terms(&hash), None);
        assert_eq!(pending.prune(), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_reopen_replaces_entry() {
        let pending = PendingOffers::new();
        let hash = ContentHash::compute(b"x");
        let mut first = pending.open(terms());
        let second = terms();
        let _rx = pending.open(second.clone());

        assert_eq!(pending.len(), 1);
        assert_eq!(pending.terms(&hash), Some(second));
        assert!(first.try_recv().is_err());
        assert!(pending.cancel(&hash));
        assert!(!pending.cancel(&hash));
    }
}
