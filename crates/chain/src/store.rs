//! Append-only, round-indexed storage of finalized beacon entries.

use parking_lot::RwLock;
use std::ops::RangeInclusive;
use thiserror::Error;

use beacon_types::BeaconEntry;

/// Errors that can occur when reading or appending entries.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store is empty")]
    Empty,

    #[error("Round {0} not found")]
    NotFound(u64),

    #[error("Round gap: expected {expected}, got {got}")]
    RoundGap { expected: u64, got: u64 },

    #[error("Round {0} already stored")]
    AlreadyStored(u64),

    #[error("Entry for round {0} does not extend the chain")]
    BrokenChain(u64),

    #[error("Corrupt store: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage of one beacon chain.
///
/// Entries are appended in strictly increasing round order starting with the
/// genesis entry (round 0); every entry's `previous_signature` equals the
/// signature of the entry before it.
pub trait Store: Send + Sync {
    /// Number of stored entries, genesis included.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append the next entry.
    fn put(&self, entry: BeaconEntry) -> StoreResult<()>;

    /// Latest stored entry.
    fn last(&self) -> StoreResult<BeaconEntry>;

    fn get(&self, round: u64) -> StoreResult<BeaconEntry>;

    /// Up to `limit` consecutive entries starting at `from`.
    fn range(&self, from: u64, limit: usize) -> StoreResult<Vec<BeaconEntry>>;

    /// Rounds missing to reach `target`, if any.
    fn gap(&self, target: u64) -> Option<RangeInclusive<u64>> {
        let next = self.last().map(|e| e.round + 1).unwrap_or(0);
        (next <= target).then(|| next..=target)
    }
}

/// Check that `entry` may be appended after `last`.
pub(crate) fn check_append(last: Option<&BeaconEntry>, entry: &BeaconEntry) -> StoreResult<()> {
    match last {
        None if entry.round == 0 => Ok(()),
        None => Err(StoreError::RoundGap {
            expected: 0,
            got: entry.round,
        }),
        Some(last) if entry.round <= last.round => Err(StoreError::AlreadyStored(entry.round)),
        Some(last) if entry.round != last.round + 1 => Err(StoreError::RoundGap {
            expected: last.round + 1,
            got: entry.round,
        }),
        Some(last) if entry.previous_signature != last.signature => {
            Err(StoreError::BrokenChain(entry.round))
        }
        Some(_) => Ok(()),
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemStore {
    entries: RwLock<Vec<BeaconEntry>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemStore {
    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn put(&self, entry: BeaconEntry) -> StoreResult<()> {
        let mut entries = self.entries.write();
        check_append(entries.last(), &entry)?;
        entries.push(entry);
        Ok(())
    }

    fn last(&self) -> StoreResult<BeaconEntry> {
        self.entries.read().last().cloned().ok_or(StoreError::Empty)
    }

    fn get(&self, round: u64) -> StoreResult<BeaconEntry> {
        get_round(&self.entries.read(), round)
    }

    fn range(&self, from: u64, limit: usize) -> StoreResult<Vec<BeaconEntry>> {
        Ok(range_of(&self.entries.read(), from, limit))
    }
}

// Entries are contiguous from round 0, so a round is its own position.
pub(crate) fn get_round(entries: &[BeaconEntry], round: u64) -> StoreResult<BeaconEntry> {
    usize::try_from(round)
        .ok()
        .and_then(|i| entries.get(i))
        .cloned()
        .ok_or(StoreError::NotFound(round))
}

pub(crate) fn range_of(entries: &[BeaconEntry], from: u64, limit: usize) -> Vec<BeaconEntry> {
    let start = usize::try_from(from).unwrap_or(usize::MAX);
    entries.iter().skip(start).take(limit).cloned().collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A chain of fake entries for storage tests.
    pub fn fake_chain(len: u64) -> Vec<BeaconEntry> {
        let mut chain = vec![BeaconEntry::genesis([0xaa; 32])];
        for round in 1..len {
            let previous_signature = chain[round as usize - 1].signature.clone();
            chain.push(BeaconEntry {
                round,
                previous_signature,
                signature: vec![round as u8; 48],
            });
        }
        chain
    }

    #[test]
    fn test_append_in_order() {
        let store = MemStore::new();
        assert!(matches!(store.last(), Err(StoreError::Empty)));

        for entry in fake_chain(5) {
            store.put(entry).unwrap();
        }
        assert_eq!(store.len(), 5);
        assert_eq!(store.last().unwrap().round, 4);
        assert_eq!(store.get(2).unwrap().signature, vec![2u8; 48]);
        assert!(matches!(store.get(9), Err(StoreError::NotFound(9))));
    }

    #[test]
    fn test_rejects_out_of_order() {
        let store = MemStore::new();
        let chain = fake_chain(4);
        assert!(matches!(
            store.put(chain[1].clone()),
            Err(StoreError::RoundGap { expected: 0, got: 1 })
        ));

        store.put(chain[0].clone()).unwrap();
        store.put(chain[1].clone()).unwrap();
        assert!(matches!(
            store.put(chain[1].clone()),
            Err(StoreError::AlreadyStored(1))
        ));
        assert!(matches!(
            store.put(chain[3].clone()),
            Err(StoreError::RoundGap { expected: 2, got: 3 })
        ));

        let mut forked = chain[2].clone();
        forked.previous_signature = vec![0u8; 48];
        assert!(matches!(store.put(forked), Err(StoreError::BrokenChain(2))));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_range_and_gap() {
        let store = MemStore::new();
        assert_eq!(store.gap(3), Some(0..=3));
        for entry in fake_chain(11) {
            store.put(entry).unwrap();
        }

        let batch = store.range(4, 3).unwrap();
        assert_eq!(batch.iter().map(|e| e.round).collect::<Vec<_>>(), vec![4, 5, 6]);
        assert_eq!(store.range(9, 300).unwrap().len(), 2);
        assert!(store.range(20, 5).unwrap().is_empty());

        assert_eq!(store.gap(15), Some(11..=15));
        assert_eq!(store.gap(10), None);
    }
}
