//! Verification of beacon entries against a chain's public key.

use thiserror::Error;

use beacon_crypto::verify_signature;
use beacon_types::{BeaconEntry, ChainInfo, G2Point, PublicRandResponse};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("Expected round {expected}, got {got}")]
    UnexpectedRound { expected: u64, got: u64 },

    #[error("Round {0} does not extend the current tip")]
    PreviousSignatureMismatch(u64),

    #[error("Invalid signature for round {0}")]
    InvalidSignature(u64),

    #[error("Randomness of round {0} does not match its signature")]
    InvalidRandomness(u64),
}

/// Checks entries of one chain.
#[derive(Debug, Clone)]
pub struct ChainVerifier {
    public_key: G2Point,
}

impl ChainVerifier {
    pub fn new(public_key: G2Point) -> Self {
        Self { public_key }
    }

    pub fn from_info(info: &ChainInfo) -> Self {
        Self::new(info.public_key.clone())
    }

    /// Check the signature of an entry over its own previous signature.
    pub fn verify_entry(&self, entry: &BeaconEntry) -> Result<(), VerifyError> {
        verify_signature(&self.public_key, &entry.message(), &entry.signature)
            .map_err(|_| VerifyError::InvalidSignature(entry.round))
    }

    /// Check that `entry` is the valid successor of `tip`.
    pub fn verify_next(&self, tip: &BeaconEntry, entry: &BeaconEntry) -> Result<(), VerifyError> {
        if entry.round != tip.round + 1 {
            return Err(VerifyError::UnexpectedRound {
                expected: tip.round + 1,
                got: entry.round,
            });
        }
        if entry.previous_signature != tip.signature {
            return Err(VerifyError::PreviousSignatureMismatch(entry.round));
        }
        self.verify_entry(entry)
    }

    /// Check a response served by the public API, randomness included.
    pub fn verify_response(&self, response: &PublicRandResponse) -> Result<BeaconEntry, VerifyError> {
        let entry = response.clone().into_entry();
        if response.randomness != entry.randomness().to_vec() {
            return Err(VerifyError::InvalidRandomness(entry.round));
        }
        self.verify_entry(&entry)?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partials::tests::test_group;
    use crate::partials::PartialCache;

    fn signed_chain(len: u64) -> (ChainVerifier, Vec<BeaconEntry>) {
        let tg = test_group(3, 2);
        let mut cache = PartialCache::new(tg.group.clone(), 64).unwrap();
        let mut chain = vec![BeaconEntry::genesis(tg.group.genesis_seed)];
        for round in 1..len {
            let prev = chain.last().unwrap().signature.clone();
            cache.add(tg.partial(0, round, &prev)).unwrap();
            cache.add(tg.partial(2, round, &prev)).unwrap();
            chain.push(cache.recover(round, &prev).unwrap());
        }
        let verifier = ChainVerifier::from_info(&tg.group.chain_info().unwrap());
        (verifier, chain)
    }

    #[test]
    fn test_verify_chain() {
        let (verifier, chain) = signed_chain(4);
        for pair in chain.windows(2) {
            verifier.verify_next(&pair[0], &pair[1]).unwrap();
        }
        assert_eq!(
            verifier.verify_next(&chain[0], &chain[2]),
            Err(VerifyError::UnexpectedRound { expected: 1, got: 2 })
        );
    }

    #[test]
    fn test_tampered_entries_rejected() {
        let (verifier, chain) = signed_chain(3);

        let mut swapped = chain[2].clone();
        swapped.previous_signature = chain[0].signature.clone();
        assert_eq!(
            verifier.verify_next(&chain[1], &swapped),
            Err(VerifyError::PreviousSignatureMismatch(2))
        );

        let mut response = chain[2].to_response();
        assert!(verifier.verify_response(&response).is_ok());
        response.randomness[0] ^= 1;
        assert_eq!(verifier.verify_response(&response), Err(VerifyError::InvalidRandomness(2)));

        let mut forged = chain[2].to_response();
        forged.round = 7;
        forged.randomness = chain[2].randomness().to_vec();
        assert_eq!(verifier.verify_response(&forged), Err(VerifyError::InvalidSignature(7)));
    }
}
