//! Beacon entries, partial signatures and the round schedule.
//!
//! The signed message of a round binds it to the previous entry:
//! `message(round) = SHA-256(previous_signature || round_be_u64)`. Round 0 is
//! the genesis entry, whose "signature" is the group's genesis seed.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::{sha256, G1Point};

/// A finalized beacon value.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct BeaconEntry {
    pub round: u64,
    /// Signature of `round - 1` (the genesis seed for round 1)
    pub previous_signature: Vec<u8>,
    /// Recovered threshold signature (compressed G1), or the seed for round 0
    pub signature: Vec<u8>,
}

impl BeaconEntry {
    /// The genesis entry anchoring a chain.
    pub fn genesis(seed: [u8; 32]) -> Self {
        Self {
            round: 0,
            previous_signature: Vec::new(),
            signature: seed.to_vec(),
        }
    }

    /// Message signed for this entry.
    pub fn message(&self) -> [u8; 32] {
        beacon_message(self.round, &self.previous_signature)
    }

    /// Randomness derived from the signature.
    pub fn randomness(&self) -> [u8; 32] {
        randomness_from_signature(&self.signature)
    }

    pub fn to_response(&self) -> PublicRandResponse {
        PublicRandResponse {
            round: self.round,
            signature: self.signature.clone(),
            previous_signature: self.previous_signature.clone(),
            randomness: self.randomness().to_vec(),
        }
    }
}

/// A node's signature share for one round.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct PartialBeacon {
    pub round: u64,
    pub previous_signature: Vec<u8>,
    /// Signer's index in the current group
    pub index: u32,
    pub partial_signature: G1Point,
}

impl PartialBeacon {
    pub fn message(&self) -> [u8; 32] {
        beacon_message(self.round, &self.previous_signature)
    }
}

/// Public randomness as served to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicRandResponse {
    pub round: u64,
    pub signature: Vec<u8>,
    pub previous_signature: Vec<u8>,
    pub randomness: Vec<u8>,
}

impl PublicRandResponse {
    pub fn into_entry(self) -> BeaconEntry {
        BeaconEntry {
            round: self.round,
            previous_signature: self.previous_signature,
            signature: self.signature,
        }
    }
}

/// Message signed at `round` on top of `previous_signature`.
pub fn beacon_message(round: u64, previous_signature: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(previous_signature.len() + 8);
    data.extend_from_slice(previous_signature);
    data.extend_from_slice(&round.to_be_bytes());
    sha256(&data)
}

/// Randomness published for a signature.
pub fn randomness_from_signature(signature: &[u8]) -> [u8; 32] {
    sha256(signature)
}

/// Unix time (seconds) at which `round` is scheduled.
pub fn time_of_round(period: u64, genesis_time: u64, round: u64) -> u64 {
    genesis_time.saturating_add(round.saturating_mul(period))
}

/// Latest round whose scheduled time is not after `now` (0 before the first round).
pub fn current_round(now: u64, period: u64, genesis_time: u64) -> u64 {
    if period == 0 || now < genesis_time {
        return 0;
    }
    (now - genesis_time) / period
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_binds_round_and_previous_signature() {
        let m1 = beacon_message(1, b"seed");
        let m2 = beacon_message(2, b"seed");
        let m3 = beacon_message(1, b"other");

        assert_ne!(m1, m2);
        assert_ne!(m1, m3);
        assert_eq!(m1, beacon_message(1, b"seed"));
    }

    #[test]
    fn test_message_layout() {
        let mut data = b"prev".to_vec();
        data.extend_from_slice(&7u64.to_be_bytes());
        assert_eq!(beacon_message(7, b"prev"), sha256(&data));
    }

    #[test]
    fn test_round_schedule() {
        let genesis = 1_000;
        let period = 30;

        assert_eq!(time_of_round(period, genesis, 1), 1_030);
        assert_eq!(current_round(999, period, genesis), 0);
        assert_eq!(current_round(1_029, period, genesis), 0);
        assert_eq!(current_round(1_030, period, genesis), 1);
        assert_eq!(current_round(1_459, period, genesis), 15);

        for round in 1..50 {
            let t = time_of_round(period, genesis, round);
            assert_eq!(current_round(t, period, genesis), round);
            assert_eq!(current_round(t - 1, period, genesis), round - 1);
        }
    }

    #[test]
    fn test_genesis_entry() {
        let entry = BeaconEntry::genesis([9u8; 32]);
        assert_eq!(entry.round, 0);
        assert_eq!(entry.signature, vec![9u8; 32]);
        assert_eq!(entry.to_response().randomness, sha256(&[9u8; 32]).to_vec());
    }
}
