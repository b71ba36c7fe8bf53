//! Partial signature collection.
//!
//! Coordinates recovery of beacon signatures by:
//! 1. Collecting partial signatures from group members, per round
//! 2. Verifying each partial against the member's public share
//! 3. Recovering the group signature once the threshold is met
//! 4. Verifying the recovered signature against the distributed key

use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use beacon_crypto::{recover_signature, verify_partial, verify_signature};
use beacon_types::{BeaconEntry, G1Point, Group, PartialBeacon};

/// Errors that can occur while collecting partials.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartialError {
    #[error("Group has no distributed key")]
    Unkeyed,

    #[error("Partial from unknown signer {0}")]
    UnknownSigner(u32),

    #[error("Duplicate partial from {index} for round {round}")]
    Duplicate { index: u32, round: u64 },

    #[error("Round {0} is already final")]
    Stale(u64),

    #[error("Partial from {index} for round {round} does not extend the local tip")]
    WrongPrevious { index: u32, round: u64 },

    #[error("Invalid partial signature from {index} for round {round}")]
    InvalidPartialSignature { index: u32, round: u64 },

    #[error("Threshold not met for round {round}: have {have}, need {need}")]
    ThresholdNotMet { round: u64, have: usize, need: usize },

    #[error("Recovered signature for round {0} is invalid")]
    RecoveredSignatureInvalid(u64),

    #[error("Signature recovery failed: {0}")]
    Recovery(String),
}

/// State of one round's collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// Collecting partials
    Collecting,
    /// Threshold met, ready to recover
    Ready,
}

/// Partials collected for one round.
#[derive(Debug, Clone, Default)]
pub struct RoundPartials {
    /// Verified partials by signer index, one per signer
    pub partials: BTreeMap<u32, PartialBeacon>,
}

impl RoundPartials {
    fn on_previous<'a>(&'a self, previous_signature: &'a [u8]) -> impl Iterator<Item = &'a PartialBeacon> + 'a {
        self.partials
            .values()
            .filter(move |p| p.previous_signature == previous_signature)
    }
}

/// Per-round cache of verified partial signatures for one group.
///
/// A signer counts once per round, whatever previous signature it signed.
/// Partials for the round after the local tip must extend that tip.
#[derive(Debug)]
pub struct PartialCache {
    group: Group,
    members: HashSet<u32>,
    threshold: usize,
    rounds: BTreeMap<u64, RoundPartials>,
    /// Round and signature of the last final entry
    tip: Option<(u64, Vec<u8>)>,
    /// Bound on the number of rounds tracked at once
    max_rounds: usize,
}

impl PartialCache {
    /// Create a cache for a keyed group.
    pub fn new(group: Group, max_rounds: usize) -> Result<Self, PartialError> {
        if group.public_key.is_none() {
            return Err(PartialError::Unkeyed);
        }
        let members = group.indices().into_iter().collect();
        let threshold = group.threshold as usize;
        Ok(Self {
            group,
            members,
            threshold,
            rounds: BTreeMap::new(),
            tip: None,
            max_rounds: max_rounds.max(1),
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    fn commitments(&self) -> &[beacon_types::G2Point] {
        self.group
            .public_key
            .as_ref()
            .map(|p| p.coefficients.as_slice())
            .unwrap_or_default()
    }

    /// Record the last final entry.
    ///
    /// Rounds up to it are dropped, and partials held for the next round that
    /// do not extend it are discarded.
    pub fn set_tip(&mut self, tip: &BeaconEntry) {
        self.rounds.retain(|round, _| *round > tip.round);
        if let Some(next) = self.rounds.get_mut(&(tip.round + 1)) {
            next.partials
                .retain(|_, p| p.previous_signature == tip.signature);
        }
        self.tip = Some((tip.round, tip.signature.clone()));
    }

    /// Verify and store a partial.
    pub fn add(&mut self, partial: PartialBeacon) -> Result<RoundState, PartialError> {
        let index = partial.index;
        let round = partial.round;
        if !self.members.contains(&index) {
            return Err(PartialError::UnknownSigner(index));
        }
        if let Some((tip_round, tip_signature)) = &self.tip {
            if round <= *tip_round {
                return Err(PartialError::Stale(round));
            }
            if round == tip_round + 1 && &partial.previous_signature != tip_signature {
                debug!(index, round, "Partial built on another tip");
                return Err(PartialError::WrongPrevious { index, round });
            }
        }
        if self
            .rounds
            .get(&round)
            .is_some_and(|r| r.partials.contains_key(&index))
        {
            return Err(PartialError::Duplicate { index, round });
        }

        let message = partial.message();
        if verify_partial(self.commitments(), index, &message, &partial.partial_signature).is_err() {
            warn!(index, round, "Invalid partial signature");
            return Err(PartialError::InvalidPartialSignature { index, round });
        }

        let previous_signature = partial.previous_signature.clone();
        self.rounds
            .entry(round)
            .or_default()
            .partials
            .insert(index, partial);
        self.evict();

        let collected = self.count(round, &previous_signature);
        debug!(
            index,
            round,
            collected,
            threshold = self.threshold,
            "Accepted partial signature"
        );
        Ok(if collected >= self.threshold {
            RoundState::Ready
        } else {
            RoundState::Collecting
        })
    }

    /// Number of partials held for a round on a given previous signature.
    pub fn count(&self, round: u64, previous_signature: &[u8]) -> usize {
        self.rounds
            .get(&round)
            .map(|r| r.on_previous(previous_signature).count())
            .unwrap_or(0)
    }

    /// Recover and verify the entry for `round` on top of `previous_signature`.
    pub fn recover(&self, round: u64, previous_signature: &[u8]) -> Result<BeaconEntry, PartialError> {
        let have = self.count(round, previous_signature);
        let collected = self
            .rounds
            .get(&round)
            .filter(|_| have >= self.threshold)
            .ok_or(PartialError::ThresholdNotMet {
                round,
                have,
                need: self.threshold,
            })?;

        let shares: Vec<(u32, G1Point)> = collected
            .on_previous(previous_signature)
            .take(self.threshold)
            .map(|p| (p.index, p.partial_signature.clone()))
            .collect();
        let signature = recover_signature(&shares, self.threshold)
            .map_err(|e| PartialError::Recovery(e.to_string()))?;

        let public_key = self
            .group
            .public_key
            .as_ref()
            .and_then(|p| p.key())
            .ok_or(PartialError::Unkeyed)?;
        let message = beacon_types::beacon_message(round, previous_signature);
        if verify_signature(public_key, &message, &signature.0).is_err() {
            error!(round, "Recovered signature failed verification");
            return Err(PartialError::RecoveredSignatureInvalid(round));
        }

        info!(round, "Recovered beacon signature");
        Ok(BeaconEntry {
            round,
            previous_signature: previous_signature.to_vec(),
            signature: signature.0.to_vec(),
        })
    }

    /// Rounds currently tracked.
    pub fn rounds(&self) -> Vec<u64> {
        self.rounds.keys().copied().collect()
    }

    /// Drop the farthest rounds first; the oldest one is the round in progress.
    fn evict(&mut self) {
        while self.rounds.len() > self.max_rounds {
            self.rounds.pop_last();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use beacon_crypto::{compress_g2, random_scalar, sign_partial};
    use beacon_types::{DistPublic, Node};
    use bls12_381::{G2Projective, Scalar};
    use ff::Field;
    use group::Curve;
    use rand::rngs::OsRng;

    /// A keyed group with its secret shares, dealt by a trusted dealer.
    pub struct TestGroup {
        pub group: Group,
        pub shares: Vec<Scalar>,
    }

    pub fn test_group(n: u32, threshold: u32) -> TestGroup {
        let coeffs: Vec<Scalar> = (0..threshold).map(|_| random_scalar(&mut OsRng)).collect();
        let commitments = coeffs
            .iter()
            .map(|c| compress_g2(&(G2Projective::generator() * c).to_affine()))
            .collect();
        let shares = (0..n)
            .map(|i| {
                let x = beacon_crypto::eval_point(i);
                coeffs.iter().rev().fold(Scalar::ZERO, |acc, c| acc * x + c)
            })
            .collect();
        let nodes = (0..n)
            .map(|i| Node {
                index: i,
                public_key: beacon_types::G1Point([i as u8; 48]),
                address: format!("node-{i}"),
            })
            .collect();
        let group = Group::new(nodes, threshold, 1_000, 3, "")
            .unwrap()
            .finalize(&(0..n).collect::<Vec<_>>(), DistPublic { coefficients: commitments })
            .unwrap();
        TestGroup { group, shares }
    }

    impl TestGroup {
        pub fn partial(&self, index: u32, round: u64, previous_signature: &[u8]) -> PartialBeacon {
            let message = beacon_types::beacon_message(round, previous_signature);
            PartialBeacon {
                round,
                previous_signature: previous_signature.to_vec(),
                index,
                partial_signature: sign_partial(&self.shares[index as usize], &message),
            }
        }
    }

    #[test]
    fn test_collect_and_recover() {
        let tg = test_group(4, 3);
        let mut cache = PartialCache::new(tg.group.clone(), 16).unwrap();
        let prev = tg.group.genesis_seed.to_vec();

        assert_eq!(cache.add(tg.partial(0, 1, &prev)).unwrap(), RoundState::Collecting);
        assert!(matches!(
            cache.recover(1, &prev),
            Err(PartialError::ThresholdNotMet { have: 1, need: 3, .. })
        ));
        assert_eq!(cache.add(tg.partial(2, 1, &prev)).unwrap(), RoundState::Collecting);
        assert_eq!(cache.add(tg.partial(3, 1, &prev)).unwrap(), RoundState::Ready);

        let entry = cache.recover(1, &prev).unwrap();
        let public_key = tg.group.public_key.as_ref().unwrap().key().unwrap();
        verify_signature(public_key, &entry.message(), &entry.signature).unwrap();
    }

    #[test]
    fn test_rejects_invalid_and_foreign_partials() {
        let tg = test_group(3, 2);
        let mut cache = PartialCache::new(tg.group.clone(), 16).unwrap();
        let prev = vec![1u8; 48];

        let mut forged = tg.partial(0, 5, &prev);
        forged.index = 1;
        assert_eq!(
            cache.add(forged),
            Err(PartialError::InvalidPartialSignature { index: 1, round: 5 })
        );

        let mut stranger = tg.partial(0, 5, &prev);
        stranger.index = 7;
        assert_eq!(cache.add(stranger), Err(PartialError::UnknownSigner(7)));

        cache.add(tg.partial(0, 5, &prev)).unwrap();
        assert_eq!(
            cache.add(tg.partial(0, 5, &prev)),
            Err(PartialError::Duplicate { index: 0, round: 5 })
        );
        assert_eq!(cache.count(5, &prev), 1);
    }

    #[test]
    fn test_partials_on_other_tip_do_not_mix() {
        let tg = test_group(3, 2);
        let mut cache = PartialCache::new(tg.group.clone(), 16).unwrap();
        cache.add(tg.partial(0, 2, &[1u8; 48])).unwrap();
        cache.add(tg.partial(1, 2, &[2u8; 48])).unwrap();

        assert_eq!(cache.count(2, &[1u8; 48]), 1);
        assert!(cache.recover(2, &[1u8; 48]).is_err());
    }

    #[test]
    fn test_one_partial_per_signer_and_round() {
        let tg = test_group(3, 2);
        let mut cache = PartialCache::new(tg.group.clone(), 16).unwrap();
        cache.add(tg.partial(1, 4, &[1u8; 48])).unwrap();
        assert_eq!(
            cache.add(tg.partial(1, 4, &[2u8; 48])),
            Err(PartialError::Duplicate { index: 1, round: 4 })
        );
        assert_eq!(cache.count(4, &[2u8; 48]), 0);
    }

    #[test]
    fn test_next_round_must_extend_tip() {
        let tg = test_group(3, 2);
        let mut cache = PartialCache::new(tg.group.clone(), 16).unwrap();
        let tip = BeaconEntry {
            round: 4,
            previous_signature: vec![3u8; 48],
            signature: vec![4u8; 48],
        };
        // Held before the tip is known
        cache.add(tg.partial(0, 5, &[9u8; 48])).unwrap();
        cache.add(tg.partial(1, 5, &tip.signature)).unwrap();

        cache.set_tip(&tip);
        assert_eq!(cache.count(5, &[9u8; 48]), 0);
        assert_eq!(cache.count(5, &tip.signature), 1);
        assert_eq!(cache.add(tg.partial(2, 4, &tip.previous_signature)), Err(PartialError::Stale(4)));
        assert_eq!(
            cache.add(tg.partial(0, 5, &[9u8; 48])),
            Err(PartialError::WrongPrevious { index: 0, round: 5 })
        );
        assert_eq!(cache.add(tg.partial(0, 5, &tip.signature)).unwrap(), RoundState::Ready);
        assert!(cache.recover(5, &tip.signature).is_ok());
    }

    #[test]
    fn test_future_flood_keeps_round_in_progress() {
        let tg = test_group(3, 2);
        let mut cache = PartialCache::new(tg.group.clone(), 4).unwrap();
        let tip = BeaconEntry {
            round: 4,
            previous_signature: vec![3u8; 48],
            signature: vec![4u8; 48],
        };
        cache.set_tip(&tip);
        cache.add(tg.partial(0, 5, &tip.signature)).unwrap();

        // Member 2 signs made-up tips for every future round it can reach
        for round in 6..30 {
            cache.add(tg.partial(2, round, &[round as u8; 48])).unwrap();
        }
        assert_eq!(cache.rounds(), vec![5, 6, 7, 8]);

        cache.add(tg.partial(1, 5, &tip.signature)).unwrap();
        assert_eq!(cache.count(5, &tip.signature), 2);
        assert!(cache.recover(5, &tip.signature).is_ok());
    }

    #[test]
    fn test_set_tip_flushes_final_rounds() {
        let tg = test_group(3, 2);
        let mut cache = PartialCache::new(tg.group.clone(), 16).unwrap();
        let prev = vec![1u8; 48];
        for round in 1..=5 {
            cache.add(tg.partial(0, round, &prev)).unwrap();
        }
        cache.set_tip(&BeaconEntry {
            round: 4,
            previous_signature: vec![3u8; 48],
            signature: prev.clone(),
        });
        assert_eq!(cache.rounds(), vec![5]);
        assert_eq!(cache.count(5, &prev), 1);
    }

    #[test]
    fn test_unkeyed_group_rejected() {
        let tg = test_group(3, 2);
        let mut group = tg.group.clone();
        group.public_key = None;
        assert!(matches!(PartialCache::new(group, 4), Err(PartialError::Unkeyed)));
    }
}
