//! Fixtures shared by the unit tests of this crate.

use rand::rngs::OsRng;

use beacon_chain::PartialCache;
use beacon_crypto::{random_scalar, scalar_from_bytes, scalar_to_bytes, sign_partial};
use beacon_dkg::feldman::{generate_commitments, generate_polynomial, share_for};
use beacon_dkg::DistKeyShare;
use beacon_types::{beacon_message, BeaconEntry, DistPublic, Group, Node, PartialBeacon};

use crate::key_store::KeyPair;

/// A keyed group dealt by a trusted dealer.
pub struct Fixture {
    pub group: Group,
    pub key_pairs: Vec<KeyPair>,
    pub shares: Vec<DistKeyShare>,
}

pub fn fixture(n: u32, threshold: u32, genesis_time: u64, period: u64) -> Fixture {
    let key_pairs: Vec<KeyPair> = (0..n)
        .map(|i| KeyPair::generate(&format!("node-{i}"), &mut OsRng))
        .collect();
    let nodes = key_pairs
        .iter()
        .enumerate()
        .map(|(i, kp)| Node {
            index: i as u32,
            public_key: kp.public_key.clone(),
            address: kp.address.clone(),
        })
        .collect();

    let coefficients = generate_polynomial(&random_scalar(&mut OsRng), threshold as usize, &mut OsRng);
    let commitments = generate_commitments(&coefficients);
    let shares = (0..n)
        .map(|i| DistKeyShare {
            index: i,
            secret: scalar_to_bytes(&share_for(&coefficients, i)),
            commitments: commitments.clone(),
        })
        .collect();

    let group = Group::new(nodes, threshold, genesis_time, period, "")
        .unwrap()
        .finalize(&(0..n).collect::<Vec<_>>(), DistPublic { coefficients: commitments })
        .unwrap();

    Fixture { group, key_pairs, shares }
}

impl Fixture {
    pub fn partial(&self, index: u32, round: u64, previous_signature: &[u8]) -> PartialBeacon {
        let secret = scalar_from_bytes(&self.shares[index as usize].secret).unwrap();
        PartialBeacon {
            round,
            previous_signature: previous_signature.to_vec(),
            index,
            partial_signature: sign_partial(&secret, &beacon_message(round, previous_signature)),
        }
    }

    /// Valid chain from genesis through `last`.
    pub fn chain(&self, last: u64) -> Vec<BeaconEntry> {
        let mut cache = PartialCache::new(self.group.clone(), 4).unwrap();
        let mut chain = vec![BeaconEntry::genesis(self.group.genesis_seed)];
        for round in 1..=last {
            let prev = chain[chain.len() - 1].signature.clone();
            for index in 0..self.group.threshold {
                cache.add(self.partial(index, round, &prev)).unwrap();
            }
            let entry = cache.recover(round, &prev).unwrap();
            cache.set_tip(&entry);
            chain.push(entry);
        }
        chain
    }
}
