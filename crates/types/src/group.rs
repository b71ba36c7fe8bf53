//! Group descriptors and chain information.
//!
//! A [`Group`] is an immutable snapshot of the nodes running one beacon chain
//! for one key epoch. A successful DKG or resharing produces a *new* keyed
//! group; a keyed group is never re-keyed in place.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use crate::{canonical_beacon_id, sha256, G1Point, G2Point, DEFAULT_BEACON_ID, DEFAULT_SCHEME_ID};

/// Errors raised while building a group descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    #[error("Group has no nodes")]
    Empty,

    #[error("Invalid threshold {threshold} for {nodes} nodes")]
    InvalidThreshold { threshold: u32, nodes: usize },

    #[error("Duplicate node index {0}")]
    DuplicateIndex(u32),

    #[error("Duplicate node identity {0}")]
    DuplicateIdentity(String),

    #[error("Period must be non-zero")]
    ZeroPeriod,

    #[error("Group already holds a distributed key")]
    AlreadyKeyed,
}

/// A participant's public identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Position of the node in its group; shares are evaluated at `index + 1`
    pub index: u32,
    /// Identity key used to sign DKG bundles and seal deals
    pub public_key: G1Point,
    /// Private (peer plane) address
    pub address: String,
}

/// Feldman commitments to the shared polynomial; coefficient 0 is the
/// distributed public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistPublic {
    pub coefficients: Vec<G2Point>,
}

impl DistPublic {
    pub fn key(&self) -> Option<&G2Point> {
        self.coefficients.first()
    }
}

/// Immutable snapshot of a beacon group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Nodes sorted by index
    pub nodes: Vec<Node>,
    pub threshold: u32,
    /// Round duration in seconds
    pub period: u64,
    /// Unix time (seconds) anchoring the round schedule
    pub genesis_time: u64,
    /// Unix time at which this group takes over the chain
    pub transition_time: u64,
    /// Signature of the genesis entry; fixed for the lifetime of the chain
    pub genesis_seed: [u8; 32],
    pub scheme_id: String,
    pub beacon_id: String,
    pub public_key: Option<DistPublic>,
}

impl Group {
    /// Build a fresh (unkeyed) group for a new chain.
    pub fn new(
        mut nodes: Vec<Node>,
        threshold: u32,
        genesis_time: u64,
        period: u64,
        beacon_id: &str,
    ) -> Result<Self, GroupError> {
        validate_nodes(&mut nodes, threshold)?;
        if period == 0 {
            return Err(GroupError::ZeroPeriod);
        }

        let mut group = Self {
            nodes,
            threshold,
            period,
            genesis_time,
            transition_time: genesis_time,
            genesis_seed: [0u8; 32],
            scheme_id: DEFAULT_SCHEME_ID.to_string(),
            beacon_id: canonical_beacon_id(beacon_id).to_string(),
            public_key: None,
        };
        group.genesis_seed = group.hash();
        Ok(group)
    }

    /// Candidate group taking over this chain at `transition_time`.
    ///
    /// Genesis parameters carry over so the chain hash survives the epoch change.
    pub fn reshared(
        &self,
        mut nodes: Vec<Node>,
        threshold: u32,
        transition_time: u64,
    ) -> Result<Self, GroupError> {
        validate_nodes(&mut nodes, threshold)?;
        Ok(Self {
            nodes,
            threshold,
            period: self.period,
            genesis_time: self.genesis_time,
            transition_time,
            genesis_seed: self.genesis_seed,
            scheme_id: self.scheme_id.clone(),
            beacon_id: self.beacon_id.clone(),
            public_key: None,
        })
    }

    /// Keyed group made of the nodes in `present` that completed the DKG.
    pub fn finalize(&self, present: &[u32], public_key: DistPublic) -> Result<Self, GroupError> {
        if self.public_key.is_some() {
            return Err(GroupError::AlreadyKeyed);
        }
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| present.contains(&n.index))
            .cloned()
            .collect();
        validate_nodes(&mut nodes, self.threshold)?;

        Ok(Self {
            nodes,
            public_key: Some(public_key),
            ..self.clone()
        })
    }

    /// Smallest threshold accepted for groups created by a leader.
    pub fn minimum_threshold(n: usize) -> u32 {
        (n / 2 + 1) as u32
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: u32) -> Option<&Node> {
        self.nodes.iter().find(|n| n.index == index)
    }

    pub fn find(&self, public_key: &G1Point) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.public_key == public_key)
    }

    pub fn find_address(&self, address: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.address == address)
    }

    pub fn contains(&self, public_key: &G1Point) -> bool {
        self.find(public_key).is_some()
    }

    pub fn indices(&self) -> Vec<u32> {
        self.nodes.iter().map(|n| n.index).collect()
    }

    /// Digest over the node set and schedule (and the key, once set).
    pub fn hash(&self) -> [u8; 32] {
        let mut data = Vec::new();
        for node in &self.nodes {
            data.extend_from_slice(&node.index.to_be_bytes());
            data.extend_from_slice(&node.public_key.0);
        }
        data.extend_from_slice(&self.threshold.to_be_bytes());
        data.extend_from_slice(&self.genesis_time.to_be_bytes());
        if self.transition_time != self.genesis_time {
            data.extend_from_slice(&self.transition_time.to_be_bytes());
        }
        if let Some(public) = &self.public_key {
            for coeff in &public.coefficients {
                data.extend_from_slice(&coeff.0);
            }
        }
        if self.beacon_id != DEFAULT_BEACON_ID {
            data.extend_from_slice(self.beacon_id.as_bytes());
        }
        sha256(&data)
    }

    /// Public chain information; `None` until the group is keyed.
    pub fn chain_info(&self) -> Option<ChainInfo> {
        let public_key = self.public_key.as_ref()?.key()?.clone();
        Some(ChainInfo {
            public_key,
            period: self.period,
            genesis_time: self.genesis_time,
            genesis_seed: self.genesis_seed,
            scheme_id: self.scheme_id.clone(),
            beacon_id: self.beacon_id.clone(),
        })
    }

    pub fn chain_hash(&self) -> Option<ChainHash> {
        self.chain_info().map(|info| info.hash())
    }
}

fn validate_nodes(nodes: &mut Vec<Node>, threshold: u32) -> Result<(), GroupError> {
    if nodes.is_empty() {
        return Err(GroupError::Empty);
    }
    if threshold == 0 || threshold as usize > nodes.len() {
        return Err(GroupError::InvalidThreshold {
            threshold,
            nodes: nodes.len(),
        });
    }

    nodes.sort_by_key(|n| n.index);
    let mut indices = HashSet::new();
    let mut identities = HashSet::new();
    for node in nodes.iter() {
        if !indices.insert(node.index) {
            return Err(GroupError::DuplicateIndex(node.index));
        }
        if !identities.insert(node.public_key.clone()) {
            return Err(GroupError::DuplicateIdentity(node.address.clone()));
        }
    }
    Ok(())
}

/// Everything a client needs to verify a chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub public_key: G2Point,
    pub period: u64,
    pub genesis_time: u64,
    pub genesis_seed: [u8; 32],
    pub scheme_id: String,
    pub beacon_id: String,
}

impl ChainInfo {
    pub fn hash(&self) -> ChainHash {
        let mut data = Vec::new();
        data.extend_from_slice(&self.public_key.0);
        data.extend_from_slice(&self.period.to_be_bytes());
        data.extend_from_slice(&self.genesis_time.to_be_bytes());
        data.extend_from_slice(&self.genesis_seed);
        data.extend_from_slice(self.scheme_id.as_bytes());
        if self.beacon_id != DEFAULT_BEACON_ID {
            data.extend_from_slice(self.beacon_id.as_bytes());
        }
        ChainHash(sha256(&data))
    }
}

/// Self-certifying identifier of one (group, key) epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainHash(pub [u8; 32]);

impl ChainHash {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: u32) -> Vec<Node> {
        (0..n)
            .map(|i| Node {
                index: i,
                public_key: G1Point([i as u8 + 1; 48]),
                address: format!("127.0.0.1:{}", 9000 + i),
            })
            .collect()
    }

    fn keyed(group: &Group) -> Group {
        group
            .finalize(
                &group.indices(),
                DistPublic {
                    coefficients: vec![G2Point([5u8; 96]), G2Point([6u8; 96])],
                },
            )
            .unwrap()
    }

    #[test]
    fn test_group_validation() {
        assert_eq!(
            Group::new(nodes(3), 4, 0, 30, "").unwrap_err(),
            GroupError::InvalidThreshold {
                threshold: 4,
                nodes: 3
            }
        );
        assert_eq!(Group::new(vec![], 1, 0, 30, "").unwrap_err(), GroupError::Empty);
        assert_eq!(Group::new(nodes(3), 2, 0, 0, "").unwrap_err(), GroupError::ZeroPeriod);

        let mut dup = nodes(3);
        dup[2].index = 0;
        assert_eq!(
            Group::new(dup, 2, 0, 30, "").unwrap_err(),
            GroupError::DuplicateIndex(0)
        );
    }

    #[test]
    fn test_nodes_sorted_by_index() {
        let mut shuffled = nodes(4);
        shuffled.reverse();
        let group = Group::new(shuffled, 3, 0, 30, "").unwrap();
        assert_eq!(group.indices(), vec![0, 1, 2, 3]);
        assert_eq!(group.beacon_id, DEFAULT_BEACON_ID);
    }

    #[test]
    fn test_chain_hash_deterministic() {
        let a = keyed(&Group::new(nodes(4), 3, 1_000, 30, "fastnet").unwrap());
        let b = keyed(&Group::new(nodes(4), 3, 1_000, 30, "fastnet").unwrap());
        assert_eq!(a.chain_hash(), b.chain_hash());

        let other = keyed(&Group::new(nodes(4), 3, 1_000, 30, "slownet").unwrap());
        assert_ne!(a.chain_hash(), other.chain_hash());
    }

    #[test]
    fn test_unkeyed_group_has_no_chain_hash() {
        let group = Group::new(nodes(3), 2, 0, 30, "").unwrap();
        assert!(group.chain_hash().is_none());
    }

    #[test]
    fn test_finalize_drops_absent_nodes() {
        let group = Group::new(nodes(5), 3, 0, 30, "").unwrap();
        let public = DistPublic {
            coefficients: vec![G2Point([1u8; 96])],
        };

        let final_group = group.finalize(&[0, 1, 3, 4], public.clone()).unwrap();
        assert_eq!(final_group.indices(), vec![0, 1, 3, 4]);
        assert_eq!(final_group.genesis_seed, group.genesis_seed);

        assert!(matches!(
            group.finalize(&[0, 1], public.clone()),
            Err(GroupError::InvalidThreshold { .. })
        ));
        assert_eq!(
            final_group.finalize(&[0, 1, 3], public).unwrap_err(),
            GroupError::AlreadyKeyed
        );
    }

    #[test]
    fn test_reshare_preserves_chain_hash() {
        let old = keyed(&Group::new(nodes(4), 3, 1_000, 30, "").unwrap());
        let mut new_nodes = nodes(5);
        new_nodes.remove(0);
        let candidate = old.reshared(new_nodes, 3, 2_000).unwrap();
        let new = candidate
            .finalize(&candidate.indices(), old.public_key.clone().unwrap())
            .unwrap();

        assert_eq!(old.chain_hash(), new.chain_hash());
        assert_ne!(old.hash(), new.hash());
    }
}
