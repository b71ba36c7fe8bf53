//! Core type definitions for the threshold randomness beacon.
//!
//! This crate provides the shared data structures used across the beacon
//! workspace, including compressed curve points, group descriptors, beacon
//! entries and the request metadata used to route calls to a beacon chain.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

pub mod beacon;
pub mod group;
pub mod metadata;

pub use beacon::{
    beacon_message, current_round, randomness_from_signature, time_of_round, BeaconEntry,
    PartialBeacon, PublicRandResponse,
};
pub use group::{ChainHash, ChainInfo, DistPublic, Group, GroupError, Node};
pub use metadata::{Metadata, NodeVersion};

// =========================
// CRYPTOGRAPHIC PRIMITIVES
// =========================

/// Compressed G1 point on BLS12-381 (48 bytes)
#[serde_as]
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct G1Point(#[serde_as(as = "[_; 48]")] pub [u8; 48]);

impl Default for G1Point {
    fn default() -> Self {
        Self([0u8; 48])
    }
}

impl G1Point {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Compressed G2 point on BLS12-381 (96 bytes)
#[serde_as]
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct G2Point(#[serde_as(as = "[_; 96]")] pub [u8; 96]);

impl Default for G2Point {
    fn default() -> Self {
        Self([0u8; 96])
    }
}

impl G2Point {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Scalar field element (32 bytes, little-endian)
#[serde_as]
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Scalar(#[serde_as(as = "[_; 32]")] pub [u8; 32]);

impl Default for Scalar {
    fn default() -> Self {
        Self([0u8; 32])
    }
}

// Scalars hold key material; never print them.
impl std::fmt::Debug for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Scalar(..)")
    }
}

// =========================
// BEACON IDENTIFIERS
// =========================

/// Canonical name of the well-known chain addressed by the empty identifier.
pub const DEFAULT_BEACON_ID: &str = "default";

/// Scheme identifier of the chained BLS beacon (signatures on G1, keys on G2).
pub const DEFAULT_SCHEME_ID: &str = "pedersen-bls-chained";

/// Map the empty identifier onto the default chain name.
pub fn canonical_beacon_id(beacon_id: &str) -> &str {
    if beacon_id.is_empty() {
        DEFAULT_BEACON_ID
    } else {
        beacon_id
    }
}

/// Compare two beacon identifiers, treating `""` and `"default"` as equal.
pub fn compare_beacon_ids(a: &str, b: &str) -> bool {
    canonical_beacon_id(a) == canonical_beacon_id(b)
}

// =========================
// HELPER FUNCTIONS
// =========================

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_beacon_id_comparison() {
        assert!(compare_beacon_ids("", DEFAULT_BEACON_ID));
        assert!(compare_beacon_ids(DEFAULT_BEACON_ID, ""));
        assert!(compare_beacon_ids("fastnet", "fastnet"));
        assert!(!compare_beacon_ids("fastnet", ""));
        assert_eq!(canonical_beacon_id(""), "default");
    }

    #[test]
    fn test_g1_point_serialization() {
        let point = G1Point([42u8; 48]);
        let encoded = borsh::to_vec(&point).unwrap();
        let decoded: G1Point = borsh::from_slice(&encoded).unwrap();
        assert_eq!(point, decoded);

        let json = serde_json::to_string(&point).unwrap();
        let decoded: G1Point = serde_json::from_str(&json).unwrap();
        assert_eq!(point, decoded);
    }

    #[test]
    fn test_scalar_debug_is_redacted() {
        let secret = Scalar([7u8; 32]);
        assert_eq!(format!("{secret:?}"), "Scalar(..)");
    }
}
