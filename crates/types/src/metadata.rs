//! Request metadata carried by every peer-plane and public call.

use serde::{Deserialize, Serialize};

/// Software version of the node issuing a request. Advisory only.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub prerelease: String,
}

impl NodeVersion {
    /// Parse `major.minor.patch[-prerelease]`.
    pub fn parse(version: &str) -> Option<Self> {
        let (core, prerelease) = match version.split_once('-') {
            Some((core, pre)) => (core, pre.to_string()),
            None => (version, String::new()),
        };
        let mut parts = core.split('.').map(|p| p.parse::<u32>());
        let major = parts.next()?.ok()?;
        let minor = parts.next()?.ok()?;
        let patch = parts.next()?.ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
            prerelease,
        })
    }

    /// Version of this build.
    pub fn current() -> Self {
        Self::parse(env!("CARGO_PKG_VERSION")).unwrap_or_default()
    }

    pub fn is_compatible_with(&self, other: &NodeVersion) -> bool {
        self.major == other.major
    }
}

/// Routing information for a request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub node_version: Option<NodeVersion>,
    /// Explicit beacon chain identifier; empty means "default" or "resolve by hash"
    pub beacon_id: String,
    /// Raw chain hash bytes; empty when absent
    pub chain_hash: Vec<u8>,
}

impl Metadata {
    pub fn for_beacon(beacon_id: &str) -> Self {
        Self {
            node_version: Some(NodeVersion::current()),
            beacon_id: beacon_id.to_string(),
            chain_hash: Vec::new(),
        }
    }

    pub fn for_chain_hash(chain_hash: &[u8]) -> Self {
        Self {
            node_version: Some(NodeVersion::current()),
            beacon_id: String::new(),
            chain_hash: chain_hash.to_vec(),
        }
    }

    pub fn with_chain_hash(mut self, chain_hash: &[u8]) -> Self {
        self.chain_hash = chain_hash.to_vec();
        self
    }
}
