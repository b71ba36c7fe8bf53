//! Routing of requests to beacon processes.
//!
//! A daemon hosts one process per beacon id. Requests name their chain either
//! by beacon id or by chain hash; when a chain hash is present it wins and the
//! request's beacon id is rewritten to the one owning the hash.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use beacon_types::{canonical_beacon_id, ChainHash, Metadata};

use crate::error::{BeaconError, BeaconResult};

struct Inner<P> {
    processes: HashMap<String, Arc<P>>,
    /// Lowercase hex chain hash to beacon id
    chain_hashes: HashMap<String, String>,
}

/// Beacon id and chain hash index over the running processes.
pub struct BeaconRegistry<P> {
    inner: Mutex<Inner<P>>,
}

impl<P> Default for BeaconRegistry<P> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                processes: HashMap::new(),
                chain_hashes: HashMap::new(),
            }),
        }
    }
}

impl<P> BeaconRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process; replaces any process with the same id.
    pub fn add_process(&self, beacon_id: &str, process: Arc<P>) {
        let id = canonical_beacon_id(beacon_id).to_string();
        debug!(beacon_id = %id, "Registering beacon process");
        self.inner.lock().processes.insert(id, process);
    }

    /// Index a chain hash once the beacon holds a distributed key.
    pub fn add_chain_hash(&self, chain_hash: &ChainHash, beacon_id: &str) {
        let id = canonical_beacon_id(beacon_id).to_string();
        debug!(beacon_id = %id, chain_hash = %chain_hash, "Registering chain hash");
        self.inner.lock().chain_hashes.insert(chain_hash.to_hex(), id);
    }

    /// Drop a process and every chain hash pointing at it.
    pub fn remove(&self, beacon_id: &str) -> Option<Arc<P>> {
        let id = canonical_beacon_id(beacon_id);
        let mut inner = self.inner.lock();
        inner.chain_hashes.retain(|_, owner| owner != id);
        inner.processes.remove(id)
    }

    pub fn get(&self, beacon_id: &str) -> Option<Arc<P>> {
        self.inner
            .lock()
            .processes
            .get(canonical_beacon_id(beacon_id))
            .cloned()
    }

    pub fn beacon_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().processes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn processes(&self) -> Vec<Arc<P>> {
        self.inner.lock().processes.values().cloned().collect()
    }

    /// Beacon id addressed by a request, rewriting its metadata when the
    /// chain hash names the chain.
    pub fn read_beacon_id(&self, metadata: &mut Metadata) -> BeaconResult<String> {
        if metadata.chain_hash.is_empty() {
            return Ok(canonical_beacon_id(&metadata.beacon_id).to_string());
        }

        let chain_hash = hex::encode(&metadata.chain_hash);
        let inner = self.inner.lock();
        let owner = inner
            .chain_hashes
            .get(&chain_hash)
            .ok_or_else(|| BeaconError::UnknownChainHash(chain_hash.clone()))?;

        if !metadata.beacon_id.is_empty() && canonical_beacon_id(&metadata.beacon_id) != owner {
            return Err(BeaconError::ChainHashIdentifierMismatch {
                chain_hash,
                beacon_id: metadata.beacon_id.clone(),
            });
        }
        metadata.beacon_id = owner.clone();
        Ok(owner.clone())
    }

    /// Process addressed by a request.
    pub fn resolve(&self, metadata: &mut Metadata) -> BeaconResult<Arc<P>> {
        let beacon_id = self.read_beacon_id(metadata)?;
        self.get(&beacon_id)
            .ok_or(BeaconError::BeaconNotRunning(beacon_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> ChainHash {
        ChainHash([byte; 32])
    }

    fn registry() -> BeaconRegistry<&'static str> {
        let registry = BeaconRegistry::new();
        registry.add_process("", Arc::new("default process"));
        registry.add_process("fast", Arc::new("fast process"));
        registry.add_chain_hash(&hash(1), "default");
        registry.add_chain_hash(&hash(2), "fast");
        registry
    }

    #[test]
    fn test_resolve_by_id() {
        let registry = registry();
        let mut md = Metadata::for_beacon("");
        assert_eq!(*registry.resolve(&mut md).unwrap(), "default process");

        let mut md = Metadata::for_beacon("fast");
        assert_eq!(*registry.resolve(&mut md).unwrap(), "fast process");

        let mut md = Metadata::for_beacon("slow");
        assert!(matches!(
            registry.resolve(&mut md),
            Err(BeaconError::BeaconNotRunning(id)) if id == "slow"
        ));
    }

    #[test]
    fn test_chain_hash_rewrites_beacon_id() {
        let registry = registry();

        let mut md = Metadata::for_chain_hash(&hash(2).0);
        assert_eq!(*registry.resolve(&mut md).unwrap(), "fast process");
        assert_eq!(md.beacon_id, "fast");

        // An empty id is filled in, "default" matches the default chain
        let mut md = Metadata::for_beacon("default").with_chain_hash(&hash(1).0);
        assert_eq!(registry.read_beacon_id(&mut md).unwrap(), "default");
    }

    #[test]
    fn test_chain_hash_mismatch_and_unknown() {
        let registry = registry();

        let mut md = Metadata::for_beacon("default").with_chain_hash(&hash(2).0);
        assert!(matches!(
            registry.read_beacon_id(&mut md),
            Err(BeaconError::ChainHashIdentifierMismatch { .. })
        ));
        assert_eq!(md.beacon_id, "default");

        let mut md = Metadata::for_chain_hash(&hash(9).0);
        assert!(matches!(
            registry.read_beacon_id(&mut md),
            Err(BeaconError::UnknownChainHash(h)) if h == hash(9).to_hex()
        ));
    }

    #[test]
    fn test_remove_drops_chain_hashes() {
        let registry = registry();
        assert!(registry.remove("fast").is_some());
        assert_eq!(registry.beacon_ids(), vec!["default"]);

        let mut md = Metadata::for_chain_hash(&hash(2).0);
        assert!(matches!(
            registry.resolve(&mut md),
            Err(BeaconError::UnknownChainHash(_))
        ));
        assert!(registry.remove("fast").is_none());
    }
}
