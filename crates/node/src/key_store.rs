//! Persistent key, group and chain material, one folder per beacon id.
//!
//! ```text
//! <data>/multibeacon/<beacon id>/key/identity.json
//! <data>/multibeacon/<beacon id>/key/dist_key.private
//! <data>/multibeacon/<beacon id>/groups/group.json
//! <data>/multibeacon/<beacon id>/db/chain.log
//! ```

use parking_lot::Mutex;
use rand::{CryptoRng, RngCore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use beacon_chain::{FileStore, MemStore, Store, StoreError};
use beacon_crypto::{CryptoError, IdentityKey};
use beacon_dkg::DistKeyShare;
use beacon_types::{canonical_beacon_id, G1Point, Group, Scalar};

use crate::messages::Identity;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("No key pair for beacon {0}")]
    MissingKeyPair(String),

    #[error("Malformed {file}: {reason}")]
    Malformed { file: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type KeyStoreResult<T> = Result<T, KeyStoreError>;

/// Long-term identity of a node for one beacon.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyPair {
    pub address: String,
    pub public_key: G1Point,
    secret: Scalar,
}

impl KeyPair {
    pub fn generate<R: RngCore + CryptoRng>(address: &str, rng: &mut R) -> Self {
        let key = IdentityKey::generate(rng);
        Self {
            address: address.to_string(),
            public_key: key.public().clone(),
            secret: key.to_bytes(),
        }
    }

    pub fn identity_key(&self) -> KeyStoreResult<IdentityKey> {
        Ok(IdentityKey::from_bytes(&self.secret)?)
    }

    pub fn identity(&self) -> Identity {
        Identity {
            address: self.address.clone(),
            public_key: self.public_key.clone(),
        }
    }
}

/// Storage of everything a beacon process needs to restart.
pub trait KeyStore: Send + Sync {
    /// Beacon ids with stored material.
    fn beacon_ids(&self) -> KeyStoreResult<Vec<String>>;

    fn save_key_pair(&self, beacon_id: &str, key_pair: &KeyPair) -> KeyStoreResult<()>;

    fn load_key_pair(&self, beacon_id: &str) -> KeyStoreResult<KeyPair>;

    fn save_group(&self, beacon_id: &str, group: &Group) -> KeyStoreResult<()>;

    fn load_group(&self, beacon_id: &str) -> KeyStoreResult<Option<Group>>;

    fn save_share(&self, beacon_id: &str, share: &DistKeyShare) -> KeyStoreResult<()>;

    fn load_share(&self, beacon_id: &str) -> KeyStoreResult<Option<DistKeyShare>>;

    /// Chain store of the beacon, created on first use.
    fn chain_store(&self, beacon_id: &str) -> KeyStoreResult<Arc<dyn Store>>;
}

const MULTIBEACON_FOLDER: &str = "multibeacon";
const KEY_FOLDER: &str = "key";
const GROUP_FOLDER: &str = "groups";
const DB_FOLDER: &str = "db";
const IDENTITY_FILE: &str = "identity.json";
const SHARE_FILE: &str = "dist_key.private";
const GROUP_FILE: &str = "group.json";
const CHAIN_FILE: &str = "chain.log";

/// Key store on the local filesystem.
pub struct FileKeyStore {
    root: PathBuf,
    /// Open chain stores; a chain file has a single writer
    stores: Mutex<BTreeMap<String, Arc<dyn Store>>>,
}

impl FileKeyStore {
    pub fn new(data_folder: impl AsRef<Path>) -> KeyStoreResult<Self> {
        let root = data_folder.as_ref().join(MULTIBEACON_FOLDER);
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            stores: Mutex::new(BTreeMap::new()),
        })
    }

    fn beacon_folder(&self, beacon_id: &str) -> PathBuf {
        self.root.join(canonical_beacon_id(beacon_id))
    }

    fn save<T: Serialize>(&self, path: PathBuf, value: &T) -> KeyStoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(value).map_err(|e| KeyStoreError::Malformed {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;
        fs::write(&path, json)?;
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, path: PathBuf) -> KeyStoreResult<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| KeyStoreError::Malformed {
                file: path.display().to_string(),
                reason: e.to_string(),
            })
    }
}

impl KeyStore for FileKeyStore {
    fn beacon_ids(&self) -> KeyStoreResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let has_key = entry.path().join(KEY_FOLDER).join(IDENTITY_FILE).exists();
            if entry.file_type()?.is_dir() && has_key {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn save_key_pair(&self, beacon_id: &str, key_pair: &KeyPair) -> KeyStoreResult<()> {
        let path = self.beacon_folder(beacon_id).join(KEY_FOLDER).join(IDENTITY_FILE);
        self.save(path, key_pair)
    }

    fn load_key_pair(&self, beacon_id: &str) -> KeyStoreResult<KeyPair> {
        let path = self.beacon_folder(beacon_id).join(KEY_FOLDER).join(IDENTITY_FILE);
        self.load(path)?
            .ok_or_else(|| KeyStoreError::MissingKeyPair(canonical_beacon_id(beacon_id).to_string()))
    }

    fn save_group(&self, beacon_id: &str, group: &Group) -> KeyStoreResult<()> {
        let path = self.beacon_folder(beacon_id).join(GROUP_FOLDER).join(GROUP_FILE);
        self.save(path, group)
    }

    fn load_group(&self, beacon_id: &str) -> KeyStoreResult<Option<Group>> {
        self.load(self.beacon_folder(beacon_id).join(GROUP_FOLDER).join(GROUP_FILE))
    }

    fn save_share(&self, beacon_id: &str, share: &DistKeyShare) -> KeyStoreResult<()> {
        let path = self.beacon_folder(beacon_id).join(KEY_FOLDER).join(SHARE_FILE);
        self.save(path, share)
    }

    fn load_share(&self, beacon_id: &str) -> KeyStoreResult<Option<DistKeyShare>> {
        self.load(self.beacon_folder(beacon_id).join(KEY_FOLDER).join(SHARE_FILE))
    }

    fn chain_store(&self, beacon_id: &str) -> KeyStoreResult<Arc<dyn Store>> {
        let id = canonical_beacon_id(beacon_id).to_string();
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(&id) {
            return Ok(store.clone());
        }
        let path = self.beacon_folder(&id).join(DB_FOLDER).join(CHAIN_FILE);
        let store: Arc<dyn Store> = Arc::new(FileStore::open(path)?);
        stores.insert(id, store.clone());
        Ok(store)
    }
}

#[derive(Default)]
struct MemBeacon {
    key_pair: Option<KeyPair>,
    group: Option<Group>,
    share: Option<DistKeyShare>,
    store: Option<Arc<dyn Store>>,
}

/// Key store kept in memory; survives daemon restarts within a process.
#[derive(Default)]
pub struct MemKeyStore {
    beacons: Mutex<BTreeMap<String, MemBeacon>>,
}

impl MemKeyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_beacon<T>(&self, beacon_id: &str, f: impl FnOnce(&mut MemBeacon) -> T) -> T {
        let mut beacons = self.beacons.lock();
        let beacon = beacons
            .entry(canonical_beacon_id(beacon_id).to_string())
            .or_default();
        f(beacon)
    }
}

impl KeyStore for MemKeyStore {
    fn beacon_ids(&self) -> KeyStoreResult<Vec<String>> {
        Ok(self
            .beacons
            .lock()
            .iter()
            .filter(|(_, b)| b.key_pair.is_some())
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn save_key_pair(&self, beacon_id: &str, key_pair: &KeyPair) -> KeyStoreResult<()> {
        self.with_beacon(beacon_id, |b| b.key_pair = Some(key_pair.clone()));
        Ok(())
    }

    fn load_key_pair(&self, beacon_id: &str) -> KeyStoreResult<KeyPair> {
        self.with_beacon(beacon_id, |b| b.key_pair.clone())
            .ok_or_else(|| KeyStoreError::MissingKeyPair(canonical_beacon_id(beacon_id).to_string()))
    }

    fn save_group(&self, beacon_id: &str, group: &Group) -> KeyStoreResult<()> {
        self.with_beacon(beacon_id, |b| b.group = Some(group.clone()));
        Ok(())
    }

    fn load_group(&self, beacon_id: &str) -> KeyStoreResult<Option<Group>> {
        Ok(self.with_beacon(beacon_id, |b| b.group.clone()))
    }

    fn save_share(&self, beacon_id: &str, share: &DistKeyShare) -> KeyStoreResult<()> {
        self.with_beacon(beacon_id, |b| b.share = Some(share.clone()));
        Ok(())
    }

    fn load_share(&self, beacon_id: &str) -> KeyStoreResult<Option<DistKeyShare>> {
        Ok(self.with_beacon(beacon_id, |b| b.share.clone()))
    }

    fn chain_store(&self, beacon_id: &str) -> KeyStoreResult<Arc<dyn Store>> {
        Ok(self.with_beacon(beacon_id, |b| {
            b.store
                .get_or_insert_with(|| Arc::new(MemStore::new()) as Arc<dyn Store>)
                .clone()
        }))
    }
}
