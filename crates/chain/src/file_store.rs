//! File-backed store: an append-only log of length-prefixed borsh records.
//!
//! The log is replayed into memory on open. A truncated trailing record (a
//! crash mid-append) is cut off; any other inconsistency is an error.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use beacon_types::BeaconEntry;

use crate::store::{check_append, get_round, range_of, Store, StoreError, StoreResult};

struct Inner {
    file: File,
    entries: Vec<BeaconEntry>,
}

pub struct FileStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileStore {
    /// Open (or create) the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let (entries, valid_len) = replay(&data)?;
        if valid_len < data.len() {
            warn!(
                path = %path.display(),
                dropped = data.len() - valid_len,
                "Truncating incomplete trailing record"
            );
            file.set_len(valid_len as u64)?;
        }

        info!(path = %path.display(), entries = entries.len(), "Opened chain store");
        Ok(Self {
            path,
            inner: Mutex::new(Inner { file, entries }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn replay(data: &[u8]) -> StoreResult<(Vec<BeaconEntry>, usize)> {
    let mut entries: Vec<BeaconEntry> = Vec::new();
    let mut offset = 0;
    while offset + 4 <= data.len() {
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[offset..offset + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let end = offset + 4 + len;
        if end > data.len() {
            break;
        }
        let entry: BeaconEntry = borsh::from_slice(&data[offset + 4..end])
            .map_err(|e| StoreError::Corrupt(format!("record at offset {offset}: {e}")))?;
        check_append(entries.last(), &entry)
            .map_err(|e| StoreError::Corrupt(format!("record at offset {offset}: {e}")))?;
        entries.push(entry);
        offset = end;
    }
    Ok((entries, offset))
}

impl Store for FileStore {
    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn put(&self, entry: BeaconEntry) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        check_append(inner.entries.last(), &entry)?;

        let body = borsh::to_vec(&entry)?;
        let mut record = Vec::with_capacity(body.len() + 4);
        record.extend_from_slice(&(body.len() as u32).to_le_bytes());
        record.extend_from_slice(&body);
        inner.file.write_all(&record)?;
        inner.file.sync_data()?;

        inner.entries.push(entry);
        Ok(())
    }

    fn last(&self) -> StoreResult<BeaconEntry> {
        self.inner.lock().entries.last().cloned().ok_or(StoreError::Empty)
    }

    fn get(&self, round: u64) -> StoreResult<BeaconEntry> {
        get_round(&self.inner.lock().entries, round)
    }

    fn range(&self, from: u64, limit: usize) -> StoreResult<Vec<BeaconEntry>> {
        Ok(range_of(&self.inner.lock().entries, from, limit))
    }
}
