//! Beacon node error types.

use thiserror::Error;

use beacon_chain::{PartialError, StoreError, VerifyError};
use beacon_crypto::CryptoError;
use beacon_dkg::DkgError;
use beacon_types::GroupError;

use crate::key_store::KeyStoreError;
use crate::transport::TransportError;

/// Errors that can occur in the beacon node.
#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("Unknown chain hash {0}")]
    UnknownChainHash(String),

    #[error("Chain hash {chain_hash} does not belong to beacon {beacon_id}")]
    ChainHashIdentifierMismatch { chain_hash: String, beacon_id: String },

    #[error("Beacon {0} is not running")]
    BeaconNotRunning(String),

    #[error("Invalid partial signature from {index} for round {round}")]
    InvalidPartialSignature { index: u32, round: u64 },

    #[error("Invalid deal: {0}")]
    InvalidDeal(String),

    #[error("DKG timed out")]
    DkgTimeout,

    #[error("DKG session aborted: {0}")]
    SessionAborted(String),

    #[error("Peer {peer} answered round {expected} with a batch starting at {got}")]
    UnexpectedSyncBatch { peer: String, expected: u64, got: u64 },

    #[error("Sync failed: reached round {reached} of {target}")]
    SyncFailed { target: u64, reached: u64 },

    #[error("Recovered signature for round {0} is invalid")]
    RecoveredSignatureInvalid(u64),

    #[error("Beacon {0} has no distributed key")]
    NotKeyed(String),

    #[error("Node is not a member of the group of beacon {0}")]
    NotInGroup(String),

    #[error("A DKG is already in progress for beacon {0}")]
    DkgInProgress(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Dkg(#[from] DkgError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

impl From<PartialError> for BeaconError {
    fn from(e: PartialError) -> Self {
        match e {
            PartialError::InvalidPartialSignature { index, round } => {
                BeaconError::InvalidPartialSignature { index, round }
            }
            PartialError::RecoveredSignatureInvalid(round) => {
                BeaconError::RecoveredSignatureInvalid(round)
            }
            PartialError::Unkeyed => BeaconError::NotKeyed(String::new()),
            other => BeaconError::InvalidRequest(other.to_string()),
        }
    }
}

/// Result type for beacon operations.
pub type BeaconResult<T> = Result<T, BeaconError>;
