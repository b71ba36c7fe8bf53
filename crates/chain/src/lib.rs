//! Beacon chain storage and verification.
//!
//! This crate holds everything a node needs to keep a chain consistent:
//! 1. An append-only store of finalized entries (in memory or on disk)
//! 2. A per-round cache of verified partial signatures, recovering the
//!    group signature once the threshold is met
//! 3. Verification of entries against the chain's distributed key

pub mod file_store;
pub mod partials;
pub mod store;
pub mod verifier;

pub use file_store::FileStore;
pub use partials::{PartialCache, PartialError, RoundPartials, RoundState};
pub use store::{MemStore, Store, StoreError, StoreResult};
pub use verifier::{ChainVerifier, VerifyError};
