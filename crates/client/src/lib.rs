//! Verifying client for the randomness beacon.
//!
//! A [`BeaconClient`] fetches the chain information of one chain, checks it
//! against the chain hash it was pinned to, and verifies every randomness
//! response before returning it. Responses come from a [`BeaconSource`],
//! usually a node's public JSON-RPC API ([`HttpSource`]).

pub mod source;
pub mod verify;

pub use source::{BeaconSource, HttpSource};
pub use verify::{BeaconClient, ClientError, ClientResult};
