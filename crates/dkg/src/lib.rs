//! Distributed Key Generation and resharing for the randomness beacon.
//!
//! Implements a (t, n) threshold key generation protocol using Feldman VSS:
//!
//! 1. Each dealer samples a polynomial of degree t-1 (random constant term,
//!    or its current share when resharing) and broadcasts commitments plus
//!    one sealed share per holder
//! 2. Holders verify their shares and broadcast a response listing complaints
//! 3. Dealers with complaints reveal the disputed shares; unresolved
//!    complaints disqualify the dealer
//! 4. Holders combine the qualified contributions into their new share
//!
//! # Security
//!
//! - Privacy holds against up to t-1 corrupt participants
//! - Every bundle is signed with the sender's identity key
//! - Resharing keeps the distributed public key unchanged

pub mod feldman;
pub mod participant;
pub mod types;

pub use participant::{DkgError, DkgParticipant, DkgResult};
pub use types::{
    Deal, DealBundle, DistKeyShare, DkgConfig, DkgOutput, DkgPacket, Justification,
    JustificationBundle, Phase, ReshareParams, Response, ResponseBundle, ResponseOutcome, Status,
};
