//! Threshold BLS primitives for the randomness beacon.
//!
//! This crate implements the cryptography shared by every node: threshold
//! BLS signatures on the BLS12-381 curve (signatures on G1, keys on G2),
//! identity keys used to authenticate DKG traffic, and sealing of DKG shares
//! to their recipients.
//!
//! # Overview
//!
//! 1. **Setup (DKG)**: Nodes generate a shared public key via distributed key
//!    generation. Each node holds a secret share sk_i.
//!
//! 2. **Partial signing**: For each round, every node signs the chained
//!    message with its share, producing σ_i = sk_i · H(m).
//!
//! 3. **Recovery**: Any threshold of valid partials are combined into the
//!    group signature σ = Σ λ_i · σ_i.
//!
//! 4. **Verification**: Anyone holding the distributed public key checks
//!    e(σ, g2) = e(H(m), PK).

pub mod curve;
pub mod ecies;
pub mod error;
pub mod identity;
pub mod threshold;

pub use curve::{
    compress_g1, compress_g2, decompress_g1, decompress_g2, random_scalar, scalar_from_bytes,
    scalar_to_bytes,
};
pub use ecies::{open, seal, Ciphertext};
pub use error::CryptoError;
pub use identity::{verify_identity_signature, IdentityKey};
pub use threshold::{
    add_commitments, eval_point, lagrange_coefficient, public_share, recover_secret,
    recover_signature, sign_partial, verify_partial, verify_signature,
};
