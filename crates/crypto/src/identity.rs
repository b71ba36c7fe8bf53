//! Long-term node identity keys.
//!
//! Identity public keys live on G1 (so they double as ECDH keys for sealing
//! deals) and identity signatures on G2.

use bls12_381::{pairing, G1Affine, G2Projective, Scalar};
use group::Curve;
use rand::{CryptoRng, RngCore};

use beacon_types::{G1Point, G2Point, Scalar as TypesScalar};

use crate::curve::{
    compress_g1, compress_g2, decompress_g1, decompress_g2, hash_to_g2, random_scalar,
    scalar_from_bytes, scalar_to_bytes, IDENTITY_DST,
};
use crate::error::CryptoError;

/// A node's identity key pair.
#[derive(Clone)]
pub struct IdentityKey {
    secret: Scalar,
    public: G1Point,
}

impl IdentityKey {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_scalar(random_scalar(rng))
    }

    pub fn from_bytes(secret: &TypesScalar) -> Result<Self, CryptoError> {
        Ok(Self::from_scalar(scalar_from_bytes(secret)?))
    }

    fn from_scalar(secret: Scalar) -> Self {
        let public = compress_g1(&(G1Affine::generator() * secret).to_affine());
        Self { secret, public }
    }

    pub fn public(&self) -> &G1Point {
        &self.public
    }

    pub fn secret(&self) -> &Scalar {
        &self.secret
    }

    pub fn to_bytes(&self) -> TypesScalar {
        scalar_to_bytes(&self.secret)
    }

    /// Sign `msg` with the identity key.
    pub fn sign(&self, msg: &[u8]) -> G2Point {
        let h = hash_to_g2(msg, IDENTITY_DST);
        compress_g2(&(G2Projective::from(h) * self.secret).to_affine())
    }
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKey")
            .field("public", &self.public.to_hex())
            .finish_non_exhaustive()
    }
}

/// Verify an identity signature.
pub fn verify_identity_signature(
    public: &G1Point,
    msg: &[u8],
    signature: &G2Point,
) -> Result<(), CryptoError> {
    let pk = decompress_g1(public)?;
    let sig = decompress_g2(signature).map_err(|_| CryptoError::InvalidSignature)?;
    let h = hash_to_g2(msg, IDENTITY_DST);
    if pairing(&G1Affine::generator(), &sig) == pairing(&pk, &h) {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}
