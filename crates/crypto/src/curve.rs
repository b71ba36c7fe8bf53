//! BLS12-381 point encoding and hashing to the curve.
//!
//! Messages are hashed with the RFC 9380 `expand_message_xmd` construction
//! (SHA-256, SSWU map). Beacon signatures live on G1 and identity signatures
//! on G2, each under its own domain separation tag.

use bls12_381::hash_to_curve::{ExpandMsgXmd, HashToCurve};
use bls12_381::{G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use group::Curve;
use rand::{CryptoRng, RngCore};

use beacon_types::{G1Point, G2Point, Scalar as TypesScalar};

use crate::error::CryptoError;

/// Domain separation tag for beacon signatures (G1).
pub const BEACON_DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";

/// Domain separation tag for identity signatures (G2).
pub const IDENTITY_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

type Xmd = ExpandMsgXmd<sha2_v09::Sha256>;

/// Hash a message to G1 under `dst`.
pub fn hash_to_g1(msg: &[u8], dst: &[u8]) -> G1Affine {
    <G1Projective as HashToCurve<Xmd>>::hash_to_curve(msg, dst).to_affine()
}

/// Hash a message to G2 under `dst`.
pub fn hash_to_g2(msg: &[u8], dst: &[u8]) -> G2Affine {
    <G2Projective as HashToCurve<Xmd>>::hash_to_curve(msg, dst).to_affine()
}

/// Generate a uniformly random scalar.
pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    let mut bytes = [0u8; 64];
    rng.fill_bytes(&mut bytes);
    Scalar::from_bytes_wide(&bytes)
}

pub fn compress_g1(point: &G1Affine) -> G1Point {
    G1Point(point.to_compressed())
}

pub fn decompress_g1(point: &G1Point) -> Result<G1Affine, CryptoError> {
    let decoded: Option<G1Affine> = G1Affine::from_compressed(&point.0).into();
    decoded.ok_or(CryptoError::InvalidG1Point)
}

/// Decode a G1 point from an untyped byte slice (e.g. a stored signature).
pub fn g1_from_slice(bytes: &[u8]) -> Result<G1Affine, CryptoError> {
    let array: [u8; 48] = bytes.try_into().map_err(|_| CryptoError::InvalidG1Point)?;
    decompress_g1(&G1Point(array))
}

pub fn compress_g2(point: &G2Affine) -> G2Point {
    G2Point(point.to_compressed())
}

pub fn decompress_g2(point: &G2Point) -> Result<G2Affine, CryptoError> {
    let decoded: Option<G2Affine> = G2Affine::from_compressed(&point.0).into();
    decoded.ok_or(CryptoError::InvalidG2Point)
}

pub fn scalar_to_bytes(scalar: &Scalar) -> TypesScalar {
    TypesScalar(scalar.to_bytes())
}

pub fn scalar_from_bytes(scalar: &TypesScalar) -> Result<Scalar, CryptoError> {
    let decoded: Option<Scalar> = Scalar::from_bytes(&scalar.0).into();
    decoded.ok_or(CryptoError::InvalidScalar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_hash_to_g1_is_deterministic() {
        let p1 = hash_to_g1(b"round 1", BEACON_DST);
        let p2 = hash_to_g1(b"round 2", BEACON_DST);
        let p3 = hash_to_g1(b"round 1", BEACON_DST);

        assert_ne!(p1, p2);
        assert_eq!(p1, p3);
        assert!(bool::from(p1.is_torsion_free()));
    }

    #[test]
    fn test_domain_separation() {
        assert_ne!(hash_to_g1(b"msg", BEACON_DST), hash_to_g1(b"msg", IDENTITY_DST));
    }

    #[test]
    fn test_point_encoding() {
        let s = random_scalar(&mut OsRng);
        let p = (G1Projective::generator() * s).to_affine();
        assert_eq!(decompress_g1(&compress_g1(&p)).unwrap(), p);
        assert_eq!(g1_from_slice(&p.to_compressed()).unwrap(), p);
        assert_eq!(g1_from_slice(&[1, 2, 3]), Err(CryptoError::InvalidG1Point));

        let q = (G2Projective::generator() * s).to_affine();
        assert_eq!(decompress_g2(&compress_g2(&q)).unwrap(), q);
        assert_eq!(decompress_g2(&G2Point([0xff; 96])), Err(CryptoError::InvalidG2Point));

        assert_eq!(scalar_from_bytes(&scalar_to_bytes(&s)).unwrap(), s);
        assert_eq!(
            scalar_from_bytes(&TypesScalar([0xff; 32])),
            Err(CryptoError::InvalidScalar)
        );
    }
}
