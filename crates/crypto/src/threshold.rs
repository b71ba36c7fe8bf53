//! Threshold BLS signatures over beacon messages.
//!
//! In a (t, n) threshold scheme:
//! - n nodes each hold a secret share sk_i = f(i + 1)
//! - Any t partial signatures recover the group signature
//! - Fewer than t partials reveal nothing about it
//!
//! # Partial Signature
//!
//! For message `m`, node i computes σ_i = sk_i · H(m) on G1.
//!
//! # Verification
//!
//! A partial is checked against the public polynomial F (Feldman commitments
//! on G2) by the pairing equation e(σ_i, g2) = e(H(m), F(i + 1)).
//!
//! # Recovery
//!
//! Given t valid partials, σ = Σ λ_i · σ_i where λ_i are Lagrange
//! coefficients at x = 0.

use bls12_381::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::Curve;
use std::collections::HashSet;

use beacon_types::{G1Point, G2Point};

use crate::curve::{
    compress_g1, compress_g2, decompress_g1, decompress_g2, g1_from_slice, hash_to_g1, BEACON_DST,
};
use crate::error::CryptoError;

/// x-coordinate at which the share of `index` is evaluated.
pub fn eval_point(index: u32) -> Scalar {
    Scalar::from(index as u64 + 1)
}

/// Evaluate the public polynomial at the share point of `index`.
///
/// Returns g2^{f(index + 1)}, the public key of that share.
pub fn public_share(commitments: &[G2Point], index: u32) -> Result<G2Affine, CryptoError> {
    if commitments.is_empty() {
        return Err(CryptoError::EmptyPolynomial);
    }
    let x = eval_point(index);
    let mut result = G2Projective::identity();
    for commitment in commitments.iter().rev() {
        result = result * x + G2Projective::from(decompress_g2(commitment)?);
    }
    Ok(result.to_affine())
}

/// Sum two public polynomials coefficient by coefficient.
pub fn add_commitments(a: &[G2Point], b: &[G2Point]) -> Result<Vec<G2Point>, CryptoError> {
    let len = a.len().max(b.len());
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let mut sum = G2Projective::identity();
        if let Some(c) = a.get(i) {
            sum += G2Projective::from(decompress_g2(c)?);
        }
        if let Some(c) = b.get(i) {
            sum += G2Projective::from(decompress_g2(c)?);
        }
        out.push(compress_g2(&sum.to_affine()));
    }
    Ok(out)
}

/// Compute a partial signature over `msg` with a secret share.
pub fn sign_partial(secret_share: &Scalar, msg: &[u8]) -> G1Point {
    let h = hash_to_g1(msg, BEACON_DST);
    compress_g1(&(G1Projective::from(h) * secret_share).to_affine())
}

/// Verify the partial signature of `index` against the public polynomial.
pub fn verify_partial(
    commitments: &[G2Point],
    index: u32,
    msg: &[u8],
    partial: &G1Point,
) -> Result<(), CryptoError> {
    let pk = public_share(commitments, index)?;
    let sig = decompress_g1(partial).map_err(|_| CryptoError::InvalidPartial(index))?;
    if pairing_check(&sig, &pk, msg) {
        Ok(())
    } else {
        Err(CryptoError::InvalidPartial(index))
    }
}

/// Verify a recovered signature against the distributed public key.
pub fn verify_signature(public_key: &G2Point, msg: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let pk = decompress_g2(public_key)?;
    let sig = g1_from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    if pairing_check(&sig, &pk, msg) {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}

fn pairing_check(sig: &G1Affine, pk: &G2Affine, msg: &[u8]) -> bool {
    let h = hash_to_g1(msg, BEACON_DST);
    pairing(sig, &G2Affine::generator()) == pairing(&h, pk)
}

/// Recover the group signature from partial signatures.
///
/// Uses the first `threshold` partials; callers verify partials beforehand.
pub fn recover_signature(partials: &[(u32, G1Point)], threshold: usize) -> Result<G1Point, CryptoError> {
    if threshold == 0 || partials.len() < threshold {
        return Err(CryptoError::InsufficientShares {
            required: threshold,
            got: partials.len(),
        });
    }

    let unique: HashSet<u32> = partials.iter().map(|(idx, _)| *idx).collect();
    if unique.len() != partials.len() {
        return Err(CryptoError::DuplicateShareIndex);
    }

    let selected = &partials[..threshold];
    let indices: Vec<u32> = selected.iter().map(|(idx, _)| *idx).collect();

    let mut result = G1Projective::identity();
    for (idx, sig_point) in selected {
        let sig = decompress_g1(sig_point).map_err(|_| CryptoError::InvalidPartial(*idx))?;
        let lambda = lagrange_coefficient(*idx, &indices)?;
        result += G1Projective::from(sig) * lambda;
    }

    Ok(compress_g1(&result.to_affine()))
}

/// Lagrange coefficient at x = 0 for share `i` among `indices`.
///
/// λ_i = Π_{j≠i} x_j / (x_j - x_i), with x_k = k + 1.
pub fn lagrange_coefficient(i: u32, indices: &[u32]) -> Result<Scalar, CryptoError> {
    let x_i = eval_point(i);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &j in indices {
        if j == i {
            continue;
        }
        let x_j = eval_point(j);
        numerator *= x_j;
        denominator *= x_j - x_i;
    }

    let inverse: Option<Scalar> = denominator.invert().into();
    inverse
        .map(|inv| numerator * inv)
        .ok_or(CryptoError::LagrangeInterpolationFailed)
}

/// Recover a secret from scalar shares (used by resharing and in tests).
pub fn recover_secret(shares: &[(u32, Scalar)]) -> Result<Scalar, CryptoError> {
    if shares.is_empty() {
        return Err(CryptoError::InsufficientShares { required: 1, got: 0 });
    }
    let indices: Vec<u32> = shares.iter().map(|(i, _)| *i).collect();
    let mut secret = Scalar::ZERO;
    for (i, share) in shares {
        secret += lagrange_coefficient(*i, &indices)? * share;
    }
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::random_scalar;
    use rand::rngs::OsRng;

    struct Dealer {
        secret: Scalar,
        coefficients: Vec<Scalar>,
        commitments: Vec<G2Point>,
    }

    fn deal(threshold: usize) -> Dealer {
        let coefficients: Vec<Scalar> = (0..threshold).map(|_| random_scalar(&mut OsRng)).collect();
        let commitments = coefficients
            .iter()
            .map(|c| compress_g2(&(G2Projective::generator() * c).to_affine()))
            .collect();
        Dealer {
            secret: coefficients[0],
            coefficients,
            commitments,
        }
    }

    fn share(dealer: &Dealer, index: u32) -> Scalar {
        let x = eval_point(index);
        dealer
            .coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, c| acc * x + c)
    }

    #[test]
    fn test_lagrange_coefficients_sum_to_one() {
        let indices = vec![0, 1, 2];
        let sum: Scalar = indices
            .iter()
            .map(|i| lagrange_coefficient(*i, &indices).unwrap())
            .sum();
        assert_eq!(sum, Scalar::ONE);
    }

    #[test]
    fn test_public_share_matches_secret_share() {
        let dealer = deal(3);
        for index in 0..5 {
            let expected = (G2Projective::generator() * share(&dealer, index)).to_affine();
            assert_eq!(public_share(&dealer.commitments, index).unwrap(), expected);
        }
        assert_eq!(public_share(&[], 0), Err(CryptoError::EmptyPolynomial));
    }

    #[test]
    fn test_partial_sign_and_verify() {
        let dealer = deal(2);
        let msg = b"beacon round 7";
        let partial = sign_partial(&share(&dealer, 1), msg);

        assert!(verify_partial(&dealer.commitments, 1, msg, &partial).is_ok());
        assert_eq!(
            verify_partial(&dealer.commitments, 2, msg, &partial),
            Err(CryptoError::InvalidPartial(2))
        );
        assert!(verify_partial(&dealer.commitments, 1, b"other", &partial).is_err());
    }

    #[test]
    fn test_recover_from_any_subset() {
        let dealer = deal(3);
        let msg = b"beacon round 8";
        let partials: Vec<(u32, G1Point)> = (0..5)
            .map(|i| (i, sign_partial(&share(&dealer, i), msg)))
            .collect();

        let public_key = &dealer.commitments[0];
        let sig_a = recover_signature(&partials[..3], 3).unwrap();
        let sig_b = recover_signature(&partials[2..], 3).unwrap();
        assert_eq!(sig_a, sig_b);
        assert!(verify_signature(public_key, msg, &sig_a.0).is_ok());
        assert_eq!(
            verify_signature(public_key, b"wrong", &sig_a.0),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_recover_secret() {
        let dealer = deal(3);
        let shares: Vec<(u32, Scalar)> = [4, 0, 2].iter().map(|i| (*i, share(&dealer, *i))).collect();
        assert_eq!(recover_secret(&shares).unwrap(), dealer.secret);
    }

    #[test]
    fn test_add_commitments() {
        let a = deal(2);
        let b = deal(2);
        let sum = add_commitments(&a.commitments, &b.commitments).unwrap();
        let expected = compress_g2(&(G2Projective::generator() * (a.secret + b.secret)).to_affine());
        assert_eq!(sum[0], expected);
    }

    #[test]
    fn test_insufficient_shares_fails() {
        let shares = vec![(1u32, G1Point::default())];
        let result = recover_signature(&shares, 2);
        assert!(matches!(result, Err(CryptoError::InsufficientShares { .. })));
    }

    #[test]
    fn test_duplicate_indices_fails() {
        let shares = vec![(1u32, G1Point::default()), (1u32, G1Point::default())];
        let result = recover_signature(&shares, 2);
        assert!(matches!(result, Err(CryptoError::DuplicateShareIndex)));
    }
}
