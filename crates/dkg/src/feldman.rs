//! Feldman Verifiable Secret Sharing.
//!
//! Extends Shamir's secret sharing with commitments that allow
//! verification of shares without revealing the secret. Shares are
//! evaluated at `index + 1`.

use bls12_381::{G2Affine, G2Projective, Scalar};
use ff::Field;
use group::Curve;
use rand::{CryptoRng, RngCore};

use beacon_crypto::{compress_g2, decompress_g2, eval_point, public_share, random_scalar, CryptoError};
use beacon_types::G2Point;

/// Generate a random polynomial with `degree` coefficients and given constant term.
///
/// Returns coefficients [a_0, a_1, ..., a_{t-1}] where:
/// - a_0 is the secret (constant term)
/// - f(x) = a_0 + a_1*x + a_2*x^2 + ... + a_{t-1}*x^{t-1}
pub fn generate_polynomial<R: RngCore + CryptoRng>(
    secret: &Scalar,
    degree: usize,
    rng: &mut R,
) -> Vec<Scalar> {
    let mut coefficients = Vec::with_capacity(degree);
    coefficients.push(*secret);
    for _ in 1..degree {
        coefficients.push(random_scalar(rng));
    }
    coefficients
}

/// Evaluate polynomial at a point using Horner's method.
pub fn evaluate_polynomial(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    let mut result = Scalar::ZERO;
    for coeff in coefficients.iter().rev() {
        result = result * x + coeff;
    }
    result
}

/// Share of the holder at `index`.
pub fn share_for(coefficients: &[Scalar], index: u32) -> Scalar {
    evaluate_polynomial(coefficients, &eval_point(index))
}

/// Generate Feldman commitments for polynomial coefficients.
///
/// C_i = g2^{a_i} for each coefficient a_i
pub fn generate_commitments(coefficients: &[Scalar]) -> Vec<G2Point> {
    coefficients
        .iter()
        .map(|coeff| compress_g2(&(G2Projective::generator() * coeff).to_affine()))
        .collect()
}

/// Verify a share against Feldman commitments.
///
/// Checks that g2^{share} = Π C_i^{x^i} with x = index + 1.
pub fn verify_share(share: &Scalar, index: u32, commitments: &[G2Point]) -> bool {
    let lhs = (G2Projective::generator() * share).to_affine();
    match public_share(commitments, index) {
        Ok(rhs) => lhs == rhs,
        Err(_) => false,
    }
}

/// Weighted sum of several public polynomials: Σ w_j · C_j.
pub fn combine_commitments(
    polys: &[(&[G2Point], Scalar)],
    degree: usize,
) -> Result<Vec<G2Point>, CryptoError> {
    let mut combined = vec![G2Projective::identity(); degree];
    for (commits, weight) in polys {
        for (acc, commit) in combined.iter_mut().zip(commits.iter()) {
            let point: G2Affine = decompress_g2(commit)?;
            *acc += G2Projective::from(point) * weight;
        }
    }
    Ok(combined.iter().map(|p| compress_g2(&p.to_affine())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_crypto::recover_secret;
    use rand::rngs::OsRng;

    #[test]
    fn test_polynomial_evaluation() {
        // f(x) = 5 + 3x + 2x^2
        let coeffs = vec![Scalar::from(5u64), Scalar::from(3u64), Scalar::from(2u64)];

        assert_eq!(evaluate_polynomial(&coeffs, &Scalar::ZERO), Scalar::from(5u64));
        assert_eq!(evaluate_polynomial(&coeffs, &Scalar::ONE), Scalar::from(10u64));
        assert_eq!(
            evaluate_polynomial(&coeffs, &Scalar::from(2u64)),
            Scalar::from(19u64)
        );
        // Index 0 is evaluated at x = 1
        assert_eq!(share_for(&coeffs, 0), Scalar::from(10u64));
    }

    #[test]
    fn test_share_verification() {
        let mut rng = OsRng;
        let secret = random_scalar(&mut rng);
        let coeffs = generate_polynomial(&secret, 3, &mut rng);
        let commitments = generate_commitments(&coeffs);

        for i in 0..5 {
            assert!(verify_share(&share_for(&coeffs, i), i, &commitments));
        }
        assert!(!verify_share(&share_for(&coeffs, 1), 2, &commitments));
        assert!(!verify_share(&secret, 0, &[]));
    }

    #[test]
    fn test_share_reconstruction() {
        let mut rng = OsRng;
        let secret = random_scalar(&mut rng);
        let coeffs = generate_polynomial(&secret, 3, &mut rng);

        let shares: Vec<(u32, Scalar)> = (0..5).map(|i| (i, share_for(&coeffs, i))).collect();

        assert_eq!(recover_secret(&shares[..3]).unwrap(), secret);
        assert_eq!(recover_secret(&shares[2..5]).unwrap(), secret);
        assert_ne!(recover_secret(&shares[..2]).unwrap(), secret);
    }

    #[test]
    fn test_combine_commitments_matches_combined_polynomial() {
        let mut rng = OsRng;
        let a = generate_polynomial(&random_scalar(&mut rng), 2, &mut rng);
        let b = generate_polynomial(&random_scalar(&mut rng), 2, &mut rng);
        let (wa, wb) = (Scalar::from(3u64), Scalar::from(7u64));

        let combined_coeffs: Vec<Scalar> = a.iter().zip(&b).map(|(x, y)| x * wa + y * wb).collect();
        let ca = generate_commitments(&a);
        let cb = generate_commitments(&b);
        let combined = combine_commitments(&[(ca.as_slice(), wa), (cb.as_slice(), wb)], 2).unwrap();

        assert_eq!(combined, generate_commitments(&combined_coeffs));
    }
}
