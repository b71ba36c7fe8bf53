//! Sealing DKG shares to a recipient's identity key.
//!
//! # Encryption
//!
//! To seal `m` for a recipient with identity key PK = sk·G1:
//! 1. Sample random scalar r and compute R = r·G1
//! 2. Compute the shared point S = r·PK
//! 3. Derive a symmetric key with HKDF-SHA256(S, salt = R, info = context)
//! 4. Encrypt m with AES-256-GCM
//!
//! # Decryption
//!
//! The recipient recomputes S = sk·R and derives the same key.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use bls12_381::{G1Projective, Scalar};
use borsh::{BorshDeserialize, BorshSerialize};
use group::Curve;
use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use beacon_types::G1Point;

use crate::curve::{compress_g1, decompress_g1, random_scalar};
use crate::error::CryptoError;

/// A sealed payload.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Ciphertext {
    /// Ephemeral public key R
    pub ephemeral: G1Point,
    pub nonce: [u8; 12],
    /// AES-GCM output including the 16-byte tag
    pub payload: Vec<u8>,
}

/// Seal `plaintext` for `recipient`, binding it to `context`.
pub fn seal<R: RngCore + CryptoRng>(
    recipient: &G1Point,
    plaintext: &[u8],
    context: &[u8],
    rng: &mut R,
) -> Result<Ciphertext, CryptoError> {
    let pk = decompress_g1(recipient)?;
    let r = random_scalar(rng);
    let ephemeral = compress_g1(&(G1Projective::generator() * r).to_affine());
    let shared = compress_g1(&(G1Projective::from(pk) * r).to_affine());

    let key = derive_key(&shared, &ephemeral, context)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CryptoError::EncryptionFailed(format!("Failed to create cipher: {}", e)))?;

    let mut nonce = [0u8; 12];
    rng.fill_bytes(&mut nonce);
    let payload = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("AES-GCM encryption failed: {}", e)))?;

    Ok(Ciphertext {
        ephemeral,
        nonce,
        payload,
    })
}

/// Open a ciphertext with the recipient's identity secret.
pub fn open(secret: &Scalar, ciphertext: &Ciphertext, context: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = decompress_g1(&ciphertext.ephemeral)?;
    let shared = compress_g1(&(G1Projective::from(ephemeral) * secret).to_affine());

    let key = derive_key(&shared, &ciphertext.ephemeral, context)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::KeyDerivationFailed)?;

    cipher
        .decrypt(Nonce::from_slice(&ciphertext.nonce), ciphertext.payload.as_ref())
        .map_err(|_| CryptoError::AuthenticationFailed)
}

fn derive_key(shared: &G1Point, ephemeral: &G1Point, context: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(&ephemeral.0), &shared.0);
    let mut key = [0u8; 32];
    hk.expand(context, &mut key)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> (Scalar, G1Point) {
        let sk = random_scalar(&mut OsRng);
        let pk = compress_g1(&(G1Projective::generator() * sk).to_affine());
        (sk, pk)
    }

    #[test]
    fn test_seal_open() {
        let (sk, pk) = keypair();
        let sealed = seal(&pk, b"share bytes", b"dkg:1:0", &mut OsRng).unwrap();
        assert_eq!(open(&sk, &sealed, b"dkg:1:0").unwrap(), b"share bytes");
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let (_, pk) = keypair();
        let (other_sk, _) = keypair();
        let sealed = seal(&pk, b"share bytes", b"ctx", &mut OsRng).unwrap();
        assert_eq!(open(&other_sk, &sealed, b"ctx"), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_context_is_bound() {
        let (sk, pk) = keypair();
        let sealed = seal(&pk, b"share bytes", b"session-a", &mut OsRng).unwrap();
        assert!(open(&sk, &sealed, b"session-b").is_err());
    }

    #[test]
    fn test_tampered_payload_fails() {
        let (sk, pk) = keypair();
        let mut sealed = seal(&pk, b"share bytes", b"ctx", &mut OsRng).unwrap();
        sealed.payload[0] ^= 1;
        assert!(open(&sk, &sealed, b"ctx").is_err());
    }
}
