//! Verified access to a chain.

use thiserror::Error;
use tracing::debug;

use beacon_chain::{ChainVerifier, VerifyError};
use beacon_types::{current_round, time_of_round, ChainHash, ChainInfo, PublicRandResponse};

use crate::source::BeaconSource;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Chain hash mismatch: expected {expected}, got {got}")]
    ChainHashMismatch { expected: ChainHash, got: ChainHash },

    #[error("Chain information does not hash to the advertised {0}")]
    InconsistentChainInfo(ChainHash),

    #[error("Requested round {requested}, got {got}")]
    UnexpectedRound { requested: u64, got: u64 },

    #[error(transparent)]
    Verify(#[from] VerifyError),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client pinned to one chain.
pub struct BeaconClient<S> {
    source: S,
    info: ChainInfo,
    hash: ChainHash,
    verifier: ChainVerifier,
}

impl<S: BeaconSource> BeaconClient<S> {
    /// Fetch the chain information from `source`.
    ///
    /// With `expected` set, the chain must hash to it; otherwise the first
    /// information seen is trusted.
    pub async fn connect(source: S, expected: Option<ChainHash>) -> ClientResult<Self> {
        let (info, advertised) = source.chain_info().await?;
        let hash = info.hash();
        if hash != advertised {
            return Err(ClientError::InconsistentChainInfo(advertised));
        }
        if let Some(expected) = expected {
            if expected != hash {
                return Err(ClientError::ChainHashMismatch {
                    expected,
                    got: hash,
                });
            }
        }
        debug!(chain_hash = %hash, beacon_id = %info.beacon_id, "Connected to chain");
        let verifier = ChainVerifier::from_info(&info);
        Ok(Self {
            source,
            info,
            hash,
            verifier,
        })
    }

    pub fn info(&self) -> &ChainInfo {
        &self.info
    }

    pub fn chain_hash(&self) -> ChainHash {
        self.hash
    }

    /// Verified entry at `round`, or the latest one when `round` is 0.
    pub async fn get(&self, round: u64) -> ClientResult<PublicRandResponse> {
        let requested = (round > 0).then_some(round);
        let response = self.source.randomness(requested).await?;
        if let Some(requested) = requested {
            if response.round != requested {
                return Err(ClientError::UnexpectedRound {
                    requested,
                    got: response.round,
                });
            }
        }
        self.verifier.verify_response(&response)?;
        Ok(response)
    }

    /// Round expected to be the latest at unix time `now`.
    pub fn round_at(&self, now: u64) -> u64 {
        current_round(now, self.info.period, self.info.genesis_time)
    }

    /// Unix time at which `round` is produced.
    pub fn round_time(&self, round: u64) -> u64 {
        time_of_round(self.info.period, self.info.genesis_time, round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beacon_crypto::{compress_g2, random_scalar, sign_partial};
    use beacon_types::{BeaconEntry, DEFAULT_SCHEME_ID};
    use bls12_381::{G2Projective, Scalar};
    use group::Curve;
    use rand::rngs::OsRng;

    struct StaticSource {
        info: ChainInfo,
        advertised: ChainHash,
        entries: Vec<BeaconEntry>,
        tamper: bool,
    }

    #[async_trait]
    impl BeaconSource for StaticSource {
        async fn chain_info(&self) -> ClientResult<(ChainInfo, ChainHash)> {
            Ok((self.info.clone(), self.advertised))
        }

        async fn randomness(&self, round: Option<u64>) -> ClientResult<PublicRandResponse> {
            let entry = match round {
                Some(r) => self.entries.get(r as usize),
                None => self.entries.last(),
            }
            .ok_or_else(|| ClientError::Rpc("no such round".into()))?;
            let mut response = entry.to_response();
            if self.tamper {
                response.randomness[0] ^= 1;
            }
            Ok(response)
        }
    }

    fn source(rounds: u64) -> StaticSource {
        let secret: Scalar = random_scalar(&mut OsRng);
        let info = ChainInfo {
            public_key: compress_g2(&(G2Projective::generator() * secret).to_affine()),
            period: 3,
            genesis_time: 1_000,
            genesis_seed: [9u8; 32],
            scheme_id: DEFAULT_SCHEME_ID.to_string(),
            beacon_id: "default".to_string(),
        };
        let mut entries = vec![BeaconEntry::genesis(info.genesis_seed)];
        for round in 1..=rounds {
            let previous_signature = entries[round as usize - 1].signature.clone();
            let mut entry = BeaconEntry {
                round,
                previous_signature,
                signature: Vec::new(),
            };
            entry.signature = sign_partial(&secret, &entry.message()).0.to_vec();
            entries.push(entry);
        }
        StaticSource {
            advertised: info.hash(),
            info,
            entries,
            tamper: false,
        }
    }

    #[tokio::test]
    async fn test_get_verifies_entries() {
        let client = BeaconClient::connect(source(4), None).await.unwrap();
        let latest = client.get(0).await.unwrap();
        assert_eq!(latest.round, 4);
        let second = client.get(2).await.unwrap();
        assert_eq!(second.round, 2);
        assert_eq!(client.round_at(1_007), 2);
        assert_eq!(client.round_time(2), 1_006);
    }

    #[tokio::test]
    async fn test_pinned_hash() {
        let src = source(1);
        let hash = src.info.hash();
        assert!(BeaconClient::connect(src, Some(hash)).await.is_ok());

        let err = BeaconClient::connect(source(1), Some(ChainHash([1u8; 32])))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::ChainHashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_inconsistent_chain_info() {
        let mut src = source(1);
        src.advertised = ChainHash([2u8; 32]);
        assert!(matches!(
            BeaconClient::connect(src, None).await,
            Err(ClientError::InconsistentChainInfo(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_randomness_rejected() {
        let mut src = source(2);
        src.tamper = true;
        let client = BeaconClient::connect(src, None).await.unwrap();
        assert!(matches!(
            client.get(1).await,
            Err(ClientError::Verify(VerifyError::InvalidRandomness(1)))
        ));
    }

    #[tokio::test]
    async fn test_foreign_signature_rejected() {
        let good = source(2);
        let mut other = source(2);
        // Entries signed under a different key
        other.info = good.info.clone();
        other.advertised = good.advertised;
        let client = BeaconClient::connect(other, None).await.unwrap();
        assert!(matches!(
            client.get(2).await,
            Err(ClientError::Verify(VerifyError::InvalidSignature(2)))
        ));
    }
}
