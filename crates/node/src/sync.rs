//! Chain synchronization from peers.

use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use beacon_chain::{ChainVerifier, Store, StoreError};
use beacon_types::{BeaconEntry, Metadata};

use crate::error::{BeaconError, BeaconResult};
use crate::messages::SyncRequest;
use crate::transport::{PeerClient, TransportError};

/// Fetches missing rounds from peers and appends the verified ones.
pub struct SyncManager {
    pub client: Arc<dyn PeerClient>,
    /// Peer addresses, self excluded
    pub peers: Vec<String>,
    pub metadata: Metadata,
    pub verifier: ChainVerifier,
    pub store: Arc<dyn Store>,
    pub max_attempts: usize,
    pub batch_size: usize,
    pub peer_timeout: Duration,
}

impl SyncManager {
    /// Sync the local chain up to `target`, trying peers in random order.
    ///
    /// Returns the last stored round. Fails with `SyncFailed` once
    /// `max_attempts` peers could not bring the chain to `target`.
    pub async fn sync_to(&self, target: u64) -> BeaconResult<u64> {
        let mut reached = self.store.last()?.round;
        if reached >= target {
            return Ok(reached);
        }

        let mut peers = self.peers.clone();
        peers.shuffle(&mut rand::thread_rng());

        for peer in peers.iter().take(self.max_attempts) {
            match self.sync_from(peer, target).await {
                Ok(round) => reached = round,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Sync attempt failed");
                    reached = self.store.last()?.round;
                }
            }
            if reached >= target {
                info!(round = reached, "Chain synced");
                return Ok(reached);
            }
        }

        Err(BeaconError::SyncFailed { target, reached })
    }

    /// Pull batches from one peer until `target` or until the peer runs dry.
    async fn sync_from(&self, peer: &str, target: u64) -> BeaconResult<u64> {
        let mut tip = self.store.last()?;
        while tip.round < target {
            let request = SyncRequest {
                metadata: self.metadata.clone(),
                from_round: tip.round + 1,
                limit: self.batch_size,
            };
            let batch = timeout(self.peer_timeout, self.client.sync_chain(peer, request))
                .await
                .map_err(|_| TransportError::Timeout(peer.to_string()))??;
            let Some(first) = batch.first() else {
                debug!(peer = %peer, round = tip.round, "Peer has no further rounds");
                break;
            };
            // Every batch must continue the local chain
            if first.round != tip.round + 1 {
                return Err(BeaconError::UnexpectedSyncBatch {
                    peer: peer.to_string(),
                    expected: tip.round + 1,
                    got: first.round,
                });
            }
            debug!(peer = %peer, from = tip.round + 1, count = batch.len(), "Received sync batch");

            for entry in batch.into_iter().take_while(|e| e.round <= target) {
                tip = self.append(&tip, entry)?;
            }
        }
        Ok(tip.round)
    }

    fn append(&self, tip: &BeaconEntry, entry: BeaconEntry) -> BeaconResult<BeaconEntry> {
        self.verifier.verify_next(tip, &entry)?;
        match self.store.put(entry.clone()) {
            Ok(()) => Ok(entry),
            // The generation loop got there first
            Err(StoreError::AlreadyStored(round)) => Ok(self.store.get(round)?),
            Err(e) => Err(e.into()),
        }
    }
}

/// Serve a contiguous range of the local chain.
pub fn serve_range(
    store: &dyn Store,
    from_round: u64,
    limit: usize,
    max_batch: usize,
) -> BeaconResult<Vec<BeaconEntry>> {
    Ok(store.range(from_round, limit.min(max_batch))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DkgInvitation, DkgPacketMessage, Identity};
    use crate::testing::fixture;
    use crate::transport::TransportResult;
    use async_trait::async_trait;
    use beacon_chain::MemStore;
    use beacon_types::PartialBeacon;
    use std::collections::HashMap;

    /// Peers serving fixed chains.
    struct Peers {
        chains: HashMap<String, Vec<BeaconEntry>>,
    }

    #[async_trait]
    impl PeerClient for Peers {
        async fn dkg_invite(&self, peer: &str, _: DkgInvitation) -> TransportResult<()> {
            Err(TransportError::Unreachable(peer.into()))
        }

        async fn dkg_packet(&self, peer: &str, _: DkgPacketMessage) -> TransportResult<()> {
            Err(TransportError::Unreachable(peer.into()))
        }

        async fn partial_beacon(&self, peer: &str, _: Metadata, _: PartialBeacon) -> TransportResult<()> {
            Err(TransportError::Unreachable(peer.into()))
        }

        async fn sync_chain(&self, peer: &str, request: SyncRequest) -> TransportResult<Vec<BeaconEntry>> {
            let chain = self
                .chains
                .get(peer)
                .ok_or_else(|| TransportError::Unreachable(peer.into()))?;
            Ok(chain
                .iter()
                .filter(|e| e.round >= request.from_round)
                .take(request.limit)
                .cloned()
                .collect())
        }

        async fn identity(&self, peer: &str, _: Metadata) -> TransportResult<Identity> {
            Err(TransportError::Unreachable(peer.into()))
        }
    }

    fn manager(
        chains: HashMap<String, Vec<BeaconEntry>>,
        local: &[BeaconEntry],
        verifier: ChainVerifier,
    ) -> SyncManager {
        let store = Arc::new(MemStore::new());
        for entry in local {
            store.put(entry.clone()).unwrap();
        }
        let mut peers: Vec<String> = chains.keys().cloned().collect();
        peers.push("offline".to_string());
        SyncManager {
            client: Arc::new(Peers { chains }),
            peers,
            metadata: Metadata::default(),
            verifier,
            store,
            max_attempts: 4,
            batch_size: 4,
            peer_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_sync_in_batches() {
        let fx = fixture(3, 2, 1_000, 3);
        let chain = fx.chain(15);
        let verifier = ChainVerifier::from_info(&fx.group.chain_info().unwrap());

        let chains = HashMap::from([("a".to_string(), chain.clone())]);
        let sync = manager(chains, &chain[..=10], verifier);

        assert_eq!(sync.sync_to(15).await.unwrap(), 15);
        assert_eq!(sync.store.last().unwrap(), chain[15]);
        // Already there
        assert_eq!(sync.sync_to(12).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_sync_skips_lagging_and_forged_peers() {
        let fx = fixture(3, 2, 1_000, 3);
        let chain = fx.chain(12);
        let verifier = ChainVerifier::from_info(&fx.group.chain_info().unwrap());

        let mut forged = chain.clone();
        forged[11].signature = chain[10].signature.clone();
        let chains = HashMap::from([
            ("lagging".to_string(), chain[..=8].to_vec()),
            ("forged".to_string(), forged),
            ("honest".to_string(), chain.clone()),
        ]);
        let sync = manager(chains, &chain[..=5], verifier);

        assert_eq!(sync.sync_to(12).await.unwrap(), 12);
        assert_eq!(sync.store.len(), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_moves_on_from_peer_skipping_rounds() {
        let fx = fixture(3, 2, 1_000, 3);
        let chain = fx.chain(12);
        let verifier = ChainVerifier::from_info(&fx.group.chain_info().unwrap());

        let chains = HashMap::from([
            ("skipping".to_string(), chain[12..].to_vec()),
            ("honest".to_string(), chain.clone()),
        ]);
        let sync = manager(chains, &chain[..=5], verifier);
        let skipping = sync.sync_from("skipping", 8).await;
        assert!(matches!(
            skipping,
            Err(BeaconError::UnexpectedSyncBatch { expected: 6, got: 12, .. })
        ));
        assert_eq!(sync.store.last().unwrap().round, 5);

        let synced = timeout(Duration::from_secs(5), sync.sync_to(8)).await.unwrap();
        assert_eq!(synced.unwrap(), 8);
        assert_eq!(sync.store.last().unwrap(), chain[8]);
    }

    #[tokio::test]
    async fn test_sync_gives_up() {
        let fx = fixture(3, 2, 1_000, 3);
        let chain = fx.chain(6);
        let verifier = ChainVerifier::from_info(&fx.group.chain_info().unwrap());

        let chains = HashMap::from([("lagging".to_string(), chain[..=4].to_vec())]);
        let sync = manager(chains, &chain[..=2], verifier);

        assert!(matches!(
            sync.sync_to(6).await,
            Err(BeaconError::SyncFailed { target: 6, reached: 4 })
        ));
    }

    #[test]
    fn test_serve_range_caps_batch() {
        let fx = fixture(3, 2, 1_000, 3);
        let store = MemStore::new();
        for entry in fx.chain(9) {
            store.put(entry).unwrap();
        }
        let served = serve_range(&store, 2, 100, 5).unwrap();
        assert_eq!(served.len(), 5);
        assert_eq!(served[0].round, 2);
        assert!(serve_range(&store, 20, 5, 5).unwrap().is_empty());
    }
}
