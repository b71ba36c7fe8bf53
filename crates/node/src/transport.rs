//! Peer plane transport.
//!
//! [`PeerService`] is what a daemon serves to other nodes; [`PeerClient`] is
//! how a node reaches one of them by address. The RPC daemon provides a
//! network client, and [`LocalNetwork`] wires daemons together in-process.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use thiserror::Error;

use beacon_types::{BeaconEntry, Metadata, PartialBeacon};

use crate::error::BeaconResult;
use crate::messages::{DkgInvitation, DkgPacketMessage, Identity, SyncRequest};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Peer {peer} rejected the request: {message}")]
    Remote { peer: String, message: String },
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Peer plane operations served by a node.
#[async_trait]
pub trait PeerService: Send + Sync {
    async fn dkg_invite(&self, invitation: DkgInvitation) -> BeaconResult<()>;

    async fn dkg_packet(&self, message: DkgPacketMessage) -> BeaconResult<()>;

    async fn partial_beacon(&self, metadata: Metadata, partial: PartialBeacon) -> BeaconResult<()>;

    async fn sync_chain(&self, request: SyncRequest) -> BeaconResult<Vec<BeaconEntry>>;

    async fn identity(&self, metadata: Metadata) -> BeaconResult<Identity>;
}

/// Client side of the peer plane.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn dkg_invite(&self, peer: &str, invitation: DkgInvitation) -> TransportResult<()>;

    async fn dkg_packet(&self, peer: &str, message: DkgPacketMessage) -> TransportResult<()>;

    async fn partial_beacon(
        &self,
        peer: &str,
        metadata: Metadata,
        partial: PartialBeacon,
    ) -> TransportResult<()>;

    async fn sync_chain(&self, peer: &str, request: SyncRequest) -> TransportResult<Vec<BeaconEntry>>;

    async fn identity(&self, peer: &str, metadata: Metadata) -> TransportResult<Identity>;
}

/// In-process network of daemons, addressed by their private address.
#[derive(Default)]
pub struct LocalNetwork {
    services: RwLock<HashMap<String, Weak<dyn PeerService>>>,
    offline: RwLock<HashSet<String>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, address: &str, service: &Arc<dyn PeerService>) {
        self.services
            .write()
            .insert(address.to_string(), Arc::downgrade(service));
    }

    /// Cut a node off the network in both directions.
    pub fn set_offline(&self, address: &str, offline: bool) {
        let mut set = self.offline.write();
        if offline {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    pub fn is_offline(&self, address: &str) -> bool {
        self.offline.read().contains(address)
    }

    /// Client sending from `address`.
    pub fn client(self: &Arc<Self>, address: &str) -> Arc<dyn PeerClient> {
        Arc::new(LocalClient {
            network: self.clone(),
            from: address.to_string(),
        })
    }

    fn route(&self, from: &str, to: &str) -> TransportResult<Arc<dyn PeerService>> {
        if self.is_offline(from) || self.is_offline(to) {
            return Err(TransportError::Unreachable(to.to_string()));
        }
        self.services
            .read()
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(to.to_string()))
    }
}

struct LocalClient {
    network: Arc<LocalNetwork>,
    from: String,
}

fn remote(peer: &str) -> impl FnOnce(crate::error::BeaconError) -> TransportError + '_ {
    move |e| TransportError::Remote {
        peer: peer.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl PeerClient for LocalClient {
    async fn dkg_invite(&self, peer: &str, invitation: DkgInvitation) -> TransportResult<()> {
        let service = self.network.route(&self.from, peer)?;
        service.dkg_invite(invitation).await.map_err(remote(peer))
    }

    async fn dkg_packet(&self, peer: &str, message: DkgPacketMessage) -> TransportResult<()> {
        let service = self.network.route(&self.from, peer)?;
        service.dkg_packet(message).await.map_err(remote(peer))
    }

    async fn partial_beacon(
        &self,
        peer: &str,
        metadata: Metadata,
        partial: PartialBeacon,
    ) -> TransportResult<()> {
        let service = self.network.route(&self.from, peer)?;
        service
            .partial_beacon(metadata, partial)
            .await
            .map_err(remote(peer))
    }

    async fn sync_chain(&self, peer: &str, request: SyncRequest) -> TransportResult<Vec<BeaconEntry>> {
        let service = self.network.route(&self.from, peer)?;
        service.sync_chain(request).await.map_err(remote(peer))
    }

    async fn identity(&self, peer: &str, metadata: Metadata) -> TransportResult<Identity> {
        let service = self.network.route(&self.from, peer)?;
        service.identity(metadata).await.map_err(remote(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BeaconError;
    use beacon_types::G1Point;

    struct Echo;

    #[async_trait]
    impl PeerService for Echo {
        async fn dkg_invite(&self, _: DkgInvitation) -> BeaconResult<()> {
            Ok(())
        }

        async fn dkg_packet(&self, _: DkgPacketMessage) -> BeaconResult<()> {
            Ok(())
        }

        async fn partial_beacon(&self, _: Metadata, _: PartialBeacon) -> BeaconResult<()> {
            Err(BeaconError::BeaconNotRunning("default".into()))
        }

        async fn sync_chain(&self, _: SyncRequest) -> BeaconResult<Vec<BeaconEntry>> {
            Ok(vec![])
        }

        async fn identity(&self, _: Metadata) -> BeaconResult<Identity> {
            Ok(Identity {
                address: "b".into(),
                public_key: G1Point::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_local_routing() {
        let network = LocalNetwork::new();
        let service: Arc<dyn PeerService> = Arc::new(Echo);
        network.register("b", &service);
        let client = network.client("a");

        let identity = client.identity("b", Metadata::default()).await.unwrap();
        assert_eq!(identity.address, "b");

        assert_eq!(
            client.identity("c", Metadata::default()).await,
            Err(TransportError::Unreachable("c".into()))
        );

        let err = client
            .partial_beacon("b", Metadata::default(), test_partial())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Remote { .. }));

        network.set_offline("a", true);
        assert!(client.identity("b", Metadata::default()).await.is_err());
        network.set_offline("a", false);
        assert!(client.identity("b", Metadata::default()).await.is_ok());

        drop(service);
        assert!(client.identity("b", Metadata::default()).await.is_err());
    }

    fn test_partial() -> PartialBeacon {
        PartialBeacon {
            round: 1,
            previous_signature: vec![],
            index: 0,
            partial_signature: Default::default(),
        }
    }
}
