//! Peer plane client over JSON-RPC.

use async_trait::async_trait;
use jsonrpsee::core::ClientError;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use beacon_node::{
    DkgInvitation, DkgPacketMessage, Identity, PeerClient, SyncRequest, TransportError,
    TransportResult,
};
use beacon_types::{BeaconEntry, Metadata, PartialBeacon};

use crate::rpc::PeerApiClient;

/// Reaches peers at `host:port` addresses, keeping one HTTP client per peer.
pub struct RpcPeerClient {
    timeout: Duration,
    clients: Mutex<HashMap<String, HttpClient>>,
}

impl RpcPeerClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, peer: &str) -> TransportResult<HttpClient> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(peer) {
            return Ok(client.clone());
        }
        let url = if peer.starts_with("http://") || peer.starts_with("https://") {
            peer.to_string()
        } else {
            format!("http://{}", peer)
        };
        let client = HttpClientBuilder::default()
            .request_timeout(self.timeout)
            .build(url)
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", peer, e)))?;
        clients.insert(peer.to_string(), client.clone());
        Ok(client)
    }
}

fn transport_error(peer: &str, error: ClientError) -> TransportError {
    match error {
        ClientError::Call(object) => TransportError::Remote {
            peer: peer.to_string(),
            message: object.message().to_string(),
        },
        ClientError::RequestTimeout => TransportError::Timeout(peer.to_string()),
        other => TransportError::Unreachable(format!("{}: {}", peer, other)),
    }
}

#[async_trait]
impl PeerClient for RpcPeerClient {
    async fn dkg_invite(&self, peer: &str, invitation: DkgInvitation) -> TransportResult<()> {
        self.client(peer)?
            .dkg_invite(invitation)
            .await
            .map_err(|e| transport_error(peer, e))
    }

    async fn dkg_packet(&self, peer: &str, message: DkgPacketMessage) -> TransportResult<()> {
        self.client(peer)?
            .dkg_packet(message)
            .await
            .map_err(|e| transport_error(peer, e))
    }

    async fn partial_beacon(
        &self,
        peer: &str,
        metadata: Metadata,
        partial: PartialBeacon,
    ) -> TransportResult<()> {
        self.client(peer)?
            .partial_beacon(metadata, partial)
            .await
            .map_err(|e| transport_error(peer, e))
    }

    async fn sync_chain(&self, peer: &str, request: SyncRequest) -> TransportResult<Vec<BeaconEntry>> {
        self.client(peer)?
            .sync_chain(request)
            .await
            .map_err(|e| transport_error(peer, e))
    }

    async fn identity(&self, peer: &str, metadata: Metadata) -> TransportResult<Identity> {
        self.client(peer)?
            .identity(metadata)
            .await
            .map_err(|e| transport_error(peer, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_cached_per_peer() {
        let client = RpcPeerClient::new(Duration::from_secs(1));
        client.client("127.0.0.1:4444").unwrap();
        client.client("http://127.0.0.1:4445").unwrap();
        client.client("127.0.0.1:4444").unwrap();
        assert_eq!(client.clients.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let client = RpcPeerClient::new(Duration::from_millis(200));
        // Nothing listens on port 1
        let result = client.identity("127.0.0.1:1", Metadata::default()).await;
        assert!(matches!(
            result,
            Err(TransportError::Unreachable(_)) | Err(TransportError::Timeout(_))
        ));
    }

    #[test]
    fn test_remote_error_mapping() {
        let error = ClientError::Call(crate::rpc::rpc_error("Beacon fast is not running"));
        assert_eq!(
            transport_error("a", error),
            TransportError::Remote {
                peer: "a".into(),
                message: "Beacon fast is not running".into()
            }
        );
    }
}
