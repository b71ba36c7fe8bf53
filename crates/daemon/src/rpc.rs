//! JSON-RPC planes served by the daemon.

use jsonrpsee::core::{async_trait, SubscriptionResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use jsonrpsee::{PendingSubscriptionSink, SubscriptionMessage};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use beacon_node::{
    ChainInfoResponse, Daemon, DkgInvitation, DkgPacketMessage, Identity, InitDkgFollowerRequest,
    InitDkgLeaderRequest, InitReshareLeaderRequest, PeerService, StatusResponse, SyncRequest,
};
use beacon_types::{BeaconEntry, Group, Metadata, PartialBeacon, PublicRandResponse};

/// Operator requests, served on the control address only.
#[rpc(server, client, namespace = "control")]
pub trait ControlApi {
    #[method(name = "ping")]
    async fn ping(&self) -> Result<(), ErrorObjectOwned>;

    #[method(name = "listBeaconIds")]
    async fn list_beacon_ids(&self) -> Result<Vec<String>, ErrorObjectOwned>;

    /// Identity of this node for a beacon, creating its key pair if needed.
    #[method(name = "identity")]
    async fn identity(&self, beacon_id: String) -> Result<Identity, ErrorObjectOwned>;

    #[method(name = "initDkgLeader")]
    async fn init_dkg_leader(&self, request: InitDkgLeaderRequest) -> Result<Group, ErrorObjectOwned>;

    #[method(name = "initDkgFollower")]
    async fn init_dkg_follower(&self, request: InitDkgFollowerRequest) -> Result<Group, ErrorObjectOwned>;

    #[method(name = "initReshareLeader")]
    async fn init_reshare_leader(
        &self,
        request: InitReshareLeaderRequest,
    ) -> Result<Group, ErrorObjectOwned>;

    #[method(name = "initReshareFollower")]
    async fn init_reshare_follower(
        &self,
        request: InitDkgFollowerRequest,
    ) -> Result<Group, ErrorObjectOwned>;

    #[method(name = "abortDkg")]
    async fn abort_dkg(&self, beacon_id: String) -> Result<(), ErrorObjectOwned>;

    /// Register a beacon from the data folder without starting it.
    #[method(name = "loadBeacon")]
    async fn load_beacon(&self, beacon_id: String) -> Result<StatusResponse, ErrorObjectOwned>;

    #[method(name = "startBeacon")]
    async fn start_beacon(&self, beacon_id: String, catchup: bool) -> Result<(), ErrorObjectOwned>;

    #[method(name = "status")]
    async fn status(&self, beacon_id: String) -> Result<StatusResponse, ErrorObjectOwned>;

    #[method(name = "groupFile")]
    async fn group_file(&self, beacon_id: String) -> Result<Group, ErrorObjectOwned>;

    #[method(name = "chainInfo")]
    async fn chain_info(&self, beacon_id: String) -> Result<ChainInfoResponse, ErrorObjectOwned>;

    /// Stop one beacon, or the whole daemon when no id is given.
    #[method(name = "shutdown")]
    async fn shutdown(&self, beacon_id: Option<String>) -> Result<(), ErrorObjectOwned>;
}

/// Traffic between the nodes of a group.
#[rpc(server, client, namespace = "peer")]
pub trait PeerApi {
    #[method(name = "dkgInvite")]
    async fn dkg_invite(&self, invitation: DkgInvitation) -> Result<(), ErrorObjectOwned>;

    #[method(name = "dkgPacket")]
    async fn dkg_packet(&self, message: DkgPacketMessage) -> Result<(), ErrorObjectOwned>;

    #[method(name = "partialBeacon")]
    async fn partial_beacon(
        &self,
        metadata: Metadata,
        partial: PartialBeacon,
    ) -> Result<(), ErrorObjectOwned>;

    #[method(name = "syncChain")]
    async fn sync_chain(&self, request: SyncRequest) -> Result<Vec<BeaconEntry>, ErrorObjectOwned>;

    #[method(name = "identity")]
    async fn identity(&self, metadata: Metadata) -> Result<Identity, ErrorObjectOwned>;
}

/// Randomness for clients.
#[rpc(server, namespace = "public")]
pub trait PublicApi {
    /// Entry at `round`; the latest one when the round is absent or 0.
    #[method(name = "randomness")]
    async fn randomness(
        &self,
        metadata: Metadata,
        round: Option<u64>,
    ) -> Result<PublicRandResponse, ErrorObjectOwned>;

    #[method(name = "chainInfo")]
    async fn chain_info(&self, metadata: Metadata) -> Result<ChainInfoResponse, ErrorObjectOwned>;

    #[subscription(name = "subscribe" => "entry", unsubscribe = "unsubscribe", item = PublicRandResponse)]
    async fn subscribe(&self, metadata: Metadata) -> SubscriptionResult;
}

pub fn rpc_error(e: impl Display) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(-32000, e.to_string(), None::<()>)
}

/// Serves every plane from one daemon.
#[derive(Clone)]
pub struct DaemonRpc {
    daemon: Arc<Daemon>,
}

impl DaemonRpc {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        Self { daemon }
    }
}

#[async_trait]
impl ControlApiServer for DaemonRpc {
    async fn ping(&self) -> Result<(), ErrorObjectOwned> {
        self.daemon.ping();
        Ok(())
    }

    async fn list_beacon_ids(&self) -> Result<Vec<String>, ErrorObjectOwned> {
        Ok(self.daemon.list_beacon_ids())
    }

    async fn identity(&self, beacon_id: String) -> Result<Identity, ErrorObjectOwned> {
        PeerService::identity(&*self.daemon, Metadata::for_beacon(&beacon_id))
            .await
            .map_err(rpc_error)
    }

    async fn init_dkg_leader(&self, request: InitDkgLeaderRequest) -> Result<Group, ErrorObjectOwned> {
        self.daemon.init_dkg_leader(request).await.map_err(rpc_error)
    }

    async fn init_dkg_follower(&self, request: InitDkgFollowerRequest) -> Result<Group, ErrorObjectOwned> {
        self.daemon.init_dkg_follower(request).await.map_err(rpc_error)
    }

    async fn init_reshare_leader(
        &self,
        request: InitReshareLeaderRequest,
    ) -> Result<Group, ErrorObjectOwned> {
        self.daemon.init_reshare_leader(request).await.map_err(rpc_error)
    }

    async fn init_reshare_follower(
        &self,
        request: InitDkgFollowerRequest,
    ) -> Result<Group, ErrorObjectOwned> {
        self.daemon.init_reshare_follower(request).await.map_err(rpc_error)
    }

    async fn abort_dkg(&self, beacon_id: String) -> Result<(), ErrorObjectOwned> {
        self.daemon.abort_dkg(&beacon_id).map_err(rpc_error)
    }

    async fn load_beacon(&self, beacon_id: String) -> Result<StatusResponse, ErrorObjectOwned> {
        let process = self.daemon.load_beacon(&beacon_id).map_err(rpc_error)?;
        Ok(process.status_report())
    }

    async fn start_beacon(&self, beacon_id: String, catchup: bool) -> Result<(), ErrorObjectOwned> {
        self.daemon.start_beacon(&beacon_id, catchup).map_err(rpc_error)
    }

    async fn status(&self, beacon_id: String) -> Result<StatusResponse, ErrorObjectOwned> {
        self.daemon.status(&beacon_id).map_err(rpc_error)
    }

    async fn group_file(&self, beacon_id: String) -> Result<Group, ErrorObjectOwned> {
        self.daemon.group_file(&beacon_id).map_err(rpc_error)
    }

    async fn chain_info(&self, beacon_id: String) -> Result<ChainInfoResponse, ErrorObjectOwned> {
        self.daemon
            .chain_info(Metadata::for_beacon(&beacon_id))
            .map_err(rpc_error)
    }

    async fn shutdown(&self, beacon_id: Option<String>) -> Result<(), ErrorObjectOwned> {
        self.daemon.shutdown(beacon_id.as_deref()).map_err(rpc_error)
    }
}

#[async_trait]
impl PeerApiServer for DaemonRpc {
    async fn dkg_invite(&self, invitation: DkgInvitation) -> Result<(), ErrorObjectOwned> {
        self.daemon.dkg_invite(invitation).await.map_err(rpc_error)
    }

    async fn dkg_packet(&self, message: DkgPacketMessage) -> Result<(), ErrorObjectOwned> {
        self.daemon.dkg_packet(message).await.map_err(rpc_error)
    }

    async fn partial_beacon(
        &self,
        metadata: Metadata,
        partial: PartialBeacon,
    ) -> Result<(), ErrorObjectOwned> {
        self.daemon
            .partial_beacon(metadata, partial)
            .await
            .map_err(rpc_error)
    }

    async fn sync_chain(&self, request: SyncRequest) -> Result<Vec<BeaconEntry>, ErrorObjectOwned> {
        self.daemon.sync_chain(request).await.map_err(rpc_error)
    }

    async fn identity(&self, metadata: Metadata) -> Result<Identity, ErrorObjectOwned> {
        PeerService::identity(&*self.daemon, metadata)
            .await
            .map_err(rpc_error)
    }
}

#[async_trait]
impl PublicApiServer for DaemonRpc {
    async fn randomness(
        &self,
        metadata: Metadata,
        round: Option<u64>,
    ) -> Result<PublicRandResponse, ErrorObjectOwned> {
        self.daemon.public_rand(metadata, round).map_err(rpc_error)
    }

    async fn chain_info(&self, metadata: Metadata) -> Result<ChainInfoResponse, ErrorObjectOwned> {
        self.daemon.chain_info(metadata).map_err(rpc_error)
    }

    async fn subscribe(&self, pending: PendingSubscriptionSink, metadata: Metadata) -> SubscriptionResult {
        let mut entries = match self.daemon.subscribe(metadata) {
            Ok(entries) => entries,
            Err(e) => {
                pending.reject(rpc_error(e)).await;
                return Ok(());
            }
        };
        let sink = pending.accept().await?;

        loop {
            tokio::select! {
                _ = sink.closed() => break,
                next = entries.recv() => match next {
                    Ok(entry) => {
                        let message = SubscriptionMessage::from_json(&entry.to_response())?;
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Subscriber lagging, entries dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
}
