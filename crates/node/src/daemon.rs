//! Multi-beacon daemon.
//!
//! The daemon hosts one [`BeaconProcess`] per beacon id and exposes three
//! planes over them:
//! - control: operator requests (DKG, reshare, status, shutdown)
//! - peer: traffic between nodes of a group (see [`PeerService`])
//! - public: randomness and chain information for clients

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use beacon_types::{
    canonical_beacon_id, BeaconEntry, Group, Metadata, NodeVersion, PartialBeacon, PublicRandResponse,
};

use crate::config::NodeConfig;
use crate::error::{BeaconError, BeaconResult};
use crate::key_store::KeyStore;
use crate::messages::{
    ChainInfoResponse, DkgInvitation, DkgPacketMessage, Identity, InitDkgFollowerRequest,
    InitDkgLeaderRequest, InitReshareLeaderRequest, StatusResponse, SyncRequest,
};
use crate::process::BeaconProcess;
use crate::router::BeaconRegistry;
use crate::transport::{PeerClient, PeerService};

pub struct Daemon {
    config: NodeConfig,
    key_store: Arc<dyn KeyStore>,
    client: Arc<dyn PeerClient>,
    registry: Arc<BeaconRegistry<BeaconProcess>>,
    version: NodeVersion,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    pub fn new(config: NodeConfig, key_store: Arc<dyn KeyStore>, client: Arc<dyn PeerClient>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            key_store,
            client,
            registry: Arc::new(BeaconRegistry::new()),
            version: NodeVersion::current(),
            shutdown,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn address(&self) -> &str {
        &self.config.private_listen
    }

    /// Resolves once every beacon has been shut down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Load every beacon found in the key store and start the keyed ones.
    pub fn load_beacons(&self) -> BeaconResult<Vec<String>> {
        let ids = self.key_store.beacon_ids()?;
        for beacon_id in &ids {
            let process = self.load_beacon(beacon_id)?;
            match process.start(true) {
                Ok(()) => info!(beacon_id = %beacon_id, "Beacon started"),
                Err(BeaconError::NotKeyed(_)) | Err(BeaconError::NotInGroup(_)) => {
                    debug!(beacon_id = %beacon_id, "Beacon waiting for a DKG");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ids)
    }

    /// Register the process of `beacon_id`, loading it if needed.
    pub fn load_beacon(&self, beacon_id: &str) -> BeaconResult<Arc<BeaconProcess>> {
        if let Some(process) = self.registry.get(beacon_id) {
            return Ok(process);
        }
        let process = BeaconProcess::load(
            beacon_id,
            self.config.clone(),
            self.key_store.clone(),
            self.client.clone(),
            Arc::downgrade(&self.registry),
        )?;
        self.registry.add_process(process.beacon_id(), process.clone());
        if let Some(chain_hash) = process.group().and_then(|g| g.chain_hash()) {
            self.registry.add_chain_hash(&chain_hash, process.beacon_id());
        }
        Ok(process)
    }

    pub fn beacon(&self, beacon_id: &str) -> BeaconResult<Arc<BeaconProcess>> {
        self.registry
            .get(beacon_id)
            .ok_or_else(|| BeaconError::BeaconNotRunning(canonical_beacon_id(beacon_id).to_string()))
    }

    fn resolve(&self, metadata: &mut Metadata) -> BeaconResult<Arc<BeaconProcess>> {
        if let Some(version) = &metadata.node_version {
            if !version.is_compatible_with(&self.version) {
                warn!(peer_version = ?version, "Request from incompatible node version");
            }
        }
        self.registry.resolve(metadata)
    }

    // =========================
    // CONTROL PLANE
    // =========================

    pub fn ping(&self) {}

    pub fn list_beacon_ids(&self) -> Vec<String> {
        self.registry.beacon_ids()
    }

    pub async fn init_dkg_leader(&self, request: InitDkgLeaderRequest) -> BeaconResult<Group> {
        let process = self.load_beacon(&request.beacon_id)?;
        process.init_dkg_leader(request).await
    }

    pub async fn init_dkg_follower(&self, request: InitDkgFollowerRequest) -> BeaconResult<Group> {
        let process = self.load_beacon(&request.beacon_id)?;
        process.init_dkg_follower(request).await
    }

    pub async fn init_reshare_leader(&self, request: InitReshareLeaderRequest) -> BeaconResult<Group> {
        let process = self.beacon(&request.beacon_id)?;
        process.init_reshare_leader(request).await
    }

    /// Join or take part in a resharing as a follower.
    pub async fn init_reshare_follower(&self, request: InitDkgFollowerRequest) -> BeaconResult<Group> {
        let process = self.load_beacon(&request.beacon_id)?;
        if process.group().is_none() && request.old_group.is_none() {
            return Err(BeaconError::InvalidRequest(
                "joining nodes must provide the current group".into(),
            ));
        }
        process.init_dkg_follower(request).await
    }

    pub fn abort_dkg(&self, beacon_id: &str) -> BeaconResult<()> {
        self.beacon(beacon_id)?.abort_dkg();
        Ok(())
    }

    pub fn start_beacon(&self, beacon_id: &str, catchup: bool) -> BeaconResult<()> {
        self.load_beacon(beacon_id)?.start(catchup)
    }

    pub fn status(&self, beacon_id: &str) -> BeaconResult<StatusResponse> {
        Ok(self.beacon(beacon_id)?.status_report())
    }

    pub fn group_file(&self, beacon_id: &str) -> BeaconResult<Group> {
        self.beacon(beacon_id)?
            .group()
            .ok_or_else(|| BeaconError::NotKeyed(canonical_beacon_id(beacon_id).to_string()))
    }

    /// Stop one beacon, or every beacon and then the daemon.
    pub fn shutdown(&self, beacon_id: Option<&str>) -> BeaconResult<()> {
        match beacon_id {
            Some(beacon_id) => {
                let process = self
                    .registry
                    .remove(beacon_id)
                    .ok_or_else(|| BeaconError::BeaconNotRunning(beacon_id.to_string()))?;
                process.stop();
                info!(beacon_id = %process.beacon_id(), "Beacon shut down");
            }
            None => {
                for process in self.registry.processes() {
                    self.registry.remove(process.beacon_id());
                    process.stop();
                }
                info!("Daemon shutting down");
                self.shutdown.send_replace(true);
            }
        }
        Ok(())
    }

    // =========================
    // PUBLIC PLANE
    // =========================

    pub fn public_rand(&self, mut metadata: Metadata, round: Option<u64>) -> BeaconResult<PublicRandResponse> {
        self.resolve(&mut metadata)?.public_rand(round)
    }

    pub fn chain_info(&self, mut metadata: Metadata) -> BeaconResult<ChainInfoResponse> {
        Ok(self.resolve(&mut metadata)?.chain_info()?.into())
    }

    /// Stream of new entries of one chain.
    pub fn subscribe(&self, mut metadata: Metadata) -> BeaconResult<broadcast::Receiver<BeaconEntry>> {
        Ok(self.resolve(&mut metadata)?.subscribe())
    }
}

#[async_trait]
impl PeerService for Daemon {
    async fn dkg_invite(&self, mut invitation: DkgInvitation) -> BeaconResult<()> {
        let process = self.resolve(&mut invitation.metadata)?;
        process.on_invitation(invitation)
    }

    async fn dkg_packet(&self, mut message: DkgPacketMessage) -> BeaconResult<()> {
        let process = self.resolve(&mut message.metadata)?;
        process.process_dkg_packet(message.packet)
    }

    async fn partial_beacon(&self, mut metadata: Metadata, partial: PartialBeacon) -> BeaconResult<()> {
        let process = self.resolve(&mut metadata)?;
        process.process_partial(partial)
    }

    async fn sync_chain(&self, mut request: SyncRequest) -> BeaconResult<Vec<BeaconEntry>> {
        let process = self.resolve(&mut request.metadata)?;
        process.sync_range(request.from_round, request.limit)
    }

    async fn identity(&self, mut metadata: Metadata) -> BeaconResult<Identity> {
        let beacon_id = self.registry.read_beacon_id(&mut metadata)?;
        Ok(self.load_beacon(&beacon_id)?.identity())
    }
}
