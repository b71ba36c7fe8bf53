//! End-to-end tests of beacon networks.
//!
//! Daemons run in-process, wired together by a [`LocalNetwork`], on a paused
//! tokio clock. These tests exercise:
//! 1. DKG with offline and missing participants
//! 2. Round production and subscriptions
//! 3. Catch-up of a node that fell behind
//! 4. Routing between several beacons of one daemon
//! 5. Resharing to a larger group

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use beacon_client::{BeaconSource, ClientError, ClientResult};
use beacon_node::{
    BeaconResult, Clock, Daemon, Identity, InitDkgFollowerRequest, InitDkgLeaderRequest,
    LocalNetwork, MemKeyStore, NodeConfig, PeerService,
};
use beacon_types::{ChainHash, ChainInfo, Group, Metadata, PublicRandResponse};

/// Unix time every cluster clock starts at.
pub const CLOCK_START: u64 = 1_700_000_000;

pub const DKG_TIMEOUT_SECS: u64 = 9;
pub const GENESIS_DELAY_SECS: u64 = 3;

/// Daemons sharing one in-process network and clock.
pub struct Cluster {
    pub network: Arc<LocalNetwork>,
    pub nodes: Vec<Arc<Daemon>>,
    clock: Clock,
}

impl Cluster {
    pub fn new(n: usize) -> Self {
        let mut cluster = Self {
            network: LocalNetwork::new(),
            nodes: Vec::new(),
            clock: Clock::starting_at(CLOCK_START),
        };
        for _ in 0..n {
            cluster.add_node();
        }
        cluster
    }

    pub fn add_node(&mut self) -> Arc<Daemon> {
        let address = format!("node-{}", self.nodes.len());
        let config = NodeConfig::new(&address).with_clock(self.clock.clone());
        let daemon = Daemon::new(config, MemKeyStore::new(), self.network.client(&address));
        let service: Arc<dyn PeerService> = daemon.clone();
        self.network.register(&address, &service);
        self.nodes.push(daemon.clone());
        daemon
    }

    pub fn set_offline(&self, node: usize, offline: bool) {
        self.network.set_offline(self.nodes[node].address(), offline);
    }

    pub async fn identities(&self, beacon_id: &str, members: &[usize]) -> Vec<Identity> {
        let mut identities = Vec::new();
        for &i in members {
            let identity = self.nodes[i]
                .identity(Metadata::for_beacon(beacon_id))
                .await
                .expect("identity");
            identities.push(identity);
        }
        identities
    }

    /// Run a fresh DKG led by `members[0]`.
    ///
    /// Offline members are listed in the candidate group but never accept.
    /// Results are in `members` order, offline members excluded.
    pub async fn run_dkg(
        &self,
        beacon_id: &str,
        members: &[usize],
        threshold: u32,
        period: u64,
    ) -> Vec<BeaconResult<Group>> {
        let leader = &self.nodes[members[0]];
        let followers = self
            .spawn_followers(beacon_id, members[0], &members[1..], |_| None, false)
            .await;
        let participants = self.identities(beacon_id, members).await;

        let mut results = vec![
            leader
                .init_dkg_leader(InitDkgLeaderRequest {
                    beacon_id: beacon_id.to_string(),
                    participants,
                    threshold,
                    period,
                    timeout_secs: Some(DKG_TIMEOUT_SECS),
                    genesis_delay_secs: Some(GENESIS_DELAY_SECS),
                })
                .await,
        ];
        for follower in followers {
            results.push(follower.await.expect("follower task"));
        }
        results
    }

    /// Register online `members` as followers of `leader`'s next session.
    pub async fn spawn_followers(
        &self,
        beacon_id: &str,
        leader: usize,
        members: &[usize],
        old_group: impl Fn(usize) -> Option<Group>,
        reshare: bool,
    ) -> Vec<tokio::task::JoinHandle<BeaconResult<Group>>> {
        let leader_address = self.nodes[leader].address().to_string();
        let followers = members
            .iter()
            .filter(|&&i| !self.network.is_offline(self.nodes[i].address()))
            .map(|&i| {
                let daemon = self.nodes[i].clone();
                let request = InitDkgFollowerRequest {
                    beacon_id: beacon_id.to_string(),
                    leader_address: leader_address.clone(),
                    old_group: old_group(i),
                };
                tokio::spawn(async move {
                    if reshare {
                        daemon.init_reshare_follower(request).await
                    } else {
                        daemon.init_dkg_follower(request).await
                    }
                })
            })
            .collect();
        // Let every follower register before the leader invites it
        tokio::time::sleep(Duration::from_millis(100)).await;
        followers
    }
}

/// Poll `daemon` until it serves `round`.
pub async fn wait_for_round(daemon: &Daemon, beacon_id: &str, round: u64) -> PublicRandResponse {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            if let Ok(entry) = daemon.public_rand(Metadata::for_beacon(beacon_id), Some(round)) {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never reached round {}", daemon.address(), round))
}

/// Public API of an in-process daemon.
pub struct DaemonSource {
    daemon: Arc<Daemon>,
    metadata: Metadata,
}

impl DaemonSource {
    pub fn new(daemon: Arc<Daemon>, metadata: Metadata) -> Self {
        Self { daemon, metadata }
    }
}

#[async_trait]
impl BeaconSource for DaemonSource {
    async fn chain_info(&self) -> ClientResult<(ChainInfo, ChainHash)> {
        let response = self
            .daemon
            .chain_info(self.metadata.clone())
            .map_err(|e| ClientError::Rpc(e.to_string()))?;
        Ok((response.info, response.hash))
    }

    async fn randomness(&self, round: Option<u64>) -> ClientResult<PublicRandResponse> {
        self.daemon
            .public_rand(self.metadata.clone(), round)
            .map_err(|e| ClientError::Rpc(e.to_string()))
    }
}
