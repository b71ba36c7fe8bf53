//! One beacon chain hosted by a daemon.
//!
//! A process owns the chain store and key material of its beacon id, runs at
//! most one DKG session and at most one generation loop, and hands over from
//! the first to the second when a session finishes.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::{rngs::OsRng, RngCore};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use beacon_chain::{Store, StoreError};
use beacon_dkg::{DistKeyShare, DkgPacket, Phase};
use beacon_types::{
    canonical_beacon_id, current_round, time_of_round, BeaconEntry, ChainInfo, Group, Metadata, Node,
    PartialBeacon, PublicRandResponse,
};

use crate::config::NodeConfig;
use crate::error::{BeaconError, BeaconResult};
use crate::generation::{self, LoopContext, LoopHandle};
use crate::key_store::{KeyPair, KeyStore, KeyStoreError};
use crate::messages::{
    BeaconStatus, DkgInvitation, Identity, InitDkgFollowerRequest, InitDkgLeaderRequest,
    InitReshareLeaderRequest, StatusResponse,
};
use crate::router::BeaconRegistry;
use crate::session::{self, Role, SessionContext, SessionOutcome};
use crate::sync::serve_range;
use crate::transport::PeerClient;

/// Queue of DKG bundles waiting for the session.
const PACKET_QUEUE: usize = 256;

/// Capacity of the beacon subscription channel.
const EVENT_QUEUE: usize = 64;

type SessionResult = oneshot::Sender<BeaconResult<Group>>;

/// Follower state between accepting a DKG and receiving the invitation.
struct Pending {
    packets: mpsc::Receiver<DkgPacket>,
    result: SessionResult,
}

struct ActiveSession {
    leader_address: String,
    /// Set once the invitation is known
    nonce: Option<[u8; 32]>,
    /// Old group supplied by a joining follower
    old_group: Option<Group>,
    packets: mpsc::Sender<DkgPacket>,
    pending: Option<Pending>,
    cancel: watch::Sender<bool>,
    phase: Arc<RwLock<Phase>>,
}

#[derive(Default)]
struct ProcessState {
    group: Option<Group>,
    share: Option<DistKeyShare>,
    generation: Option<LoopHandle>,
    session: Option<ActiveSession>,
    /// Set by an explicit stop; sessions ending afterwards do not restart the loop
    stopped: bool,
}

pub struct BeaconProcess {
    beacon_id: String,
    config: NodeConfig,
    key_pair: KeyPair,
    key_store: Arc<dyn KeyStore>,
    store: Arc<dyn Store>,
    client: Arc<dyn PeerClient>,
    registry: Weak<BeaconRegistry<BeaconProcess>>,
    events: broadcast::Sender<BeaconEntry>,
    status: Arc<RwLock<BeaconStatus>>,
    state: Mutex<ProcessState>,
}

impl BeaconProcess {
    /// Load a beacon from the key store, generating its key pair on first use.
    pub fn load(
        beacon_id: &str,
        config: NodeConfig,
        key_store: Arc<dyn KeyStore>,
        client: Arc<dyn PeerClient>,
        registry: Weak<BeaconRegistry<BeaconProcess>>,
    ) -> BeaconResult<Arc<Self>> {
        let beacon_id = canonical_beacon_id(beacon_id).to_string();
        let key_pair = match key_store.load_key_pair(&beacon_id) {
            Ok(key_pair) => key_pair,
            Err(KeyStoreError::MissingKeyPair(_)) => {
                let key_pair = KeyPair::generate(&config.private_listen, &mut OsRng);
                key_store.save_key_pair(&beacon_id, &key_pair)?;
                info!(beacon_id = %beacon_id, public_key = %key_pair.public_key.to_hex(), "Generated key pair");
                key_pair
            }
            Err(e) => return Err(e.into()),
        };

        let group = key_store.load_group(&beacon_id)?;
        // A share left over from an older epoch no longer matches the group key
        let share = key_store.load_share(&beacon_id)?.filter(|share| {
            group
                .as_ref()
                .and_then(|g| g.public_key.as_ref())
                .is_some_and(|public| public.coefficients == share.commitments)
        });
        let store = key_store.chain_store(&beacon_id)?;
        let (events, _) = broadcast::channel(EVENT_QUEUE);

        Ok(Arc::new(Self {
            beacon_id,
            config,
            key_pair,
            key_store,
            store,
            client,
            registry,
            events,
            status: Arc::new(RwLock::new(BeaconStatus::Stopped)),
            state: Mutex::new(ProcessState {
                group,
                share,
                ..Default::default()
            }),
        }))
    }

    pub fn beacon_id(&self) -> &str {
        &self.beacon_id
    }

    pub fn identity(&self) -> Identity {
        self.key_pair.identity()
    }

    pub fn group(&self) -> Option<Group> {
        self.state.lock().group.clone()
    }

    pub fn chain_info(&self) -> BeaconResult<ChainInfo> {
        self.group()
            .and_then(|g| g.chain_info())
            .ok_or_else(|| BeaconError::NotKeyed(self.beacon_id.clone()))
    }

    pub fn status(&self) -> BeaconStatus {
        *self.status.read()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn status_report(&self) -> StatusResponse {
        let state = self.state.lock();
        let group = state.group.as_ref();
        StatusResponse {
            beacon_id: self.beacon_id.clone(),
            status: self.status(),
            last_round: self.store.last().ok().map(|e| e.round),
            chain_hash: group.and_then(|g| g.chain_hash()).map(|h| h.to_hex()),
            dkg_phase: state.session.as_ref().map(|s| *s.phase.read()),
            group_size: group.map(|g| g.len()).unwrap_or(0),
            threshold: group.map(|g| g.threshold).unwrap_or(0),
        }
    }

    // =========================
    // GENERATION
    // =========================

    /// Start the generation loop; a no-op when it already runs.
    pub fn start(&self, catchup: bool) -> BeaconResult<()> {
        let mut state = self.state.lock();
        state.stopped = false;
        self.start_locked(&mut state, catchup)
    }

    fn start_locked(&self, state: &mut ProcessState, catchup: bool) -> BeaconResult<()> {
        if state.generation.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        let group = state
            .group
            .clone()
            .filter(|g| g.public_key.is_some())
            .ok_or_else(|| BeaconError::NotKeyed(self.beacon_id.clone()))?;
        let share = state
            .share
            .clone()
            .ok_or_else(|| BeaconError::NotInGroup(self.beacon_id.clone()))?;

        let handle = generation::spawn(
            LoopContext {
                beacon_id: self.beacon_id.clone(),
                group,
                share,
                store: self.store.clone(),
                client: self.client.clone(),
                config: self.config.clone(),
                events: self.events.clone(),
                status: self.status.clone(),
            },
            catchup,
        )?;
        state.generation = Some(handle);
        Ok(())
    }

    /// Stop the generation loop and abort any session.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        if let Some(session) = state.session.take() {
            let _ = session.cancel.send(true);
        }
        if let Some(handle) = state.generation.take() {
            handle.stop();
        }
        *self.status.write() = BeaconStatus::Stopped;
        info!(beacon_id = %self.beacon_id, "Beacon stopped");
    }

    pub fn process_partial(&self, partial: PartialBeacon) -> BeaconResult<()> {
        let state = self.state.lock();
        match &state.generation {
            Some(handle) if !handle.is_finished() => {
                handle.submit(partial);
                Ok(())
            }
            _ => Err(BeaconError::BeaconNotRunning(self.beacon_id.clone())),
        }
    }

    pub fn sync_range(&self, from_round: u64, limit: usize) -> BeaconResult<Vec<BeaconEntry>> {
        serve_range(self.store.as_ref(), from_round, limit, self.config.sync_batch_size)
    }

    /// Entry for `round`, or the latest one.
    pub fn public_rand(&self, round: Option<u64>) -> BeaconResult<PublicRandResponse> {
        let entry = match round {
            Some(round) if round > 0 => self.store.get(round)?,
            _ => self.store.last()?,
        };
        if entry.round == 0 {
            return Err(StoreError::NotFound(1).into());
        }
        Ok(entry.to_response())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BeaconEntry> {
        self.events.subscribe()
    }

    // =========================
    // DKG
    // =========================

    /// Run a fresh DKG as leader; resolves with the new group.
    pub async fn init_dkg_leader(self: &Arc<Self>, request: InitDkgLeaderRequest) -> BeaconResult<Group> {
        if self.group().is_some_and(|g| g.public_key.is_some()) {
            return Err(BeaconError::InvalidRequest(format!(
                "beacon {} already holds a distributed key",
                self.beacon_id
            )));
        }
        let timeout_secs = request.timeout_secs.unwrap_or(self.config.dkg_timeout_secs);
        let start_time = self.config.clock.now_unix() + self.config.dkg_start_offset_secs;
        let genesis_delay = request
            .genesis_delay_secs
            .unwrap_or(self.config.genesis_delay_secs);
        let group = Group::new(
            nodes_of(&request.participants),
            request.threshold,
            start_time + timeout_secs + genesis_delay,
            request.period,
            &self.beacon_id,
        )?;
        self.lead(group, None, timeout_secs, start_time).await
    }

    /// Reshare the current key as leader; resolves with the new group.
    pub async fn init_reshare_leader(
        self: &Arc<Self>,
        request: InitReshareLeaderRequest,
    ) -> BeaconResult<Group> {
        let old_group = self
            .group()
            .filter(|g| g.public_key.is_some())
            .ok_or_else(|| BeaconError::NotKeyed(self.beacon_id.clone()))?;
        let timeout_secs = request.timeout_secs.unwrap_or(self.config.dkg_timeout_secs);
        let start_time = self.config.clock.now_unix() + self.config.dkg_start_offset_secs;

        // First round boundary after the deadline
        let deadline = start_time + timeout_secs;
        let next_round = current_round(deadline, old_group.period, old_group.genesis_time) + 1;
        let transition_time = time_of_round(old_group.period, old_group.genesis_time, next_round);
        let group = old_group.reshared(nodes_of(&request.participants), request.threshold, transition_time)?;
        self.lead(group, Some(old_group), timeout_secs, start_time).await
    }

    async fn lead(
        self: &Arc<Self>,
        new_group: Group,
        old_group: Option<Group>,
        timeout_secs: u64,
        start_time: u64,
    ) -> BeaconResult<Group> {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        let invitation = DkgInvitation {
            metadata: Metadata::for_beacon(&self.beacon_id),
            leader_address: self.key_pair.address.clone(),
            nonce,
            new_group,
            old_group,
            timeout_secs,
            start_time,
        };

        let (packets_tx, packets_rx) = mpsc::channel(PACKET_QUEUE);
        let (result_tx, result_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let phase = Arc::new(RwLock::new(Phase::Idle));
        {
            let mut state = self.state.lock();
            self.replace_session(
                &mut state,
                ActiveSession {
                    leader_address: self.key_pair.address.clone(),
                    nonce: Some(nonce),
                    old_group: None,
                    packets: packets_tx,
                    pending: None,
                    cancel: cancel_tx,
                    phase: phase.clone(),
                },
            );
        }

        self.send_invitations(&invitation).await;
        let old_share = self.state.lock().share.clone();
        self.launch(
            Role::Leader,
            invitation,
            old_share,
            phase,
            packets_rx,
            cancel_rx,
            result_tx,
        );
        result_rx
            .await
            .map_err(|_| BeaconError::SessionAborted("session dropped".to_string()))?
    }

    async fn send_invitations(&self, invitation: &DkgInvitation) {
        let peers: Vec<String> = invitation
            .new_group
            .nodes
            .iter()
            .chain(invitation.old_group.iter().flat_map(|g| g.nodes.iter()))
            .map(|n| n.address.clone())
            .filter(|address| *address != self.key_pair.address)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        let peer_timeout = self.config.peer_timeout();
        let sends = peers.iter().map(|peer| {
            let invitation = invitation.clone();
            async move {
                let result = timeout(peer_timeout, self.client.dkg_invite(peer, invitation)).await;
                match result {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!(peer = %peer, error = %e, "Invitation rejected");
                        false
                    }
                    Err(_) => {
                        warn!(peer = %peer, "Invitation timed out");
                        false
                    }
                }
            }
        });
        let accepted = join_all(sends).await.into_iter().filter(|ok| *ok).count();
        info!(
            beacon_id = %self.beacon_id,
            accepted,
            invited = peers.len(),
            "DKG invitations sent"
        );
    }

    /// Accept the next invitation from `leader_address`; resolves with the new group.
    pub async fn init_dkg_follower(self: &Arc<Self>, request: InitDkgFollowerRequest) -> BeaconResult<Group> {
        let (packets_tx, packets_rx) = mpsc::channel(PACKET_QUEUE);
        let (result_tx, result_rx) = oneshot::channel();
        let (cancel_tx, _) = watch::channel(false);
        {
            let mut state = self.state.lock();
            self.replace_session(
                &mut state,
                ActiveSession {
                    leader_address: request.leader_address.clone(),
                    nonce: None,
                    old_group: request.old_group,
                    packets: packets_tx,
                    pending: Some(Pending {
                        packets: packets_rx,
                        result: result_tx,
                    }),
                    cancel: cancel_tx,
                    phase: Arc::new(RwLock::new(Phase::Idle)),
                },
            );
        }
        info!(beacon_id = %self.beacon_id, leader = %request.leader_address, "Waiting for DKG invitation");

        // Once invited, the session bounds itself
        let mut result_rx = result_rx;
        let wait = Duration::from_secs(self.config.dkg_timeout_secs + self.config.dkg_start_offset_secs);
        let outcome = match timeout(wait, &mut result_rx).await {
            Ok(outcome) => outcome,
            Err(_) if self.drop_uninvited(&request.leader_address) => {
                warn!(beacon_id = %self.beacon_id, leader = %request.leader_address, "No DKG invitation received");
                return Err(BeaconError::DkgTimeout);
            }
            Err(_) => result_rx.await,
        };
        outcome.map_err(|_| BeaconError::SessionAborted("session dropped".to_string()))?
    }

    /// Drop a follower session still waiting for `leader_address`.
    fn drop_uninvited(&self, leader_address: &str) -> bool {
        let mut state = self.state.lock();
        let uninvited = state
            .session
            .as_ref()
            .is_some_and(|s| s.pending.is_some() && s.leader_address == leader_address);
        if uninvited {
            state.session = None;
        }
        uninvited
    }

    /// Handle an invitation from a leader.
    pub fn on_invitation(self: &Arc<Self>, invitation: DkgInvitation) -> BeaconResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let session = state
            .session
            .as_mut()
            .filter(|s| s.leader_address == invitation.leader_address)
            .ok_or_else(|| {
                BeaconError::InvalidRequest(format!(
                    "no DKG expected from {}",
                    invitation.leader_address
                ))
            })?;
        if session.pending.is_none() {
            return Err(BeaconError::DkgInProgress(self.beacon_id.clone()));
        }

        if canonical_beacon_id(&invitation.new_group.beacon_id) != self.beacon_id {
            return Err(BeaconError::InvalidRequest("invitation for another beacon".into()));
        }
        if invitation.new_group.public_key.is_some() {
            return Err(BeaconError::InvalidRequest("candidate group is already keyed".into()));
        }
        match &invitation.old_group {
            Some(old) => {
                let known = state.group.as_ref().or(session.old_group.as_ref());
                if known.map(|g| g.hash()) != Some(old.hash()) {
                    return Err(BeaconError::InvalidRequest("unknown group to reshare".into()));
                }
            }
            None => {
                if state.group.as_ref().is_some_and(|g| g.public_key.is_some()) {
                    return Err(BeaconError::InvalidRequest(format!(
                        "beacon {} already holds a distributed key",
                        self.beacon_id
                    )));
                }
            }
        }

        let Some(pending) = session.pending.take() else {
            return Err(BeaconError::DkgInProgress(self.beacon_id.clone()));
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        session.nonce = Some(invitation.nonce);
        session.cancel = cancel_tx;
        let phase = session.phase.clone();
        let old_share = if invitation.is_reshare() {
            state.share.clone()
        } else {
            None
        };
        drop(guard);

        info!(beacon_id = %self.beacon_id, leader = %invitation.leader_address, "Accepted DKG invitation");
        self.launch(
            Role::Follower,
            invitation,
            old_share,
            phase,
            pending.packets,
            cancel_rx,
            pending.result,
        );
        Ok(())
    }

    /// Queue a DKG bundle for the current session.
    pub fn process_dkg_packet(&self, packet: DkgPacket) -> BeaconResult<()> {
        let state = self.state.lock();
        let session = state
            .session
            .as_ref()
            .ok_or_else(|| BeaconError::InvalidRequest("no DKG in progress".into()))?;
        if session.nonce.is_some_and(|nonce| nonce != *packet.session_id()) {
            return Err(BeaconError::InvalidRequest("bundle for another session".into()));
        }
        if let Err(e) = session.packets.try_send(packet) {
            debug!(beacon_id = %self.beacon_id, error = %e, "Dropping DKG bundle");
        }
        Ok(())
    }

    /// Abort the current session, if any.
    pub fn abort_dkg(&self) {
        let mut state = self.state.lock();
        if let Some(session) = state.session.take() {
            warn!(beacon_id = %self.beacon_id, "Aborting DKG session");
            let _ = session.cancel.send(true);
        }
    }

    fn replace_session(&self, state: &mut ProcessState, session: ActiveSession) {
        state.stopped = false;
        if let Some(previous) = state.session.replace(session) {
            warn!(beacon_id = %self.beacon_id, "Aborting previous DKG session");
            let _ = previous.cancel.send(true);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        self: &Arc<Self>,
        role: Role,
        invitation: DkgInvitation,
        old_share: Option<DistKeyShare>,
        phase: Arc<RwLock<Phase>>,
        packets: mpsc::Receiver<DkgPacket>,
        cancel: watch::Receiver<bool>,
        result: SessionResult,
    ) {
        // Resharing takes over the chain; the old loop stops for the session
        if invitation.is_reshare() {
            if let Some(handle) = self.state.lock().generation.take() {
                handle.stop();
            }
        }
        *self.status.write() = BeaconStatus::Dkg;

        let nonce = invitation.nonce;
        let ctx = SessionContext {
            role,
            beacon_id: self.beacon_id.clone(),
            self_address: self.key_pair.address.clone(),
            key: match self.key_pair.identity_key() {
                Ok(key) => key,
                Err(e) => {
                    let _ = result.send(Err(e.into()));
                    return;
                }
            },
            invitation,
            old_share,
            client: self.client.clone(),
            config: self.config.clone(),
            phase,
        };

        let process = self.clone();
        tokio::spawn(async move {
            let outcome = session::run(ctx, packets, cancel).await;
            let _ = result.send(process.finish_session(nonce, outcome));
        });
    }

    /// Hand over from a finished session.
    fn finish_session(&self, nonce: [u8; 32], outcome: BeaconResult<SessionOutcome>) -> BeaconResult<Group> {
        let mut state = self.state.lock();
        if state.session.as_ref().and_then(|s| s.nonce) == Some(nonce) {
            state.session = None;
        }

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(beacon_id = %self.beacon_id, error = %e, "DKG failed");
                // Resume the previous epoch, if any
                if state.session.is_none()
                    && (state.stopped || self.start_locked(&mut state, true).is_err())
                {
                    *self.status.write() = BeaconStatus::Stopped;
                }
                return Err(e);
            }
        };

        self.key_store.save_group(&self.beacon_id, &outcome.group)?;
        if let Some(share) = &outcome.share {
            self.key_store.save_share(&self.beacon_id, share)?;
        }
        state.group = Some(outcome.group.clone());
        state.share = outcome.share.clone();

        if let (Some(registry), Some(chain_hash)) = (self.registry.upgrade(), outcome.group.chain_hash()) {
            registry.add_chain_hash(&chain_hash, &self.beacon_id);
            info!(beacon_id = %self.beacon_id, chain_hash = %chain_hash, "New group installed");
        }

        if state.stopped {
            *self.status.write() = BeaconStatus::Stopped;
        } else if outcome.share.is_some() {
            self.start_locked(&mut state, true)?;
        } else {
            info!(beacon_id = %self.beacon_id, "Left the group");
            *self.status.write() = BeaconStatus::Stopped;
        }
        Ok(outcome.group)
    }
}

fn nodes_of(participants: &[Identity]) -> Vec<Node> {
    participants
        .iter()
        .enumerate()
        .map(|(index, identity)| Node {
            index: index as u32,
            public_key: identity.public_key.clone(),
            address: identity.address.clone(),
        })
        .collect()
}
