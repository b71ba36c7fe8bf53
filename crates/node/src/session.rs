//! DKG and resharing sessions.
//!
//! A session wraps a [`DkgParticipant`] with time and networking. Every
//! participant starts dealing at the invitation's start time; the timeout is
//! split in three equal phases (deals, responses, justifications). A phase
//! ends early once every expected bundle has arrived.

use parking_lot::RwLock;
use rand::rngs::OsRng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use beacon_crypto::IdentityKey;
use beacon_dkg::{
    DistKeyShare, DkgConfig, DkgError, DkgPacket, DkgParticipant, Phase, ReshareParams, ResponseOutcome,
};
use beacon_types::{Group, Metadata};

use crate::config::NodeConfig;
use crate::error::{BeaconError, BeaconResult};
use crate::messages::{DkgInvitation, DkgPacketMessage};
use crate::transport::PeerClient;

/// Which side of the invitation this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Everything a session needs to run.
pub struct SessionContext {
    pub role: Role,
    pub beacon_id: String,
    pub self_address: String,
    pub key: IdentityKey,
    pub invitation: DkgInvitation,
    /// Our current share when resharing
    pub old_share: Option<DistKeyShare>,
    pub client: Arc<dyn PeerClient>,
    pub config: NodeConfig,
    /// Published phase, for status queries
    pub phase: Arc<RwLock<Phase>>,
}

/// Result of a successful session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// New keyed group, restricted to the holders that took part
    pub group: Group,
    /// Our share; `None` when leaving the group
    pub share: Option<DistKeyShare>,
}

/// Run a session to completion.
pub async fn run(
    ctx: SessionContext,
    packets: mpsc::Receiver<DkgPacket>,
    cancel: watch::Receiver<bool>,
) -> BeaconResult<SessionOutcome> {
    let phase = ctx.phase.clone();
    let result = match Session::new(ctx, packets, cancel) {
        Ok(session) => session.execute().await,
        Err(e) => Err(e),
    };
    *phase.write() = match &result {
        Ok(_) => Phase::Finished,
        Err(_) => Phase::Aborted,
    };
    result
}

struct Session {
    ctx: SessionContext,
    participant: DkgParticipant,
    packets: mpsc::Receiver<DkgPacket>,
    cancel: watch::Receiver<bool>,
    peers: Vec<String>,
    /// Bundles that arrived ahead of our own phase
    deferred: Vec<DkgPacket>,
}

impl Session {
    fn new(
        ctx: SessionContext,
        packets: mpsc::Receiver<DkgPacket>,
        cancel: watch::Receiver<bool>,
    ) -> BeaconResult<Self> {
        let invitation = &ctx.invitation;
        let mut config = DkgConfig::fresh(
            ctx.key.clone(),
            invitation.new_group.nodes.clone(),
            invitation.new_group.threshold,
            invitation.nonce,
        );
        if let Some(old) = &invitation.old_group {
            let old_public = old
                .public_key
                .clone()
                .ok_or_else(|| BeaconError::NotKeyed(ctx.beacon_id.clone()))?;
            config = config.with_reshare(ReshareParams {
                old_nodes: old.nodes.clone(),
                old_threshold: old.threshold,
                old_public,
                share: ctx.old_share.clone(),
            });
        }
        let participant = DkgParticipant::new(config)?;

        let mut addresses = BTreeSet::new();
        for node in invitation.new_group.nodes.iter().chain(
            invitation
                .old_group
                .iter()
                .flat_map(|group| group.nodes.iter()),
        ) {
            if node.address != ctx.self_address {
                addresses.insert(node.address.clone());
            }
        }

        Ok(Self {
            ctx,
            participant,
            packets,
            cancel,
            peers: addresses.into_iter().collect(),
            deferred: Vec::new(),
        })
    }

    async fn execute(mut self) -> BeaconResult<SessionOutcome> {
        let invitation = self.ctx.invitation.clone();
        let clock = self.ctx.config.clock.clone();
        let start = clock.instant_at(invitation.start_time);
        let third = Duration::from_millis(invitation.timeout_secs * 1000 / 3);

        info!(
            beacon_id = %self.ctx.beacon_id,
            role = ?self.ctx.role,
            reshare = invitation.is_reshare(),
            nodes = invitation.new_group.len(),
            threshold = invitation.new_group.threshold,
            "Waiting for DKG start"
        );
        if *self.cancel.borrow() {
            return Err(aborted());
        }
        tokio::select! {
            _ = self.cancel.changed() => return Err(aborted()),
            _ = sleep_until(start) => {}
        }

        self.set_phase(Phase::Dealing);
        if let Some(bundle) = self.participant.deal(&mut OsRng)? {
            debug!(beacon_id = %self.ctx.beacon_id, dealer = bundle.dealer_index, "Broadcasting deal");
            self.broadcast(DkgPacket::Deal(bundle));
        }
        self.collect(start + third, |p| p.deals_complete()).await?;

        if let Some(bundle) = self.participant.respond()? {
            let complaints = bundle.complaints().count();
            debug!(beacon_id = %self.ctx.beacon_id, complaints, "Broadcasting response");
            self.broadcast(DkgPacket::Response(bundle));
        }
        self.collect(start + third * 2, |p| p.responses_complete()).await?;

        let output = match self.participant.finish_dealing().map_err(session_error)? {
            ResponseOutcome::Finished(output) => output,
            ResponseOutcome::NeedJustification => {
                self.set_phase(Phase::Justifying);
                if let Some(bundle) = self.participant.justify()? {
                    debug!(beacon_id = %self.ctx.beacon_id, "Broadcasting justification");
                    self.broadcast(DkgPacket::Justification(bundle));
                }
                for packet in std::mem::take(&mut self.deferred) {
                    self.handle(packet);
                }
                self.collect(start + third * 3, |p| p.justifications_complete())
                    .await?;
                self.participant
                    .finish_justification()
                    .map_err(session_error)?
            }
        };

        let group = invitation
            .new_group
            .finalize(&output.present_holders, output.public.clone())?;
        info!(
            beacon_id = %self.ctx.beacon_id,
            qualified = output.qualified.len(),
            nodes = group.len(),
            "DKG finished"
        );
        Ok(SessionOutcome {
            group,
            share: output.share,
        })
    }

    fn set_phase(&self, phase: Phase) {
        *self.ctx.phase.write() = phase;
    }

    /// Feed bundles to the participant until `done` or `deadline`.
    async fn collect(
        &mut self,
        deadline: Instant,
        done: impl Fn(&DkgParticipant) -> bool,
    ) -> BeaconResult<()> {
        while !done(&self.participant) {
            tokio::select! {
                _ = self.cancel.changed() => return Err(aborted()),
                _ = sleep_until(deadline) => {
                    debug!(beacon_id = %self.ctx.beacon_id, phase = ?self.participant.phase(), "Phase deadline reached");
                    break;
                }
                packet = self.packets.recv() => match packet {
                    Some(packet) => self.handle(packet),
                    None => return Err(aborted()),
                },
            }
        }
        Ok(())
    }

    fn handle(&mut self, packet: DkgPacket) {
        let kind = packet.kind();
        let result = match packet.clone() {
            DkgPacket::Deal(bundle) => self.participant.process_deal(bundle),
            DkgPacket::Response(bundle) => self.participant.process_response(bundle),
            DkgPacket::Justification(bundle) => self.participant.process_justification(bundle),
        };
        match result {
            Ok(()) => {}
            Err(DkgError::WrongPhase { .. }) if kind == "justification" => {
                self.deferred.push(packet);
            }
            Err(DkgError::DuplicateMessage(_)) => {}
            Err(e) => warn!(beacon_id = %self.ctx.beacon_id, kind, error = %e, "Rejected DKG bundle"),
        }
    }

    fn broadcast(&self, packet: DkgPacket) {
        let message = DkgPacketMessage {
            metadata: Metadata::for_beacon(&self.ctx.beacon_id),
            packet,
        };
        for peer in &self.peers {
            let client = self.ctx.client.clone();
            let peer = peer.clone();
            let message = message.clone();
            let peer_timeout = self.ctx.config.peer_timeout();
            tokio::spawn(async move {
                match timeout(peer_timeout, client.dkg_packet(&peer, message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(peer = %peer, error = %e, "DKG bundle not delivered"),
                    Err(_) => debug!(peer = %peer, "DKG bundle delivery timed out"),
                }
            });
        }
    }
}

fn aborted() -> BeaconError {
    BeaconError::SessionAborted("cancelled".to_string())
}

/// Too few participants by the deadline is a timeout.
fn session_error(e: DkgError) -> BeaconError {
    match e {
        DkgError::NotEnoughDealers { .. } | DkgError::NotEnoughParticipants { .. } => {
            warn!(error = %e, "DKG could not complete");
            BeaconError::DkgTimeout
        }
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::key_store::KeyPair;
    use crate::messages::{Identity, SyncRequest};
    use crate::transport::{TransportError, TransportResult};
    use async_trait::async_trait;
    use beacon_crypto::{recover_secret, scalar_from_bytes};
    use beacon_types::{BeaconEntry, Node, PartialBeacon};
    use bls12_381::{G2Projective, Scalar};
    use group::Curve;
    use std::collections::HashMap;
    use tokio::task::JoinHandle;

    /// Delivers DKG bundles straight into each session's queue.
    #[derive(Default)]
    struct Mesh {
        queues: parking_lot::Mutex<HashMap<String, mpsc::Sender<DkgPacket>>>,
    }

    #[async_trait]
    impl PeerClient for Mesh {
        async fn dkg_invite(&self, peer: &str, _: DkgInvitation) -> TransportResult<()> {
            Err(TransportError::Unreachable(peer.into()))
        }

        async fn dkg_packet(&self, peer: &str, message: DkgPacketMessage) -> TransportResult<()> {
            let queue = self
                .queues
                .lock()
                .get(peer)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(peer.into()))?;
            queue
                .send(message.packet)
                .await
                .map_err(|_| TransportError::Unreachable(peer.into()))
        }

        async fn partial_beacon(&self, peer: &str, _: Metadata, _: PartialBeacon) -> TransportResult<()> {
            Err(TransportError::Unreachable(peer.into()))
        }

        async fn sync_chain(&self, peer: &str, _: SyncRequest) -> TransportResult<Vec<BeaconEntry>> {
            Err(TransportError::Unreachable(peer.into()))
        }

        async fn identity(&self, peer: &str, _: Metadata) -> TransportResult<Identity> {
            Err(TransportError::Unreachable(peer.into()))
        }
    }

    struct Setup {
        key_pairs: Vec<KeyPair>,
        invitation: DkgInvitation,
        mesh: Arc<Mesh>,
        clock: Clock,
    }

    fn setup(n: u32, threshold: u32) -> Setup {
        let key_pairs: Vec<KeyPair> = (0..n)
            .map(|i| KeyPair::generate(&format!("node-{i}"), &mut OsRng))
            .collect();
        let nodes = key_pairs
            .iter()
            .enumerate()
            .map(|(i, kp)| Node {
                index: i as u32,
                public_key: kp.public_key.clone(),
                address: kp.address.clone(),
            })
            .collect();
        let clock = Clock::starting_at(10_000);
        let invitation = DkgInvitation {
            metadata: Metadata::for_beacon("default"),
            leader_address: "node-0".into(),
            nonce: [7u8; 32],
            new_group: Group::new(nodes, threshold, 10_100, 3, "default").unwrap(),
            old_group: None,
            timeout_secs: 30,
            start_time: 10_002,
        };
        Setup {
            key_pairs,
            invitation,
            mesh: Arc::new(Mesh::default()),
            clock,
        }
    }

    fn start(
        setup: &Setup,
        index: usize,
        invitation: DkgInvitation,
        old_share: Option<DistKeyShare>,
    ) -> (JoinHandle<BeaconResult<SessionOutcome>>, watch::Sender<bool>) {
        let kp = &setup.key_pairs[index];
        let (tx, rx) = mpsc::channel(64);
        setup.mesh.queues.lock().insert(kp.address.clone(), tx);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = SessionContext {
            role: if index == 0 { Role::Leader } else { Role::Follower },
            beacon_id: "default".into(),
            self_address: kp.address.clone(),
            key: kp.identity_key().unwrap(),
            invitation,
            old_share,
            client: setup.mesh.clone(),
            config: NodeConfig::new(kp.address.clone()).with_clock(setup.clock.clone()),
            phase: Arc::new(RwLock::new(Phase::Idle)),
        };
        (tokio::spawn(run(ctx, rx, cancel_rx)), cancel_tx)
    }

    fn group_secret(outcomes: &[SessionOutcome]) -> Scalar {
        let shares: Vec<(u32, Scalar)> = outcomes
            .iter()
            .filter_map(|o| o.share.as_ref())
            .map(|s| (s.index, scalar_from_bytes(&s.secret).unwrap()))
            .collect();
        recover_secret(&shares).unwrap()
    }

    fn public_of(secret: &Scalar) -> beacon_types::G2Point {
        beacon_crypto::compress_g2(&(G2Projective::generator() * secret).to_affine())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_dkg_all_online() {
        let setup = setup(3, 2);
        let handles: Vec<_> = (0..3)
            .map(|i| start(&setup, i, setup.invitation.clone(), None))
            .collect();

        let mut outcomes = Vec::new();
        for (handle, _cancel) in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        let group = &outcomes[0].group;
        assert_eq!(group.len(), 3);
        assert!(outcomes.iter().all(|o| &o.group == group));
        let key = group.public_key.as_ref().unwrap().key().unwrap().clone();
        assert_eq!(public_of(&group_secret(&outcomes)), key);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_node_dropped_from_group() {
        let setup = setup(4, 3);
        // node-3 never starts
        let handles: Vec<_> = (0..3)
            .map(|i| start(&setup, i, setup.invitation.clone(), None))
            .collect();

        for (handle, _cancel) in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert_eq!(outcome.group.indices(), vec![0, 1, 2]);
            assert_eq!(outcome.group.threshold, 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_few_participants_times_out() {
        let setup = setup(4, 3);
        let handles: Vec<_> = (0..2)
            .map(|i| start(&setup, i, setup.invitation.clone(), None))
            .collect();

        for (handle, _cancel) in handles {
            assert!(matches!(handle.await.unwrap(), Err(BeaconError::DkgTimeout)));
        }
        // Timeout is reached on the invitation's schedule
        assert!(setup.clock.now_unix() >= 10_002 + 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let setup = setup(3, 2);
        let (handle, cancel) = start(&setup, 1, setup.invitation.clone(), None);
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.send(true).unwrap();
        assert!(matches!(
            handle.await.unwrap(),
            Err(BeaconError::SessionAborted(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reshare_keeps_key() {
        let setup = setup(3, 2);
        let handles: Vec<_> = (0..3)
            .map(|i| start(&setup, i, setup.invitation.clone(), None))
            .collect();
        let mut outcomes = Vec::new();
        for (handle, _cancel) in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }
        let old_group = outcomes[0].group.clone();

        // Same nodes, threshold raised to 3
        let now = setup.clock.now_unix();
        let new_group = old_group.reshared(old_group.nodes.clone(), 3, now + 60).unwrap();
        let invitation = DkgInvitation {
            nonce: [8u8; 32],
            new_group,
            old_group: Some(old_group.clone()),
            start_time: now + 2,
            ..setup.invitation.clone()
        };
        let handles: Vec<_> = (0..3)
            .map(|i| start(&setup, i, invitation.clone(), outcomes[i].share.clone()))
            .collect();
        let mut reshared = Vec::new();
        for (handle, _cancel) in handles {
            reshared.push(handle.await.unwrap().unwrap());
        }

        let group = &reshared[0].group;
        assert_eq!(group.threshold, 3);
        assert_eq!(group.chain_hash(), old_group.chain_hash());
        assert_eq!(group_secret(&reshared), group_secret(&outcomes));
    }
}
