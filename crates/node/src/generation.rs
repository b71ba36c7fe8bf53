//! Round generation loop.
//!
//! Once a beacon holds a share, one loop task per beacon:
//! 1. Waits for the scheduled time of the next round
//! 2. Signs the round on top of the local tip and broadcasts the partial
//! 3. Collects peer partials until the threshold is met, recovers the group
//!    signature and appends the entry to the store
//! 4. When behind, syncs from peers and otherwise re-signs the oldest missing
//!    round, spacing catch-up rounds by the catch-up period

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use beacon_chain::{ChainVerifier, PartialCache, PartialError, Store, StoreError};
use beacon_crypto::{scalar_from_bytes, sign_partial};
use beacon_dkg::DistKeyShare;
use beacon_types::{current_round, time_of_round, BeaconEntry, Group, Metadata, PartialBeacon};

use crate::config::NodeConfig;
use crate::error::{BeaconError, BeaconResult};
use crate::messages::BeaconStatus;
use crate::sync::SyncManager;
use crate::transport::PeerClient;

/// Capacity of the inbound partial queue.
const PARTIAL_QUEUE: usize = 1024;

/// Everything a loop needs, handed over at spawn.
pub struct LoopContext {
    pub beacon_id: String,
    pub group: Group,
    pub share: DistKeyShare,
    pub store: Arc<dyn Store>,
    pub client: Arc<dyn PeerClient>,
    pub config: NodeConfig,
    pub events: broadcast::Sender<BeaconEntry>,
    pub status: Arc<RwLock<BeaconStatus>>,
}

/// Handle on a running loop.
pub struct LoopHandle {
    partials: mpsc::Sender<PartialBeacon>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    /// Queue a peer partial; dropped when the queue is full.
    pub fn submit(&self, partial: PartialBeacon) {
        if let Err(e) = self.partials.try_send(partial) {
            debug!(error = %e, "Dropping partial");
        }
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the loop; `catchup` syncs from peers before the first round.
pub fn spawn(ctx: LoopContext, catchup: bool) -> BeaconResult<LoopHandle> {
    let chain_loop = ChainLoop::new(ctx)?;
    let (partials_tx, partials_rx) = mpsc::channel(PARTIAL_QUEUE);
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(chain_loop.run(partials_rx, stop_rx, catchup));
    Ok(LoopHandle {
        partials: partials_tx,
        stop: stop_tx,
        task,
    })
}

struct ChainLoop {
    ctx: LoopContext,
    secret: bls12_381::Scalar,
    cache: PartialCache,
    metadata: Metadata,
    peers: Vec<String>,
    sync: SyncManager,
    last_sync: Option<Instant>,
}

impl ChainLoop {
    fn new(ctx: LoopContext) -> BeaconResult<Self> {
        let info = ctx
            .group
            .chain_info()
            .ok_or_else(|| BeaconError::NotKeyed(ctx.beacon_id.clone()))?;
        if ctx.group.node(ctx.share.index).is_none() {
            return Err(BeaconError::NotInGroup(ctx.beacon_id.clone()));
        }

        let secret = scalar_from_bytes(&ctx.share.secret)?;
        let cache = PartialCache::new(ctx.group.clone(), ctx.config.partial_cache_rounds)?;
        let metadata = Metadata::for_beacon(&ctx.beacon_id).with_chain_hash(info.hash().as_bytes());
        let peers: Vec<String> = ctx
            .group
            .nodes
            .iter()
            .filter(|n| n.index != ctx.share.index)
            .map(|n| n.address.clone())
            .collect();
        let sync = SyncManager {
            client: ctx.client.clone(),
            peers: peers.clone(),
            metadata: metadata.clone(),
            verifier: ChainVerifier::from_info(&info),
            store: ctx.store.clone(),
            max_attempts: ctx.config.sync_max_attempts,
            batch_size: ctx.config.sync_batch_size,
            peer_timeout: ctx.config.peer_timeout(),
        };

        Ok(Self {
            ctx,
            secret,
            cache,
            metadata,
            peers,
            sync,
            last_sync: None,
        })
    }

    async fn run(
        mut self,
        mut partials: mpsc::Receiver<PartialBeacon>,
        mut stop: watch::Receiver<bool>,
        catchup: bool,
    ) {
        let beacon_id = self.ctx.beacon_id.clone();
        info!(beacon_id = %beacon_id, index = self.ctx.share.index, "Starting generation loop");

        if let Err(e) = self.ensure_genesis() {
            error!(beacon_id = %beacon_id, error = %e, "Cannot initialize chain");
            self.set_status(BeaconStatus::Stopped);
            return;
        }
        if catchup && self.current_round() > 0 {
            self.set_status(BeaconStatus::CatchingUp);
            self.catch_up(&mut stop).await;
        }

        // Earliest start of the next catch-up round
        let mut pace: Option<Instant> = None;
        'rounds: loop {
            if *stop.borrow() {
                break;
            }
            let tip = match self.ctx.store.last() {
                Ok(tip) => tip,
                Err(e) => {
                    error!(beacon_id = %beacon_id, error = %e, "Cannot read chain tip");
                    break;
                }
            };
            self.cache.set_tip(&tip);
            let next = tip.round + 1;
            let current = self.current_round();

            if next > current {
                self.set_status(BeaconStatus::Live);
                let wake = self.round_instant(next);
                if !self.idle_until(wake, &tip, &mut partials, &mut stop).await {
                    break;
                }
                continue;
            }

            if next < current {
                self.set_status(BeaconStatus::CatchingUp);
                if let Some(at) = pace.take() {
                    if !self.idle_until(at, &tip, &mut partials, &mut stop).await {
                        break;
                    }
                }
                if self.catch_up(&mut stop).await {
                    continue;
                }
                if *stop.borrow() {
                    break;
                }
            } else {
                self.set_status(BeaconStatus::Live);
            }

            let catchup_period = self.ctx.config.catchup_period(self.ctx.group.period);
            self.sign_and_broadcast(next, &tip);
            if self.try_commit(next, &tip) {
                pace = (next < current).then(|| Instant::now() + catchup_period);
                continue;
            }

            let deadline = if next < current {
                Instant::now() + catchup_period
            } else {
                self.round_instant(next + 1)
            };
            loop {
                tokio::select! {
                    _ = stop.changed() => break 'rounds,
                    _ = sleep_until(deadline) => {
                        if next == current {
                            warn!(beacon_id = %beacon_id, round = next, "Round not finalized in time");
                        }
                        break;
                    }
                    Some(partial) = partials.recv() => {
                        self.on_partial(partial, &tip);
                        if self.try_commit(next, &tip) {
                            pace = (next < current).then(|| Instant::now() + catchup_period);
                            break;
                        }
                    }
                }
            }
        }

        info!(beacon_id = %beacon_id, "Generation loop stopped");
        self.set_status(BeaconStatus::Stopped);
    }

    /// Absorb partials until `until`; false once stopped.
    async fn idle_until(
        &mut self,
        until: Instant,
        tip: &BeaconEntry,
        partials: &mut mpsc::Receiver<PartialBeacon>,
        stop: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            tokio::select! {
                _ = stop.changed() => return false,
                _ = sleep_until(until) => return true,
                Some(partial) = partials.recv() => self.on_partial(partial, tip),
            }
        }
    }

    fn current_round(&self) -> u64 {
        let now = self.ctx.config.clock.now_unix();
        current_round(now, self.ctx.group.period, self.ctx.group.genesis_time)
    }

    fn round_instant(&self, round: u64) -> Instant {
        let group = &self.ctx.group;
        self.ctx
            .config
            .clock
            .instant_at(time_of_round(group.period, group.genesis_time, round))
    }

    fn set_status(&self, status: BeaconStatus) {
        *self.ctx.status.write() = status;
    }

    fn ensure_genesis(&self) -> BeaconResult<()> {
        if self.ctx.store.is_empty() {
            self.ctx
                .store
                .put(BeaconEntry::genesis(self.ctx.group.genesis_seed))?;
            debug!(beacon_id = %self.ctx.beacon_id, "Stored genesis entry");
        }
        Ok(())
    }

    /// Sync from peers, at most once per period. Returns whether the chain advanced.
    async fn catch_up(&mut self, stop: &mut watch::Receiver<bool>) -> bool {
        let period = Duration::from_secs(self.ctx.group.period);
        if self.last_sync.is_some_and(|at| at.elapsed() < period) || self.peers.is_empty() {
            return false;
        }
        self.last_sync = Some(Instant::now());

        let before = self.ctx.store.len();
        let target = self.current_round();
        let synced = tokio::select! {
            _ = stop.changed() => return false,
            synced = self.sync.sync_to(target) => synced,
        };
        if let Err(e) = synced {
            warn!(beacon_id = %self.ctx.beacon_id, error = %e, "Catch-up sync incomplete");
        }

        let after = self.ctx.store.len();
        if after > before {
            // Synced entries are published like locally recovered ones
            if let Ok(entries) = self.ctx.store.range(before as u64, after - before) {
                for entry in entries {
                    self.publish(entry);
                }
            }
        }
        after > before
    }

    fn on_partial(&mut self, partial: PartialBeacon, tip: &BeaconEntry) {
        let round = partial.round;
        if round <= tip.round || round > self.current_round() + 1 {
            debug!(round, index = partial.index, tip = tip.round, "Partial outside window");
            return;
        }
        match self.cache.add(partial) {
            Ok(_) | Err(PartialError::Duplicate { .. }) => {}
            Err(e) => debug!(round, error = %e, "Rejected partial"),
        }
    }

    fn publish(&self, entry: BeaconEntry) {
        let round = entry.round;
        if self.ctx.events.send(entry).is_err() {
            debug!(beacon_id = %self.ctx.beacon_id, round, "No subscriber for entry");
        }
    }

    fn sign_and_broadcast(&mut self, round: u64, tip: &BeaconEntry) {
        let message = beacon_types::beacon_message(round, &tip.signature);
        let partial = PartialBeacon {
            round,
            previous_signature: tip.signature.clone(),
            index: self.ctx.share.index,
            partial_signature: sign_partial(&self.secret, &message),
        };
        debug!(beacon_id = %self.ctx.beacon_id, round, "Broadcasting partial");

        for peer in &self.peers {
            let client = self.ctx.client.clone();
            let peer = peer.clone();
            let metadata = self.metadata.clone();
            let partial = partial.clone();
            let peer_timeout = self.ctx.config.peer_timeout();
            tokio::spawn(async move {
                match timeout(peer_timeout, client.partial_beacon(&peer, metadata, partial)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(peer = %peer, round, error = %e, "Partial not delivered"),
                    Err(_) => debug!(peer = %peer, round, "Partial delivery timed out"),
                }
            });
        }

        match self.cache.add(partial) {
            Ok(_) | Err(PartialError::Duplicate { .. }) => {}
            Err(e) => error!(round, error = %e, "Own partial rejected"),
        }
    }

    /// Recover and store `round` if the threshold is met.
    fn try_commit(&mut self, round: u64, tip: &BeaconEntry) -> bool {
        if self.cache.count(round, &tip.signature) < self.cache.threshold() {
            return false;
        }
        let entry = match self.cache.recover(round, &tip.signature) {
            Ok(entry) => entry,
            Err(e) => {
                error!(beacon_id = %self.ctx.beacon_id, round, error = %e, "Recovery failed");
                return false;
            }
        };

        match self.ctx.store.put(entry.clone()) {
            Ok(()) => {
                info!(beacon_id = %self.ctx.beacon_id, round, "Beacon stored");
                self.cache.set_tip(&entry);
                self.publish(entry);
                true
            }
            Err(StoreError::AlreadyStored(_)) => true,
            Err(e) => {
                error!(beacon_id = %self.ctx.beacon_id, round, error = %e, "Cannot store beacon");
                false
            }
        }
    }
}
