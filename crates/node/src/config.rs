//! Node configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::clock::Clock;

/// Default number of peers tried before a sync gives up.
pub const DEFAULT_SYNC_MAX_ATTEMPTS: usize = 3;

/// Default maximum number of entries served per sync batch.
pub const DEFAULT_SYNC_BATCH_SIZE: usize = 300;

/// Lower bound on the spacing of catch-up rounds.
pub const MIN_CATCHUP_PERIOD: Duration = Duration::from_millis(100);

/// Configuration shared by every beacon process of a daemon.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Peer plane address; also the address announced in groups
    pub private_listen: String,
    /// Control plane address
    pub control_listen: String,
    /// Public API address, if served
    pub public_listen: Option<String>,
    /// Root folder of key, group and chain material
    pub data_folder: PathBuf,
    /// Timeout applied to every peer call
    pub peer_timeout_ms: u64,
    /// Default DKG timeout when a request does not set one
    pub dkg_timeout_secs: u64,
    /// Delay between a leader's DKG request and the protocol start
    pub dkg_start_offset_secs: u64,
    /// Delay between the DKG deadline and the genesis of a new chain
    pub genesis_delay_secs: u64,
    pub sync_max_attempts: usize,
    pub sync_batch_size: usize,
    /// Spacing of back-to-back catch-up rounds; half the period if unset
    pub catchup_period_ms: Option<u64>,
    /// Number of rounds the partial cache tracks at once
    pub partial_cache_rounds: usize,
    #[serde(skip)]
    pub clock: Clock,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_listen: "127.0.0.1:4444".to_string(),
            control_listen: "127.0.0.1:8888".to_string(),
            public_listen: None,
            data_folder: PathBuf::from(".beacon"),
            peer_timeout_ms: 5_000,
            dkg_timeout_secs: 30,
            dkg_start_offset_secs: 2,
            genesis_delay_secs: 10,
            sync_max_attempts: DEFAULT_SYNC_MAX_ATTEMPTS,
            sync_batch_size: DEFAULT_SYNC_BATCH_SIZE,
            catchup_period_ms: None,
            partial_cache_rounds: 16,
            clock: Clock::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(private_listen: impl Into<String>) -> Self {
        Self {
            private_listen: private_listen.into(),
            ..Default::default()
        }
    }

    pub fn with_control_listen(mut self, addr: impl Into<String>) -> Self {
        self.control_listen = addr.into();
        self
    }

    pub fn with_public_listen(mut self, addr: impl Into<String>) -> Self {
        self.public_listen = Some(addr.into());
        self
    }

    pub fn with_data_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.data_folder = folder.into();
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_dkg_timeout(mut self, secs: u64) -> Self {
        self.dkg_timeout_secs = secs;
        self
    }

    pub fn with_sync(mut self, max_attempts: usize, batch_size: usize) -> Self {
        self.sync_max_attempts = max_attempts.max(1);
        self.sync_batch_size = batch_size.max(1);
        self
    }

    pub fn with_catchup_period(mut self, period: Duration) -> Self {
        self.catchup_period_ms = Some(period.as_millis() as u64);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// Catch-up spacing for a chain with the given period (seconds).
    pub fn catchup_period(&self, period: u64) -> Duration {
        let period = match self.catchup_period_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(period) / 2,
        };
        period.max(MIN_CATCHUP_PERIOD)
    }
}
