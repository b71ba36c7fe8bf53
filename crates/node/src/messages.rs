//! Request and response types of the control, peer and public planes.

use serde::{Deserialize, Serialize};

use beacon_dkg::{DkgPacket, Phase};
use beacon_types::{ChainHash, ChainInfo, G1Point, Group, Metadata};

/// A node's announced identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub address: String,
    pub public_key: G1Point,
}

/// Invitation sent by a DKG leader to every participant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DkgInvitation {
    pub metadata: Metadata,
    pub leader_address: String,
    /// Session id shared by every bundle of the session
    pub nonce: [u8; 32],
    /// Candidate group; unkeyed, finalized from the DKG output
    pub new_group: Group,
    /// Current group when resharing
    pub old_group: Option<Group>,
    pub timeout_secs: u64,
    /// Unix time at which dealing starts
    pub start_time: u64,
}

impl DkgInvitation {
    pub fn is_reshare(&self) -> bool {
        self.old_group.is_some()
    }

    pub fn deadline(&self) -> u64 {
        self.start_time + self.timeout_secs
    }
}

/// A DKG bundle relayed between participants.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DkgPacketMessage {
    pub metadata: Metadata,
    pub packet: DkgPacket,
}

/// Range request served by peers during sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    pub metadata: Metadata,
    pub from_round: u64,
    pub limit: usize,
}

/// Leader side of a fresh DKG.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitDkgLeaderRequest {
    pub beacon_id: String,
    /// Every participant, leader included
    pub participants: Vec<Identity>,
    pub threshold: u32,
    /// Round period in seconds
    pub period: u64,
    pub timeout_secs: Option<u64>,
    /// Override of the configured genesis delay
    pub genesis_delay_secs: Option<u64>,
}

/// Leader side of a resharing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitReshareLeaderRequest {
    pub beacon_id: String,
    pub participants: Vec<Identity>,
    pub threshold: u32,
    pub timeout_secs: Option<u64>,
}

/// Follower side of a DKG or resharing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitDkgFollowerRequest {
    pub beacon_id: String,
    pub leader_address: String,
    /// Current group, for nodes joining an existing chain
    pub old_group: Option<Group>,
}

/// Lifecycle state of a beacon process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeaconStatus {
    Stopped,
    CatchingUp,
    Live,
    Dkg,
}

/// Answer to a control plane status query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub beacon_id: String,
    pub status: BeaconStatus,
    pub last_round: Option<u64>,
    pub chain_hash: Option<String>,
    pub dkg_phase: Option<Phase>,
    pub group_size: usize,
    pub threshold: u32,
}

/// Chain information together with its hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfoResponse {
    pub info: ChainInfo,
    pub hash: ChainHash,
}

impl From<ChainInfo> for ChainInfoResponse {
    fn from(info: ChainInfo) -> Self {
        let hash = info.hash();
        Self { info, hash }
    }
}
