//! DKG type definitions.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use beacon_crypto::{Ciphertext, IdentityKey};
use beacon_types::{DistPublic, G2Point, Node, Scalar};

/// Protocol phase of a DKG or resharing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Dealing,
    Justifying,
    Finished,
    Aborted,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Finished | Phase::Aborted)
    }
}

/// Parameters of a resharing run.
#[derive(Debug, Clone)]
pub struct ReshareParams {
    /// Nodes holding the current shares; these are the dealers
    pub old_nodes: Vec<Node>,
    pub old_threshold: u32,
    /// Current public polynomial
    pub old_public: DistPublic,
    /// Our current share, if we belong to the old group
    pub share: Option<DistKeyShare>,
}

/// DKG configuration.
#[derive(Debug, Clone)]
pub struct DkgConfig {
    /// Our long-term identity key
    pub longterm: IdentityKey,
    /// Nodes receiving a share of the new key
    pub new_nodes: Vec<Node>,
    /// Threshold of the new key
    pub threshold: u32,
    /// Session nonce chosen by the leader
    pub nonce: [u8; 32],
    /// Set when resharing an existing key
    pub reshare: Option<ReshareParams>,
}

impl DkgConfig {
    pub fn fresh(longterm: IdentityKey, new_nodes: Vec<Node>, threshold: u32, nonce: [u8; 32]) -> Self {
        Self {
            longterm,
            new_nodes,
            threshold,
            nonce,
            reshare: None,
        }
    }

    pub fn with_reshare(mut self, params: ReshareParams) -> Self {
        self.reshare = Some(params);
        self
    }

    /// Nodes dealing a contribution: the old group when resharing, else the new one.
    pub fn dealers(&self) -> &[Node] {
        match &self.reshare {
            Some(params) => &params.old_nodes,
            None => &self.new_nodes,
        }
    }

    /// Number of qualified dealers needed to finish.
    pub fn dealer_threshold(&self) -> u32 {
        match &self.reshare {
            Some(params) => params.old_threshold,
            None => self.threshold,
        }
    }
}

/// A node's share of the distributed key. Never transmitted.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct DistKeyShare {
    /// Holder index in the group
    pub index: u32,
    pub secret: Scalar,
    /// Public polynomial of the group key
    pub commitments: Vec<G2Point>,
}

impl DistKeyShare {
    pub fn public(&self) -> DistPublic {
        DistPublic {
            coefficients: self.commitments.clone(),
        }
    }
}

/// A share sealed for one holder.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Deal {
    pub share_index: u32,
    pub encrypted_share: Ciphertext,
}

/// A dealer's commitments and sealed shares.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct DealBundle {
    pub dealer_index: u32,
    /// Feldman commitments of the dealer polynomial
    pub commits: Vec<G2Point>,
    pub deals: Vec<Deal>,
    pub session_id: [u8; 32],
    pub signature: G2Point,
}

impl DealBundle {
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"deal");
        hasher.update(self.dealer_index.to_be_bytes());
        for commit in &self.commits {
            hasher.update(commit.0);
        }
        for deal in &self.deals {
            hasher.update(deal.share_index.to_be_bytes());
            hasher.update(deal.encrypted_share.ephemeral.0);
            hasher.update(deal.encrypted_share.nonce);
            hasher.update(&deal.encrypted_share.payload);
        }
        hasher.update(self.session_id);
        hasher.finalize().into()
    }
}

/// Outcome of one dealer's deal as seen by a holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum Status {
    Success,
    Complaint,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Response {
    pub dealer_index: u32,
    pub status: Status,
}

/// A holder's verdict on every deal it expected.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ResponseBundle {
    pub share_index: u32,
    pub responses: Vec<Response>,
    pub session_id: [u8; 32],
    pub signature: G2Point,
}

impl ResponseBundle {
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"response");
        hasher.update(self.share_index.to_be_bytes());
        for response in &self.responses {
            hasher.update(response.dealer_index.to_be_bytes());
            hasher.update([matches!(response.status, Status::Success) as u8]);
        }
        hasher.update(self.session_id);
        hasher.finalize().into()
    }

    pub fn complaints(&self) -> impl Iterator<Item = u32> + '_ {
        self.responses
            .iter()
            .filter(|r| r.status == Status::Complaint)
            .map(|r| r.dealer_index)
    }

    /// Whether the holder accepted `dealer`'s deal. A dealer left out of the
    /// bundle counts as a complaint.
    pub fn approves(&self, dealer: u32) -> bool {
        self.responses
            .iter()
            .any(|r| r.dealer_index == dealer && r.status == Status::Success)
    }
}

/// Plaintext share revealed in answer to a complaint.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Justification {
    pub share_index: u32,
    pub share: Scalar,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct JustificationBundle {
    pub dealer_index: u32,
    /// Commitments of the dealt polynomial, for holders that missed the deal
    pub commits: Vec<G2Point>,
    pub justifications: Vec<Justification>,
    pub session_id: [u8; 32],
    pub signature: G2Point,
}

impl JustificationBundle {
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"justification");
        hasher.update(self.dealer_index.to_be_bytes());
        for commit in &self.commits {
            hasher.update(commit.0);
        }
        for justification in &self.justifications {
            hasher.update(justification.share_index.to_be_bytes());
            hasher.update(justification.share.0);
        }
        hasher.update(self.session_id);
        hasher.finalize().into()
    }
}

/// Any message exchanged during a session.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum DkgPacket {
    Deal(DealBundle),
    Response(ResponseBundle),
    Justification(JustificationBundle),
}

impl DkgPacket {
    pub fn session_id(&self) -> &[u8; 32] {
        match self {
            DkgPacket::Deal(b) => &b.session_id,
            DkgPacket::Response(b) => &b.session_id,
            DkgPacket::Justification(b) => &b.session_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DkgPacket::Deal(_) => "deal",
            DkgPacket::Response(_) => "response",
            DkgPacket::Justification(_) => "justification",
        }
    }
}

/// Result of a completed session.
#[derive(Debug, Clone)]
pub struct DkgOutput {
    /// Our new share; `None` for dealers leaving the group
    pub share: Option<DistKeyShare>,
    /// Public polynomial of the (new or preserved) key
    pub public: DistPublic,
    /// Dealers whose contribution was accepted
    pub qualified: Vec<u32>,
    /// Holders that took part; the new group is restricted to them
    pub present_holders: Vec<u32>,
}

/// What a holder does after the response phase.
#[derive(Debug, Clone)]
pub enum ResponseOutcome {
    Finished(DkgOutput),
    NeedJustification,
}
