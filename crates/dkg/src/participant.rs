//! DKG participant implementation.
//!
//! A [`DkgParticipant`] is the pure, transport-agnostic protocol state of one
//! node in one session. The caller feeds it bundles received from peers and
//! calls the phase transitions when the phase timer fires (or every expected
//! bundle has arrived).

use bls12_381::{G2Projective, Scalar};
use ff::Field;
use group::Curve;
use rand::{CryptoRng, RngCore};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use beacon_crypto::{
    decompress_g2, lagrange_coefficient, open, public_share, random_scalar, scalar_from_bytes, scalar_to_bytes, seal,
    verify_identity_signature, CryptoError,
};
use beacon_types::{DistPublic, G2Point, Node};

use crate::feldman::{
    combine_commitments, generate_commitments, generate_polynomial, share_for, verify_share,
};
use crate::types::{
    Deal, DealBundle, DistKeyShare, DkgConfig, DkgOutput, Justification, JustificationBundle, Phase,
    Response, ResponseBundle, ResponseOutcome, Status,
};

/// Errors during DKG.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DkgError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Node is not part of the session")]
    NotAParticipant,

    #[error("Old share required to deal when resharing")]
    MissingShare,

    #[error("Bundle belongs to another session")]
    WrongSession,

    #[error("Unexpected {kind} bundle in phase {phase:?}")]
    WrongPhase { kind: &'static str, phase: Phase },

    #[error("Unknown dealer {0}")]
    UnknownDealer(u32),

    #[error("Unknown holder {0}")]
    UnknownHolder(u32),

    #[error("Invalid signature on bundle from {0}")]
    InvalidSignature(u32),

    #[error("Duplicate bundle from {0}")]
    DuplicateMessage(u32),

    #[error("Invalid deal from dealer {0}")]
    InvalidDeal(u32),

    #[error("No commitments from qualified dealer {0}")]
    MissingDeal(u32),

    #[error("Not enough qualified dealers: {qualified} < {required}")]
    NotEnoughDealers { qualified: usize, required: usize },

    #[error("Not enough participants: {present} < {required}")]
    NotEnoughParticipants { present: usize, required: usize },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type DkgResult<T> = Result<T, DkgError>;

/// State of a DKG participant.
pub struct DkgParticipant {
    config: DkgConfig,
    phase: Phase,
    /// Our index among the dealers, if we deal
    dealer_index: Option<u32>,
    /// Our index among the holders, if we receive a share
    holder_index: Option<u32>,
    /// Our dealt polynomial, kept to answer complaints
    polynomial: Option<Vec<Scalar>>,
    deals: BTreeMap<u32, DealBundle>,
    /// Verified shares addressed to us, by dealer
    valid_shares: BTreeMap<u32, Scalar>,
    responses: BTreeMap<u32, ResponseBundle>,
    justifications: BTreeMap<u32, JustificationBundle>,
}

impl DkgParticipant {
    /// Create a new DKG participant.
    pub fn new(config: DkgConfig) -> DkgResult<Self> {
        let n = config.new_nodes.len();
        if config.threshold == 0 || config.threshold as usize > n {
            return Err(DkgError::InvalidConfig(format!(
                "threshold {} for {} nodes",
                config.threshold, n
            )));
        }

        let me = config.longterm.public().clone();
        let holder_index = find_index(&config.new_nodes, &me);
        let dealer_index = find_index(config.dealers(), &me);

        if let Some(params) = &config.reshare {
            if params.old_threshold == 0 || params.old_threshold as usize > params.old_nodes.len() {
                return Err(DkgError::InvalidConfig(format!(
                    "old threshold {} for {} nodes",
                    params.old_threshold,
                    params.old_nodes.len()
                )));
            }
            if params.old_public.coefficients.len() != params.old_threshold as usize {
                return Err(DkgError::InvalidConfig("old public polynomial degree".into()));
            }
            if let Some(index) = dealer_index {
                match &params.share {
                    Some(share) if share.index == index => {}
                    _ => return Err(DkgError::MissingShare),
                }
            }
        }

        if holder_index.is_none() && dealer_index.is_none() {
            return Err(DkgError::NotAParticipant);
        }

        Ok(Self {
            config,
            phase: Phase::Dealing,
            dealer_index,
            holder_index,
            polynomial: None,
            deals: BTreeMap::new(),
            valid_shares: BTreeMap::new(),
            responses: BTreeMap::new(),
            justifications: BTreeMap::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session_id(&self) -> &[u8; 32] {
        &self.config.nonce
    }

    pub fn is_dealer(&self) -> bool {
        self.dealer_index.is_some()
    }

    pub fn is_holder(&self) -> bool {
        self.holder_index.is_some()
    }

    /// Every dealer's bundle has been received.
    pub fn deals_complete(&self) -> bool {
        self.deals.len() == self.config.dealers().len()
    }

    /// Every holder's response has been received.
    pub fn responses_complete(&self) -> bool {
        self.responses.len() == self.config.new_nodes.len()
    }

    /// Every dealer with open complaints against it has answered.
    pub fn justifications_complete(&self) -> bool {
        self.disputes()
            .keys()
            .all(|dealer| self.justifications.contains_key(dealer))
    }

    /// Build our deal bundle; `None` if we do not deal.
    pub fn deal<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> DkgResult<Option<DealBundle>> {
        let Some(dealer_index) = self.dealer_index else {
            return Ok(None);
        };
        if self.polynomial.is_some() {
            return Err(DkgError::DuplicateMessage(dealer_index));
        }

        let secret = match self.config.reshare.as_ref().and_then(|p| p.share.as_ref()) {
            Some(share) => scalar_from_bytes(&share.secret)?,
            None => random_scalar(rng),
        };
        let polynomial = generate_polynomial(&secret, self.config.threshold as usize, rng);
        let commits = generate_commitments(&polynomial);

        let mut deals = Vec::with_capacity(self.config.new_nodes.len());
        for holder in &self.config.new_nodes {
            let share = share_for(&polynomial, holder.index);
            let context = deal_context(&self.config.nonce, dealer_index, holder.index);
            let encrypted_share = seal(&holder.public_key, &share.to_bytes(), &context, rng)?;
            deals.push(Deal {
                share_index: holder.index,
                encrypted_share,
            });
        }

        let mut bundle = DealBundle {
            dealer_index,
            commits,
            deals,
            session_id: self.config.nonce,
            signature: Default::default(),
        };
        bundle.signature = self.config.longterm.sign(&bundle.hash());

        self.polynomial = Some(polynomial);
        self.process_deal(bundle.clone())?;
        info!(dealer = dealer_index, "Deal bundle created");
        Ok(Some(bundle))
    }

    /// Process a deal bundle from a dealer.
    ///
    /// Structurally invalid bundles are rejected. A bundle whose share for us
    /// does not verify is kept; we complain about it in our response.
    pub fn process_deal(&mut self, bundle: DealBundle) -> DkgResult<()> {
        self.expect_phase("deal", &[Phase::Dealing, Phase::Justifying])?;
        if bundle.session_id != self.config.nonce {
            return Err(DkgError::WrongSession);
        }
        let dealer = bundle.dealer_index;
        let node = self
            .config
            .dealers()
            .iter()
            .find(|n| n.index == dealer)
            .ok_or(DkgError::UnknownDealer(dealer))?;
        if self.deals.contains_key(&dealer) {
            return Err(DkgError::DuplicateMessage(dealer));
        }
        verify_identity_signature(&node.public_key, &bundle.hash(), &bundle.signature)
            .map_err(|_| DkgError::InvalidSignature(dealer))?;
        self.check_commits(dealer, &bundle.commits)?;

        if let Some(holder) = self.holder_index {
            match self.open_deal(&bundle, holder) {
                Ok(share) => {
                    self.valid_shares.insert(dealer, share);
                }
                Err(e) => warn!(dealer, holder, error = %e, "Invalid share in deal"),
            }
        }

        debug!(dealer, "Deal bundle accepted");
        self.deals.insert(dealer, bundle);
        Ok(())
    }

    fn check_commits(&self, dealer: u32, commits: &[G2Point]) -> DkgResult<()> {
        if commits.len() != self.config.threshold as usize {
            warn!(dealer, commits = commits.len(), "Deal with wrong polynomial degree");
            return Err(DkgError::InvalidDeal(dealer));
        }
        if let Some(params) = &self.config.reshare {
            // The dealt secret must be the dealer's current share
            let expected = public_share(&params.old_public.coefficients, dealer)?;
            let dealt = decompress_g2(&commits[0])?;
            if expected != dealt {
                warn!(dealer, "Reshare deal does not commit to the dealer's share");
                return Err(DkgError::InvalidDeal(dealer));
            }
        }
        Ok(())
    }

    /// Commitments of `dealer`, from its deal or else its justification.
    fn commits_of(&self, dealer: u32) -> Option<&[G2Point]> {
        self.deals
            .get(&dealer)
            .map(|b| b.commits.as_slice())
            .or_else(|| self.justifications.get(&dealer).map(|b| b.commits.as_slice()))
    }

    fn open_deal(&self, bundle: &DealBundle, holder: u32) -> DkgResult<Scalar> {
        let dealer = bundle.dealer_index;
        let deal = bundle
            .deals
            .iter()
            .find(|d| d.share_index == holder)
            .ok_or(DkgError::InvalidDeal(dealer))?;
        let context = deal_context(&self.config.nonce, dealer, holder);
        let plaintext = open(self.config.longterm.secret(), &deal.encrypted_share, &context)?;
        let bytes: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| DkgError::InvalidDeal(dealer))?;
        let share = scalar_from_bytes(&beacon_types::Scalar(bytes))?;
        if verify_share(&share, holder, &bundle.commits) {
            Ok(share)
        } else {
            Err(DkgError::InvalidDeal(dealer))
        }
    }

    /// Build our response bundle; `None` if we do not hold a share.
    pub fn respond(&mut self) -> DkgResult<Option<ResponseBundle>> {
        let Some(share_index) = self.holder_index else {
            return Ok(None);
        };
        if self.responses.contains_key(&share_index) {
            return Err(DkgError::DuplicateMessage(share_index));
        }

        let responses = self
            .config
            .dealers()
            .iter()
            .map(|dealer| Response {
                dealer_index: dealer.index,
                status: if self.valid_shares.contains_key(&dealer.index) {
                    Status::Success
                } else {
                    Status::Complaint
                },
            })
            .collect();

        let mut bundle = ResponseBundle {
            share_index,
            responses,
            session_id: self.config.nonce,
            signature: Default::default(),
        };
        bundle.signature = self.config.longterm.sign(&bundle.hash());
        self.process_response(bundle.clone())?;
        Ok(Some(bundle))
    }

    /// Process a response bundle from a holder.
    pub fn process_response(&mut self, bundle: ResponseBundle) -> DkgResult<()> {
        self.expect_phase("response", &[Phase::Dealing])?;
        if bundle.session_id != self.config.nonce {
            return Err(DkgError::WrongSession);
        }
        let holder = bundle.share_index;
        let node = self
            .config
            .new_nodes
            .iter()
            .find(|n| n.index == holder)
            .ok_or(DkgError::UnknownHolder(holder))?;
        if self.responses.contains_key(&holder) {
            return Err(DkgError::DuplicateMessage(holder));
        }
        verify_identity_signature(&node.public_key, &bundle.hash(), &bundle.signature)
            .map_err(|_| DkgError::InvalidSignature(holder))?;

        for dealer in bundle.complaints() {
            debug!(holder, dealer, "Complaint received");
        }
        self.responses.insert(holder, bundle);
        Ok(())
    }

    /// Holders complaining about each dealer, by dealer.
    ///
    /// Derived from the signed responses only, so every node holding the same
    /// responses reaches the same verdicts whatever deals it received.
    fn complaints(&self) -> BTreeMap<u32, BTreeSet<u32>> {
        let mut complaints = BTreeMap::new();
        for dealer in self.config.dealers() {
            let holders: BTreeSet<u32> = self
                .responses
                .iter()
                .filter(|(_, bundle)| !bundle.approves(dealer.index))
                .map(|(holder, _)| *holder)
                .collect();
            if !holders.is_empty() {
                complaints.insert(dealer.index, holders);
            }
        }
        complaints
    }

    /// Complaints the accused dealer may still answer.
    fn disputes(&self) -> BTreeMap<u32, BTreeSet<u32>> {
        let present = self.responses.len();
        self.complaints()
            .into_iter()
            .filter(|(_, holders)| holders.len() < present)
            .collect()
    }

    /// Dealers every responding holder complained about.
    fn rejected(&self) -> BTreeSet<u32> {
        let present = self.responses.len();
        self.complaints()
            .into_iter()
            .filter(|(_, holders)| holders.len() == present)
            .map(|(dealer, _)| dealer)
            .collect()
    }

    /// Close the dealing phase.
    ///
    /// Finishes immediately when no dealer has open complaints, otherwise
    /// moves to the justification phase.
    pub fn finish_dealing(&mut self) -> DkgResult<ResponseOutcome> {
        self.expect_phase("finish", &[Phase::Dealing])?;
        let disputes = self.disputes();
        if disputes.is_empty() {
            let rejected = self.rejected();
            let output = self.finalize(&rejected)?;
            return Ok(ResponseOutcome::Finished(output));
        }
        self.phase = Phase::Justifying;
        info!(disputed = disputes.len(), "Entering justification phase");
        Ok(ResponseOutcome::NeedJustification)
    }

    /// Build our justification bundle; `None` if nobody complained about us.
    pub fn justify(&mut self) -> DkgResult<Option<JustificationBundle>> {
        let (Some(dealer_index), Some(polynomial)) = (self.dealer_index, self.polynomial.as_ref()) else {
            return Ok(None);
        };
        let Some(holders) = self.disputes().remove(&dealer_index) else {
            return Ok(None);
        };
        let commits = generate_commitments(polynomial);

        let justifications = holders
            .into_iter()
            .map(|holder| Justification {
                share_index: holder,
                share: scalar_to_bytes(&share_for(polynomial, holder)),
            })
            .collect();
        let mut bundle = JustificationBundle {
            dealer_index,
            commits,
            justifications,
            session_id: self.config.nonce,
            signature: Default::default(),
        };
        bundle.signature = self.config.longterm.sign(&bundle.hash());
        self.process_justification(bundle.clone())?;
        Ok(Some(bundle))
    }

    /// Process a justification bundle from a dealer.
    pub fn process_justification(&mut self, bundle: JustificationBundle) -> DkgResult<()> {
        self.expect_phase("justification", &[Phase::Justifying])?;
        if bundle.session_id != self.config.nonce {
            return Err(DkgError::WrongSession);
        }
        let dealer = bundle.dealer_index;
        let node = self
            .config
            .dealers()
            .iter()
            .find(|n| n.index == dealer)
            .ok_or(DkgError::UnknownDealer(dealer))?;
        if self.justifications.contains_key(&dealer) {
            return Err(DkgError::DuplicateMessage(dealer));
        }
        verify_identity_signature(&node.public_key, &bundle.hash(), &bundle.signature)
            .map_err(|_| DkgError::InvalidSignature(dealer))?;
        self.check_commits(dealer, &bundle.commits)?;
        if let Some(deal) = self.deals.get(&dealer) {
            if deal.commits != bundle.commits {
                warn!(dealer, "Justification commits to another polynomial than the deal");
                return Err(DkgError::InvalidDeal(dealer));
            }
        }

        self.justifications.insert(dealer, bundle);
        Ok(())
    }

    /// Close the justification phase and compute the output.
    pub fn finish_justification(&mut self) -> DkgResult<DkgOutput> {
        self.expect_phase("finish", &[Phase::Justifying])?;

        let mut disqualified = self.rejected();
        for (dealer, holders) in self.disputes() {
            let Some(bundle) = self.justifications.get(&dealer) else {
                warn!(dealer, "Complaints left unanswered, dealer disqualified");
                disqualified.insert(dealer);
                continue;
            };
            let commits = bundle.commits.clone();
            let revealed: BTreeMap<u32, Scalar> = bundle
                .justifications
                .iter()
                .filter_map(|j| scalar_from_bytes(&j.share).ok().map(|s| (j.share_index, s)))
                .collect();

            let resolved = holders.iter().all(|holder| {
                revealed
                    .get(holder)
                    .map(|share| verify_share(share, *holder, &commits))
                    .unwrap_or(false)
            });
            if !resolved {
                warn!(dealer, "Unresolved complaints, dealer disqualified");
                disqualified.insert(dealer);
                continue;
            }
            if let Some(holder) = self.holder_index {
                if let Some(share) = revealed.get(&holder) {
                    self.valid_shares.insert(dealer, *share);
                }
            }
        }

        self.finalize(&disqualified)
    }

    fn finalize(&mut self, disqualified: &BTreeSet<u32>) -> DkgResult<DkgOutput> {
        let result = self.compute_output(disqualified);
        self.phase = if result.is_ok() {
            Phase::Finished
        } else {
            Phase::Aborted
        };
        result
    }

    fn compute_output(&self, disqualified: &BTreeSet<u32>) -> DkgResult<DkgOutput> {
        let qualified: Vec<u32> = self
            .config
            .dealers()
            .iter()
            .map(|n| n.index)
            .filter(|dealer| !disqualified.contains(dealer))
            .collect::<BTreeSet<u32>>()
            .into_iter()
            .collect();
        let required = self.config.dealer_threshold() as usize;
        if qualified.len() < required {
            return Err(DkgError::NotEnoughDealers {
                qualified: qualified.len(),
                required,
            });
        }

        let present_holders: Vec<u32> = self.responses.keys().copied().collect();
        let threshold = self.config.threshold as usize;
        if present_holders.len() < threshold {
            return Err(DkgError::NotEnoughParticipants {
                present: present_holders.len(),
                required: threshold,
            });
        }

        // Fresh keys sum every qualified contribution; resharing interpolates
        // the first `old_threshold` of them at zero.
        let contributors: Vec<(u32, Scalar)> = match &self.config.reshare {
            None => qualified.iter().map(|d| (*d, Scalar::ONE)).collect(),
            Some(_) => {
                let used = &qualified[..required];
                used.iter()
                    .map(|d| lagrange_coefficient(*d, used).map(|l| (*d, l)))
                    .collect::<Result<_, CryptoError>>()?
            }
        };

        let polys: Vec<(&[G2Point], Scalar)> = contributors
            .iter()
            .map(|(d, w)| {
                self.commits_of(*d)
                    .map(|commits| (commits, *w))
                    .ok_or(DkgError::MissingDeal(*d))
            })
            .collect::<DkgResult<_>>()?;
        let commitments = combine_commitments(&polys, threshold)?;

        let share = match self.holder_index {
            Some(index) if present_holders.contains(&index) => {
                let mut secret = Scalar::ZERO;
                for (dealer, weight) in &contributors {
                    let share = self
                        .valid_shares
                        .get(dealer)
                        .ok_or(DkgError::InvalidDeal(*dealer))?;
                    secret += share * weight;
                }
                let expected = public_share(&commitments, index)?;
                if (G2Projective::generator() * secret).to_affine() != expected {
                    return Err(DkgError::InvalidDeal(index));
                }
                Some(DistKeyShare {
                    index,
                    secret: scalar_to_bytes(&secret),
                    commitments: commitments.clone(),
                })
            }
            _ => None,
        };

        info!(
            qualified = qualified.len(),
            holders = present_holders.len(),
            "DKG finished"
        );
        Ok(DkgOutput {
            share,
            public: DistPublic {
                coefficients: commitments,
            },
            qualified,
            present_holders,
        })
    }

    /// Mark the session aborted; later bundles are rejected.
    pub fn abort(&mut self) {
        self.phase = Phase::Aborted;
    }

    fn expect_phase(&self, kind: &'static str, allowed: &[Phase]) -> DkgResult<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(DkgError::WrongPhase {
                kind,
                phase: self.phase,
            })
        }
    }
}

fn find_index(nodes: &[Node], key: &beacon_types::G1Point) -> Option<u32> {
    nodes.iter().find(|n| &n.public_key == key).map(|n| n.index)
}

fn deal_context(session_id: &[u8; 32], dealer: u32, holder: u32) -> Vec<u8> {
    let mut context = b"beacon-dkg-deal".to_vec();
    context.extend_from_slice(session_id);
    context.extend_from_slice(&dealer.to_be_bytes());
    context.extend_from_slice(&holder.to_be_bytes());
    context
}
