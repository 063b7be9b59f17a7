//! Perfect-negotiation decision core
//!
//! Both sides of a pair may send an offer at any time. Convergence under
//! glare is decided by a fixed tiebreak: the peer whose id compares higher
//! as raw bytes is *polite* and yields to the remote offer; the other side
//! is *impolite* and ignores incoming offers while its own is in flight.
//! This module is pure state; the manager applies its verdicts to the live
//! peer connection.

use crate::protocol::IceCandidateData;

/// Negotiation role for one (local, remote) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Polite,
    Impolite,
}

/// Total order on peer ids as raw bytes; the higher id is polite.
pub fn role_for(local_id: &str, remote_id: &str) -> Role {
    if local_id.as_bytes() > remote_id.as_bytes() {
        Role::Polite
    } else {
        Role::Impolite
    }
}

/// What to do with an incoming offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferAction {
    /// Apply the remote offer and answer it
    Answer,
    /// Collision, impolite side: drop the remote offer
    Ignore,
    /// Collision, polite side: discard the local offer, then answer
    RollbackAndAnswer,
}

/// Per-link negotiation state.
#[derive(Debug)]
pub struct NegotiationState {
    role: Role,
    making_offer: bool,
    remote_description_set: bool,
    buffered_candidates: Vec<IceCandidateData>,
}

impl NegotiationState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            making_offer: false,
            remote_description_set: false,
            buffered_candidates: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Start a local offer. Returns false when one is already in flight or
    /// a remote session is already being set up.
    pub fn begin_offer(&mut self) -> bool {
        if self.making_offer || self.remote_description_set {
            return false;
        }
        self.making_offer = true;
        true
    }

    /// Verdict for an incoming remote offer.
    pub fn on_remote_offer(&mut self) -> OfferAction {
        if !self.making_offer {
            self.remote_description_set = true;
            return OfferAction::Answer;
        }
        match self.role {
            Role::Impolite => OfferAction::Ignore,
            Role::Polite => {
                self.making_offer = false;
                self.remote_description_set = true;
                OfferAction::RollbackAndAnswer
            }
        }
    }

    /// An answer to our offer arrived. Returns false for stray answers.
    pub fn on_remote_answer(&mut self) -> bool {
        if !self.making_offer {
            return false;
        }
        self.making_offer = false;
        self.remote_description_set = true;
        true
    }

    /// Candidate routing: returns the candidate when the remote description
    /// is already set, otherwise buffers it for [`Self::drain_candidates`].
    pub fn on_remote_candidate(&mut self, candidate: IceCandidateData) -> Option<IceCandidateData> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.buffered_candidates.push(candidate);
            None
        }
    }

    /// Candidates buffered before the remote description landed.
    pub fn drain_candidates(&mut self) -> Vec<IceCandidateData> {
        std::mem::take(&mut self.buffered_candidates)
    }

    /// Forget the session; used when the link restarts negotiation.
    pub fn reset(&mut self) {
        self.making_offer = false;
        self.remote_description_set = false;
        self.buffered_candidates.clear();
    }
}
