//! Negotiation round bookkeeping and early-candidate buffering.
//!
//! Every suspension point of the offer/answer exchange is an explicit state
//! transition here; re-entrant signals and cancellation have defined behavior.

use std::collections::VecDeque;

use voice_signal::IceCandidate;

use crate::error::{VoiceError, VoiceResult};

/// Description flags for the current negotiation round.
///
/// Invariant: `complete_signaled` transitions false to true at most once per
/// round, and only after both descriptions are applied. A new round (initial
/// or ICE restart) resets all three flags.
#[derive(Debug, Default)]
pub struct NegotiationState {
    local_set: bool,
    remote_set: bool,
    complete_signaled: bool,
    awaiting_answer: bool,
    restarts_used: u8,
}

impl NegotiationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new offer round. At most one unanswered offer may be
    /// outstanding; an ICE restart is allowed to abandon the previous round.
    pub fn begin_offer_round(&mut self, ice_restart: bool) -> VoiceResult<()> {
        if self.awaiting_answer && !ice_restart {
            return Err(VoiceError::NegotiationFailed(
                "offer already outstanding".into(),
            ));
        }
        self.local_set = false;
        self.remote_set = false;
        self.complete_signaled = false;
        self.awaiting_answer = true;
        Ok(())
    }

    /// Open a round driven by a remote offer (this side answers).
    pub fn begin_answer_round(&mut self) {
        self.local_set = false;
        self.remote_set = false;
        self.complete_signaled = false;
        self.awaiting_answer = false;
    }

    pub fn mark_local_applied(&mut self) {
        self.local_set = true;
    }

    pub fn mark_remote_applied(&mut self) {
        self.remote_set = true;
        self.awaiting_answer = false;
    }

    pub fn local_applied(&self) -> bool {
        self.local_set
    }

    pub fn remote_applied(&self) -> bool {
        self.remote_set
    }

    pub fn awaiting_answer(&self) -> bool {
        self.awaiting_answer
    }

    /// True exactly once per round, the first time both descriptions are set.
    pub fn try_signal_complete(&mut self) -> bool {
        if self.local_set && self.remote_set && !self.complete_signaled {
            self.complete_signaled = true;
            true
        } else {
            false
        }
    }

    /// Consume one unit of the restart budget. Returns false when exhausted,
    /// at which point the failure is terminal.
    pub fn take_restart(&mut self, limit: u8) -> bool {
        if self.restarts_used >= limit {
            return false;
        }
        self.restarts_used += 1;
        true
    }

    pub fn restarts_used(&self) -> u8 {
        self.restarts_used
    }
}

/// Holds candidates that arrive before the remote description exists.
/// Drained in arrival order once the description is applied.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queued: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.queued.push_back(candidate);
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queued.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queued.clear();
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2130706431 192.0.2.{n} 54321 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn complete_signals_once_local_then_remote() {
        let mut state = NegotiationState::new();
        state.begin_offer_round(false).expect("round opens");
        state.mark_local_applied();
        assert!(!state.try_signal_complete());
        state.mark_remote_applied();
        assert!(state.try_signal_complete());
        assert!(!state.try_signal_complete());
    }

    #[test]
    fn complete_signals_once_remote_then_local() {
        let mut state = NegotiationState::new();
        state.begin_answer_round();
        state.mark_remote_applied();
        assert!(!state.try_signal_complete());
        state.mark_local_applied();
        assert!(state.try_signal_complete());
        assert!(!state.try_signal_complete());
    }

    #[test]
    fn second_offer_round_requires_answer_or_restart() {
        let mut state = NegotiationState::new();
        state.begin_offer_round(false).expect("first round");
        assert!(state.begin_offer_round(false).is_err());
        // An ICE restart may abandon the unanswered round.
        state.begin_offer_round(true).expect("restart round");
        assert!(state.awaiting_answer());
    }

    #[test]
    fn restart_resets_completion_for_the_new_round() {
        let mut state = NegotiationState::new();
        state.begin_offer_round(false).expect("round");
        state.mark_local_applied();
        state.mark_remote_applied();
        assert!(state.try_signal_complete());

        state.begin_offer_round(true).expect("restart");
        state.mark_local_applied();
        state.mark_remote_applied();
        assert!(state.try_signal_complete());
    }

    #[test]
    fn restart_budget_is_consumed_once() {
        let mut state = NegotiationState::new();
        assert!(state.take_restart(1));
        assert!(!state.take_restart(1));
        assert_eq!(state.restarts_used(), 1);
    }

    #[test]
    fn buffer_preserves_arrival_order() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate(1));
        buffer.push(candidate(2));
        buffer.push(candidate(3));
        let drained = buffer.drain();
        assert_eq!(drained, vec![candidate(1), candidate(2), candidate(3)]);
        assert!(buffer.is_empty());
    }
}
