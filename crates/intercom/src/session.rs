//! One intercom call attempt and its observable snapshot.

use std::collections::BTreeSet;

use chrono::Utc;
use porteiro_core::call_state::{next_state, CallEvent, CallState, EndReason};
use porteiro_core::error::CoreError;
use porteiro_core::signaling::Participant;
use porteiro_core::types::Timestamp;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    /// This device dialed.
    Outgoing,
    /// This device was invited.
    Incoming,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: Uuid,
    pub direction: CallDirection,
    /// The other side of the call.
    pub peer: Participant,
    pub state: CallState,
    /// Joined media participants. Empty outside connecting/rtc_joining/connected.
    pub participants: BTreeSet<Participant>,
    pub is_muted: bool,
    pub is_speaker_on: bool,
    pub remote_muted: bool,
    pub remote_speaker_on: bool,
    pub error: Option<String>,
    pub end_reason: Option<EndReason>,
    pub started_at: Timestamp,
}

impl CallSession {
    fn new(call_id: Uuid, direction: CallDirection, peer: Participant, state: CallState) -> Self {
        Self {
            call_id,
            direction,
            peer,
            state,
            participants: BTreeSet::new(),
            is_muted: false,
            is_speaker_on: false,
            remote_muted: false,
            remote_speaker_on: false,
            error: None,
            end_reason: None,
            started_at: Utc::now(),
        }
    }

    /// A session this device dialed, in `dialing`.
    pub fn outgoing(call_id: Uuid, peer: Participant) -> Self {
        Self::new(call_id, CallDirection::Outgoing, peer, CallState::Dialing)
    }

    /// A session created by a received invite, in `ringing`.
    pub fn incoming(call_id: Uuid, peer: Participant) -> Self {
        Self::new(call_id, CallDirection::Incoming, peer, CallState::Ringing)
    }

    /// Apply `event`, leaving the state untouched when it is not allowed.
    pub fn apply(&mut self, event: CallEvent) -> Result<CallState, CoreError> {
        let next = next_state(self.state, event)?;
        self.state = next;
        if next == CallState::Ending {
            self.participants.clear();
        }
        Ok(next)
    }

    /// Complete teardown: `ending -> ended`, then reset local media state.
    pub fn finish(&mut self, reason: EndReason) -> Result<(), CoreError> {
        self.apply(CallEvent::TeardownDone)?;
        self.end_reason = Some(reason);
        self.participants.clear();
        self.is_muted = false;
        self.is_speaker_on = false;
        self.remote_muted = false;
        self.remote_speaker_on = false;
        Ok(())
    }

    /// Returns `false` when the session has no media phase yet (or any more).
    pub fn add_participant(&mut self, participant: Participant) -> bool {
        if !self.state.has_media() {
            return false;
        }
        self.participants.insert(participant)
    }

    pub fn remove_participant(&mut self, participant_id: &str) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p.id != participant_id);
        self.participants.len() != before
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.state,
            call_id: Some(self.call_id),
            direction: Some(self.direction),
            peer: Some(self.peer.clone()),
            participants: self.participants.iter().cloned().collect(),
            is_muted: self.is_muted,
            is_speaker_on: self.is_speaker_on,
            remote_muted: self.remote_muted,
            remote_speaker_on: self.remote_speaker_on,
            error: self.error.clone(),
            end_reason: self.end_reason,
        }
    }
}

/// Point-in-time view of the coordinator, published after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub call_id: Option<Uuid>,
    pub direction: Option<CallDirection>,
    pub peer: Option<Participant>,
    pub participants: Vec<Participant>,
    pub is_muted: bool,
    pub is_speaker_on: bool,
    pub remote_muted: bool,
    pub remote_speaker_on: bool,
    pub error: Option<String>,
    pub end_reason: Option<EndReason>,
}

impl CallSnapshot {
    pub fn idle() -> Self {
        Self {
            state: CallState::Idle,
            call_id: None,
            direction: None,
            peer: None,
            participants: Vec::new(),
            is_muted: false,
            is_speaker_on: false,
            remote_muted: false,
            remote_speaker_on: false,
            error: None,
            end_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn connected() -> CallSession {
        let mut session = CallSession::outgoing(Uuid::new_v4(), Participant::resident("r1"));
        for event in [CallEvent::PeerAccepts, CallEvent::MediaReady, CallEvent::Joined] {
            session.apply(event).unwrap();
        }
        session
    }

    #[test]
    fn participants_only_join_during_media_phase() {
        let mut session = CallSession::outgoing(Uuid::new_v4(), Participant::resident("r1"));
        assert!(!session.add_participant(Participant::doorman("d1")));
        assert!(session.participants.is_empty());

        let mut session = connected();
        assert!(session.add_participant(Participant::doorman("d1")));
        assert!(session.add_participant(Participant::resident("r1")));
        assert!(!session.add_participant(Participant::resident("r1")));
        assert_eq!(session.participants.len(), 2);
    }

    #[test]
    fn entering_ending_clears_participants() {
        let mut session = connected();
        session.add_participant(Participant::doorman("d1"));

        assert_eq!(session.apply(CallEvent::Hangup).unwrap(), CallState::Ending);
        assert!(session.participants.is_empty());
    }

    #[test]
    fn finish_resets_local_flags() {
        let mut session = connected();
        session.is_muted = true;
        session.is_speaker_on = true;
        session.remote_muted = true;

        session.apply(CallEvent::RemoteHangup).unwrap();
        session.finish(EndReason::RemoteHangup).unwrap();

        assert_eq!(session.state, CallState::Ended);
        assert_eq!(session.end_reason, Some(EndReason::RemoteHangup));
        assert!(!session.is_muted && !session.is_speaker_on && !session.remote_muted);
    }

    #[test]
    fn invalid_event_keeps_state() {
        let mut session = CallSession::incoming(Uuid::new_v4(), Participant::doorman("d1"));
        assert_matches!(session.apply(CallEvent::Joined), Err(CoreError::InvalidTransition { .. }));
        assert_eq!(session.state, CallState::Ringing);
        assert!(session.finish(EndReason::Hangup).is_err(), "finish requires ending");
    }

    #[test]
    fn remove_participant_by_id() {
        let mut session = connected();
        session.add_participant(Participant::doorman("d1"));
        assert!(session.remove_participant("d1"));
        assert!(!session.remove_participant("d1"));
    }

    #[test]
    fn idle_snapshot_is_empty() {
        let snapshot = CallSnapshot::idle();
        assert_eq!(snapshot.state, CallState::Idle);
        assert!(snapshot.call_id.is_none() && snapshot.participants.is_empty());
    }
}
