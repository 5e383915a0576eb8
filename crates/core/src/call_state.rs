//! Intercom call lifecycle: states, events and the transition table.
//!
//! ```text
//! idle/ended  --dial-->            dialing
//! idle/ended  --invite_received--> ringing      (callee side)
//! dialing     --peer_rings-->      ringing
//! dialing     --peer_accepts-->    connecting
//! ringing     --peer_accepts-->    connecting
//! ringing     --answer-->          connecting   (callee side)
//! connecting  --media_ready-->     rtc_joining
//! rtc_joining --joined-->          connected
//! any active  --hangup/remote_hangup/error--> ending
//! ending      --teardown_done-->   ended
//! ```
//!
//! Anything else is an [`CoreError::InvalidTransition`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Dialing,
    Ringing,
    Connecting,
    RtcJoining,
    Connected,
    Ending,
    Ended,
}

pub const ALL_CALL_STATES: &[CallState] = &[
    CallState::Idle,
    CallState::Dialing,
    CallState::Ringing,
    CallState::Connecting,
    CallState::RtcJoining,
    CallState::Connected,
    CallState::Ending,
    CallState::Ended,
];

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dialing => "dialing",
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::RtcJoining => "rtc_joining",
            Self::Connected => "connected",
            Self::Ending => "ending",
            Self::Ended => "ended",
        }
    }

    /// `true` for every state that belongs to a live session.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ended)
    }

    /// A new call may only start from here.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Ended)
    }

    /// Waiting for the other side to pick up; subject to the ring timeout.
    pub fn is_ringing_phase(&self) -> bool {
        matches!(self, Self::Dialing | Self::Ringing)
    }

    /// States in which the participant set may be non-empty.
    pub fn has_media(&self) -> bool {
        matches!(self, Self::Connecting | Self::RtcJoining | Self::Connected)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEvent {
    Dial,
    InviteReceived,
    PeerRings,
    PeerAccepts,
    Answer,
    MediaReady,
    Joined,
    Hangup,
    RemoteHangup,
    Error,
    TeardownDone,
}

impl CallEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dial => "dial",
            Self::InviteReceived => "invite_received",
            Self::PeerRings => "peer_rings",
            Self::PeerAccepts => "peer_accepts",
            Self::Answer => "answer",
            Self::MediaReady => "media_ready",
            Self::Joined => "joined",
            Self::Hangup => "hangup",
            Self::RemoteHangup => "remote_hangup",
            Self::Error => "error",
            Self::TeardownDone => "teardown_done",
        }
    }
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Look up the state reached from `from` on `event`.
pub fn next_state(from: CallState, event: CallEvent) -> Result<CallState, CoreError> {
    use CallEvent as E;
    use CallState as S;

    let to = match (from, event) {
        (S::Idle | S::Ended, E::Dial) => S::Dialing,
        (S::Idle | S::Ended, E::InviteReceived) => S::Ringing,
        (S::Dialing, E::PeerRings) => S::Ringing,
        (S::Dialing | S::Ringing, E::PeerAccepts) => S::Connecting,
        (S::Ringing, E::Answer) => S::Connecting,
        (S::Connecting, E::MediaReady) => S::RtcJoining,
        (S::RtcJoining, E::Joined) => S::Connected,
        (
            S::Dialing | S::Ringing | S::Connecting | S::RtcJoining | S::Connected,
            E::Hangup | E::RemoteHangup | E::Error,
        ) => S::Ending,
        (S::Ending, E::TeardownDone) => S::Ended,
        _ => return Err(CoreError::InvalidTransition { from, event }),
    };
    Ok(to)
}

// ---------------------------------------------------------------------------
// End reasons
// ---------------------------------------------------------------------------

/// Why a session reached `ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local user hung up.
    Hangup,
    /// The peer hung up or left the media channel.
    RemoteHangup,
    /// Local user declined an incoming call.
    Declined,
    /// The peer was already in another call.
    Busy,
    /// Nobody picked up within the ring timeout.
    Timeout,
    /// Signaling or media failure.
    Error,
    /// The owning component went away with the call still live.
    Teardown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hangup => "hangup",
            Self::RemoteHangup => "remote_hangup",
            Self::Declined => "declined",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Teardown => "teardown",
        }
    }

    /// Interpret the optional reason attached to a remote `hangup` message.
    pub fn from_remote(reason: Option<&str>) -> Self {
        match reason {
            Some("busy") => Self::Busy,
            Some("timeout") => Self::Timeout,
            Some("declined") => Self::Declined,
            Some("error") => Self::Error,
            _ => Self::RemoteHangup,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn caller_happy_path() {
        let mut state = CallState::Idle;
        for event in [
            CallEvent::Dial,
            CallEvent::PeerRings,
            CallEvent::PeerAccepts,
            CallEvent::MediaReady,
            CallEvent::Joined,
        ] {
            state = next_state(state, event).unwrap();
        }
        assert_eq!(state, CallState::Connected);
    }

    #[test]
    fn callee_happy_path() {
        let state = next_state(CallState::Idle, CallEvent::InviteReceived).unwrap();
        assert_eq!(state, CallState::Ringing);
        assert_eq!(next_state(state, CallEvent::Answer).unwrap(), CallState::Connecting);
    }

    #[test]
    fn accept_may_skip_ringing() {
        assert_eq!(
            next_state(CallState::Dialing, CallEvent::PeerAccepts).unwrap(),
            CallState::Connecting
        );
    }

    #[test]
    fn every_active_state_can_hang_up() {
        for &state in ALL_CALL_STATES {
            let result = next_state(state, CallEvent::Hangup);
            if state.is_active() && state != CallState::Ending {
                assert_eq!(result.unwrap(), CallState::Ending, "from {state}");
            } else {
                assert!(result.is_err(), "hangup should be rejected from {state}");
            }
        }
    }

    #[test]
    fn ended_allows_a_new_dial() {
        assert_eq!(next_state(CallState::Ended, CallEvent::Dial).unwrap(), CallState::Dialing);
    }

    #[test]
    fn dial_while_connected_is_rejected() {
        assert_matches!(
            next_state(CallState::Connected, CallEvent::Dial),
            Err(CoreError::InvalidTransition {
                from: CallState::Connected,
                event: CallEvent::Dial
            })
        );
    }

    #[test]
    fn teardown_only_from_ending() {
        assert!(next_state(CallState::Connected, CallEvent::TeardownDone).is_err());
        assert_eq!(
            next_state(CallState::Ending, CallEvent::TeardownDone).unwrap(),
            CallState::Ended
        );
    }

    #[test]
    fn joined_requires_rtc_joining() {
        assert!(next_state(CallState::Connecting, CallEvent::Joined).is_err());
        assert!(next_state(CallState::Ringing, CallEvent::MediaReady).is_err());
    }

    #[test]
    fn remote_reason_mapping() {
        assert_eq!(EndReason::from_remote(Some("busy")), EndReason::Busy);
        assert_eq!(EndReason::from_remote(Some("timeout")), EndReason::Timeout);
        assert_eq!(EndReason::from_remote(None), EndReason::RemoteHangup);
        assert_eq!(EndReason::from_remote(Some("whatever")), EndReason::RemoteHangup);
    }

    #[test]
    fn state_names_are_snake_case() {
        assert_eq!(CallState::RtcJoining.as_str(), "rtc_joining");
        assert_eq!(
            serde_json::to_string(&CallState::RtcJoining).unwrap(),
            "\"rtc_joining\""
        );
    }
}
