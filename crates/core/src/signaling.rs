//! Point-to-point signaling protocol between two intercom participants.
//!
//! Messages are serialized as JSON with an internally-tagged `"type"`
//! discriminator (`invite`, `ring`, `accept`, `hangup`, `mute-changed`,
//! `speaker-changed`, `media-ready`, `joined`). Transport ordering is not
//! guaranteed and delivery is at-least-once, so every message carries the
//! call id it refers to.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::EntityId;

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Resident,
    Doorman,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Participant {
    pub id: EntityId,
    pub role: ParticipantRole,
}

impl Participant {
    pub fn resident(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            role: ParticipantRole::Resident,
        }
    }

    pub fn doorman(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            role: ParticipantRole::Doorman,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Caller asks the target to start ringing.
    Invite { call_id: Uuid, from: Participant },

    /// Callee is ringing.
    Ring { call_id: Uuid },

    /// Callee picked up.
    Accept { call_id: Uuid },

    /// Either side ends the call.
    Hangup {
        call_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    MuteChanged { call_id: Uuid, muted: bool },

    SpeakerChanged { call_id: Uuid, speaker_on: bool },

    /// Sender's media layer is ready and joining the channel.
    MediaReady { call_id: Uuid },

    /// Sender joined the media channel.
    Joined {
        call_id: Uuid,
        participant: Participant,
    },
}

impl SignalMessage {
    pub fn call_id(&self) -> Uuid {
        match self {
            Self::Invite { call_id, .. }
            | Self::Ring { call_id }
            | Self::Accept { call_id }
            | Self::Hangup { call_id, .. }
            | Self::MuteChanged { call_id, .. }
            | Self::SpeakerChanged { call_id, .. }
            | Self::MediaReady { call_id }
            | Self::Joined { call_id, .. } => *call_id,
        }
    }

    /// Wire name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invite { .. } => "invite",
            Self::Ring { .. } => "ring",
            Self::Accept { .. } => "accept",
            Self::Hangup { .. } => "hangup",
            Self::MuteChanged { .. } => "mute-changed",
            Self::SpeakerChanged { .. } => "speaker-changed",
            Self::MediaReady { .. } => "media-ready",
            Self::Joined { .. } => "joined",
        }
    }
}

/// A message together with its addressing, as carried by a signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: EntityId,
    pub to: EntityId,
    pub message: SignalMessage,
}
