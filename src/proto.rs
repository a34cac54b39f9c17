//! Messages exchanged with the signaling relay.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Relay-assigned session identifier of a participant.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Remote participant of a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantRef {
    pub id: ParticipantId,
    pub display_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Negotiated-media description produced by an offer or an answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp,
        }
    }
}

/// Messages sent from a client to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientMessage {
    #[serde(rename = "room:join", rename_all = "camelCase")]
    JoinRoom { display_name: String, room: String },

    #[serde(rename = "user:call")]
    CallUser {
        to: ParticipantId,
        offer: SessionDescription,
    },

    #[serde(rename = "call:accepted")]
    CallAccepted {
        to: ParticipantId,
        ans: SessionDescription,
    },

    #[serde(rename = "peer:nego:needed")]
    NegotiationNeeded {
        offer: SessionDescription,
        to: ParticipantId,
    },

    #[serde(rename = "peer:nego:done")]
    NegotiationDone {
        to: ParticipantId,
        ans: SessionDescription,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Messages delivered by the relay to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerMessage {
    /// Confirmation of `room:join`. `id` is the joiner's own session id.
    #[serde(rename = "room:join", rename_all = "camelCase")]
    RoomJoined {
        display_name: String,
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<ParticipantId>,
    },

    #[serde(rename = "user:joined", rename_all = "camelCase")]
    UserJoined {
        display_name: String,
        id: ParticipantId,
    },

    #[serde(rename = "incomming:call")]
    IncomingCall {
        from: ParticipantId,
        offer: SessionDescription,
    },

    #[serde(rename = "call:accepted")]
    CallAccepted {
        from: ParticipantId,
        ans: SessionDescription,
    },

    #[serde(rename = "peer:nego:needed")]
    NegotiationNeeded {
        from: ParticipantId,
        offer: SessionDescription,
    },

    #[serde(rename = "peer:nego:final")]
    NegotiationFinal { ans: SessionDescription },
}

impl ServerMessage {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RoomJoined { .. } => EventKind::RoomJoined,
            Self::UserJoined { .. } => EventKind::UserJoined,
            Self::IncomingCall { .. } => EventKind::IncomingCall,
            Self::CallAccepted { .. } => EventKind::CallAccepted,
            Self::NegotiationNeeded { .. } => EventKind::NegotiationNeeded,
            Self::NegotiationFinal { .. } => EventKind::NegotiationFinal,
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Names of the inbound events a client can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    RoomJoined,
    UserJoined,
    IncomingCall,
    CallAccepted,
    NegotiationNeeded,
    NegotiationFinal,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoomJoined => "room:join",
            Self::UserJoined => "user:joined",
            Self::IncomingCall => "incomming:call",
            Self::CallAccepted => "call:accepted",
            Self::NegotiationNeeded => "peer:nego:needed",
            Self::NegotiationFinal => "peer:nego:final",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
