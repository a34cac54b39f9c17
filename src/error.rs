use thiserror::Error;

use crate::sys::{GetUserMediaError, RtcError};

/// Relay cannot be reached; the message was dropped.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("signaling relay is unreachable")]
pub struct SignalingUnavailable;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("media unavailable: {0}")]
    MediaUnavailable(#[from] GetUserMediaError),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    SignalingUnavailable(#[from] SignalingUnavailable),

    #[error("no remote participant in the room")]
    NoRemoteParticipant,

    #[error("no active peer session")]
    NoSession,

    #[error("peer connection failed: {0}")]
    Rtc(RtcError),
}

impl From<RtcError> for CallError {
    fn from(err: RtcError) -> Self {
        match err {
            RtcError::InvalidState { .. } => {
                Self::InvalidState(err.to_string())
            }
            _ => Self::Rtc(err),
        }
    }
}

impl CallError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Text safe to show to an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NoRemoteParticipant => "nobody else is in the room yet",
            _ => "connection failed",
        }
    }
}
