//! Negotiation and signaling core of a two-party audio/video call.
//!
//! A [`RoomController`] drives one client's side of the call: it reacts to
//! relay messages received over a [`SignalingLink`], and uses a
//! [`NegotiationCoordinator`] to run offer/answer rounds on a
//! [`PeerSession`].

pub mod component;
pub mod config;
pub mod error;
pub mod proto;
pub mod relay;
pub mod signaling;
pub mod sys;
mod utils;

pub use self::{
    component::{
        CallState, NegotiationCoordinator, NegotiationState, PeerSession,
        RoomController,
    },
    config::Config,
    error::CallError,
    relay::LocalRelay,
    signaling::SignalingLink,
};
