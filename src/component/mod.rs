//! Call components, from the media leaves up to the room.

pub mod media;
mod negotiation;
mod peer;
mod room;

pub use self::{
    negotiation::{NegotiationCoordinator, NegotiationState},
    peer::{PeerEvent, PeerSession, Role},
    room::{CallState, RoomController},
};
