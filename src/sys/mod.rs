//! Platform media capabilities: capture devices, tracks and the peer
//! connection primitive.

mod media_devices;
mod media_stream_track;
mod rtc_peer_connection;

pub use self::{
    media_devices::{GetUserMediaError, MediaDevices, MediaStreamConstraints},
    media_stream_track::{MediaKind, MediaStream, MediaStreamTrack},
    rtc_peer_connection::{
        RtcError, RtcPeerConnection, RtcPeerEvent, SignalingState,
    },
};
