use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    rc::Rc,
};

use futures::channel::mpsc;
use thiserror::Error;
use tokio::task::yield_now;

use crate::proto::{SdpType, SessionDescription};

use super::{MediaKind, MediaStream, MediaStreamTrack};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Closed => "closed",
        })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RtcError {
    #[error("cannot {op} in signaling state {state}")]
    InvalidState {
        op: &'static str,
        state: SignalingState,
    },

    #[error("track {0} is already being sent")]
    InvalidAccess(String),

    #[error("malformed SDP: {0}")]
    MalformedSdp(String),
}

/// Events fired by [`RtcPeerConnection`].
#[derive(Clone, Debug)]
pub enum RtcPeerEvent {
    /// Set of sent tracks changed.
    NegotiationNeeded,

    /// New remote track, with every remote track of its stream known so far.
    Track(MediaStream),
}

struct Sender {
    track: MediaStreamTrack,
    stream_id: String,
}

struct InnerPeer {
    session_id: u64,
    state: Cell<SignalingState>,
    senders: RefCell<Vec<Sender>>,
    sdp_version: Cell<u64>,
    remote_streams: RefCell<HashMap<String, MediaStream>>,
    events: RefCell<Option<mpsc::UnboundedSender<RtcPeerEvent>>>,
}

/// In-process peer connection following the offer/answer rules of a
/// browser `RTCPeerConnection`. Media is never actually transmitted: sent
/// tracks are announced as `a=msid` lines and show up on the remote side as
/// tracks once the description carrying them is applied.
#[derive(Clone)]
pub struct RtcPeerConnection(Rc<InnerPeer>);

impl RtcPeerConnection {
    pub fn new(
        session_id: u64,
    ) -> (Self, mpsc::UnboundedReceiver<RtcPeerEvent>) {
        let (tx, rx) = mpsc::unbounded();
        let peer = Self(Rc::new(InnerPeer {
            session_id,
            state: Cell::new(SignalingState::Stable),
            senders: RefCell::new(Vec::new()),
            sdp_version: Cell::new(0),
            remote_streams: RefCell::new(HashMap::new()),
            events: RefCell::new(Some(tx)),
        }));
        (peer, rx)
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.0.state.get()
    }

    pub fn senders_count(&self) -> usize {
        self.0.senders.borrow().len()
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        yield_now().await;
        self.ensure_state(
            "create offer",
            &[SignalingState::Stable, SignalingState::HaveLocalOffer],
        )?;
        Ok(SessionDescription::offer(self.local_sdp()))
    }

    pub async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        yield_now().await;
        self.ensure_state("create answer", &[SignalingState::HaveRemoteOffer])?;
        Ok(SessionDescription::answer(self.local_sdp()))
    }

    pub async fn set_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), RtcError> {
        yield_now().await;
        match desc.kind {
            SdpType::Offer => {
                self.ensure_state(
                    "set local offer",
                    &[SignalingState::Stable, SignalingState::HaveLocalOffer],
                )?;
                self.0.state.set(SignalingState::HaveLocalOffer);
            }
            SdpType::Answer => {
                self.ensure_state(
                    "set local answer",
                    &[SignalingState::HaveRemoteOffer],
                )?;
                self.0.state.set(SignalingState::Stable);
            }
        }
        Ok(())
    }

    pub async fn set_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), RtcError> {
        yield_now().await;
        let announced = parse_msid_lines(&desc.sdp)?;
        match desc.kind {
            SdpType::Offer => {
                self.ensure_state(
                    "set remote offer",
                    &[SignalingState::Stable],
                )?;
                self.0.state.set(SignalingState::HaveRemoteOffer);
            }
            SdpType::Answer => {
                self.ensure_state(
                    "set remote answer",
                    &[SignalingState::HaveLocalOffer],
                )?;
                self.0.state.set(SignalingState::Stable);
            }
        }
        self.on_remote_tracks(announced);
        Ok(())
    }

    /// Drops an outstanding local or remote offer.
    pub async fn rollback(&self) -> Result<(), RtcError> {
        yield_now().await;
        self.ensure_state(
            "rollback",
            &[
                SignalingState::Stable,
                SignalingState::HaveLocalOffer,
                SignalingState::HaveRemoteOffer,
            ],
        )?;
        self.0.state.set(SignalingState::Stable);
        Ok(())
    }

    pub fn add_track(
        &self,
        track: MediaStreamTrack,
        stream_id: &str,
    ) -> Result<(), RtcError> {
        if self.0.state.get() == SignalingState::Closed {
            return Err(RtcError::InvalidState {
                op: "add track",
                state: SignalingState::Closed,
            });
        }
        {
            let mut senders = self.0.senders.borrow_mut();
            if senders.iter().any(|s| s.track == track) {
                return Err(RtcError::InvalidAccess(track.id().to_owned()));
            }
            senders.push(Sender {
                track,
                stream_id: stream_id.to_owned(),
            });
        }
        self.emit(RtcPeerEvent::NegotiationNeeded);
        Ok(())
    }

    pub fn close(&self) {
        self.0.state.set(SignalingState::Closed);
        self.0.events.borrow_mut().take();
        self.0.senders.borrow_mut().clear();
    }

    fn ensure_state(
        &self,
        op: &'static str,
        allowed: &[SignalingState],
    ) -> Result<(), RtcError> {
        let state = self.0.state.get();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(RtcError::InvalidState { op, state })
        }
    }

    fn local_sdp(&self) -> String {
        let version = self.0.sdp_version.get() + 1;
        self.0.sdp_version.set(version);

        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.0.session_id, version,
        );
        for sender in self.0.senders.borrow().iter() {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:{} {}\r\na=sendrecv\r\n",
                sender.track.kind(),
                sender.stream_id,
                sender.track.id(),
            ));
        }
        sdp
    }

    fn on_remote_tracks(&self, announced: Vec<(MediaKind, String, String)>) {
        for (kind, stream_id, track_id) in announced {
            let snapshot = {
                let mut streams = self.0.remote_streams.borrow_mut();
                let stream = streams
                    .entry(stream_id.clone())
                    .or_insert_with(|| MediaStream::new(stream_id));
                if stream.tracks.iter().any(|t| t.id() == track_id) {
                    continue;
                }
                stream.tracks.push(MediaStreamTrack::new(track_id, kind));
                stream.clone()
            };
            self.emit(RtcPeerEvent::Track(snapshot));
        }
    }

    fn emit(&self, event: RtcPeerEvent) {
        if let Some(tx) = self.0.events.borrow().as_ref() {
            let _ = tx.unbounded_send(event);
        }
    }
}

/// Extracts `(kind, stream id, track id)` of every sent track in `sdp`.
fn parse_msid_lines(
    sdp: &str,
) -> Result<Vec<(MediaKind, String, String)>, RtcError> {
    if !sdp.starts_with("v=0") {
        return Err(RtcError::MalformedSdp("missing version line".into()));
    }

    let mut kind = None;
    let mut tracks = Vec::new();
    for line in sdp.lines().map(|l| l.trim_end_matches('\r')) {
        if let Some(media) = line.strip_prefix("m=") {
            let name = media.split(' ').next().unwrap_or_default();
            kind = Some(MediaKind::parse(name).ok_or_else(|| {
                RtcError::MalformedSdp(format!("unknown media `{}`", name))
            })?);
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            let mut parts = msid.split_whitespace();
            let (stream, track) = match (parts.next(), parts.next()) {
                (Some(s), Some(t)) => (s, t),
                _ => {
                    return Err(RtcError::MalformedSdp(format!(
                        "bad msid `{}`",
                        msid
                    )))
                }
            };
            let kind = kind.ok_or_else(|| {
                RtcError::MalformedSdp("msid outside media section".into())
            })?;
            tracks.push((kind, stream.to_owned(), track.to_owned()));
        }
    }
    Ok(tracks)
}
