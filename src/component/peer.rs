use std::{cell::Cell, rc::Rc};

use futures::{lock::Mutex, stream::LocalBoxStream, StreamExt as _};
use tracing::debug;

use crate::{
    component::media::TrackSet,
    error::CallError,
    proto::{ParticipantRef, SessionDescription},
    sys::{RtcError, RtcPeerConnection, RtcPeerEvent, SignalingState},
};

/// Side of the call, fixed for the lifetime of a [`PeerSession`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Sent the initial offer.
    Caller,

    /// Answered the initial offer. Yields on offer collisions.
    Callee,
}

impl Role {
    pub fn is_polite(self) -> bool {
        self == Self::Callee
    }
}

/// Events surfaced to the negotiation layer.
#[derive(Clone, Debug)]
pub enum PeerEvent {
    NegotiationNeeded,
    RemoteTrackReceived(crate::sys::MediaStream),
}

/// One peer connection for the lifetime of one call.
pub struct PeerSession {
    id: u64,
    role: Role,
    remote: ParticipantRef,
    conn: RtcPeerConnection,

    /// Serializes description-mutating operations.
    ops: Mutex<()>,

    /// Bumped on every attached track.
    composition: Cell<u64>,

    /// Composition carried by the outstanding local offer.
    offered: Cell<u64>,

    /// Composition agreed on by the last completed round.
    negotiated: Cell<u64>,
}

impl PeerSession {
    pub fn new(
        id: u64,
        role: Role,
        remote: ParticipantRef,
    ) -> (Rc<Self>, LocalBoxStream<'static, PeerEvent>) {
        let (conn, events) = RtcPeerConnection::new(id);
        let session = Rc::new(Self {
            id,
            role,
            remote,
            conn,
            ops: Mutex::new(()),
            composition: Cell::new(0),
            offered: Cell::new(0),
            negotiated: Cell::new(0),
        });
        let events = events
            .map(|event| match event {
                RtcPeerEvent::NegotiationNeeded => PeerEvent::NegotiationNeeded,
                RtcPeerEvent::Track(stream) => {
                    PeerEvent::RemoteTrackReceived(stream)
                }
            })
            .boxed_local();
        (session, events)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote(&self) -> &ParticipantRef {
        &self.remote
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.conn.signaling_state()
    }

    pub fn has_unnegotiated_changes(&self) -> bool {
        self.composition.get() > self.negotiated.get()
    }

    /// Creates an offer and sets it as the local description.
    pub async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let _op = self.ops.lock().await;
        let composition = self.composition.get();

        let offer = self.conn.create_offer().await?;
        self.conn.set_local_description(&offer).await?;
        self.offered.set(composition);
        debug!(session = self.id, composition, "local offer set");

        Ok(offer)
    }

    /// Applies `offer` as the remote description, then creates and sets the
    /// local answer.
    pub async fn create_answer(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, CallError> {
        let _op = self.ops.lock().await;
        self.conn.set_remote_description(offer).await?;

        let composition = self.composition.get();
        let answer = match self.answer_remote_offer().await {
            Ok(answer) => answer,
            Err(e) => {
                let _ = self.conn.rollback().await;
                return Err(e.into());
            }
        };
        // The answer announces every attached track.
        self.negotiated.set(composition);
        debug!(session = self.id, composition, "local answer set");

        Ok(answer)
    }

    async fn answer_remote_offer(
        &self,
    ) -> Result<SessionDescription, RtcError> {
        let answer = self.conn.create_answer().await?;
        self.conn.set_local_description(&answer).await?;
        Ok(answer)
    }

    /// Completes the round started by [`PeerSession::create_offer`].
    pub async fn apply_remote_answer(
        &self,
        answer: &SessionDescription,
    ) -> Result<(), CallError> {
        let _op = self.ops.lock().await;
        if self.conn.signaling_state() != SignalingState::HaveLocalOffer {
            return Err(CallError::invalid_state(format!(
                "answer received in {} without an outstanding offer",
                self.conn.signaling_state(),
            )));
        }
        self.conn.set_remote_description(answer).await?;
        self.negotiated.set(self.offered.get());
        debug!(session = self.id, "remote answer applied");

        Ok(())
    }

    /// Discards an outstanding offer, if any.
    pub async fn rollback(&self) -> Result<(), CallError> {
        let _op = self.ops.lock().await;
        match self.conn.signaling_state() {
            SignalingState::HaveLocalOffer
            | SignalingState::HaveRemoteOffer => {
                self.conn.rollback().await?;
                debug!(session = self.id, "rolled back");
            }
            _ => (),
        }
        Ok(())
    }

    /// Adds every track of `tracks` that isn't sent yet. Returns how many
    /// tracks were added.
    pub fn attach_tracks(&self, tracks: &TrackSet) -> Result<usize, CallError> {
        let mut attached = 0;
        for track in &tracks.tracks {
            match self.conn.add_track(track.clone(), &tracks.stream_id) {
                Ok(()) => {
                    attached += 1;
                    self.composition.set(self.composition.get() + 1);
                }
                Err(RtcError::InvalidAccess(_)) => (),
                Err(e) => return Err(e.into()),
            }
        }
        debug!(session = self.id, attached, "tracks attached");
        Ok(attached)
    }

    pub fn close(&self) {
        self.conn.close();
    }
}
