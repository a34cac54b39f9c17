use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use futures::{
    future::LocalBoxFuture, stream::LocalBoxStream, FutureExt as _,
    StreamExt as _,
};
use medea_reactive::ObservableCell;
use tracing::{debug, error, info, warn};

use crate::{
    component::{
        media::{Direction, MediaSource, MuteState, TrackSet},
        negotiation::{NegotiationCoordinator, NegotiationState},
        peer::{PeerEvent, PeerSession, Role},
    },
    config::Config,
    error::CallError,
    proto::{
        ClientMessage, EventKind, ParticipantId, ParticipantRef,
        ServerMessage, SessionDescription,
    },
    signaling::SignalingLink,
    sys::{MediaDevices, MediaKind, MediaStream},
    utils::{spawn_abortable, TaskHandle},
};

/// Externally observable state of the call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing(ParticipantRef),
    Connecting,
    Connected,
}

struct InnerRoom {
    config: Config,
    link: SignalingLink,
    media: MediaSource,
    negotiation: NegotiationCoordinator,
    call_state: ObservableCell<CallState>,
    mute: MuteState,
    own_id: RefCell<Option<ParticipantId>>,
    joined_room: RefCell<Option<String>>,
    remote: RefCell<Option<ParticipantRef>>,
    remote_stream: RefCell<Option<MediaStream>>,
    incoming_offer: RefCell<Option<SessionDescription>>,
    streams_sent: Cell<bool>,

    /// The remote participant was announced by `user:joined` rather than
    /// learned from its call.
    remote_announced: Cell<bool>,

    /// Relay subscriptions, alive while the room is joined.
    subscriptions: RefCell<Vec<TaskHandle>>,

    /// Pump of the current peer session's events.
    session_events: RefCell<Option<TaskHandle>>,
}

/// One client's side of a two-party call.
#[derive(Clone)]
pub struct RoomController(Rc<InnerRoom>);

impl RoomController {
    pub fn new(
        config: Config,
        link: SignalingLink,
        devices: Rc<MediaDevices>,
    ) -> Self {
        Self(Rc::new(InnerRoom {
            config,
            negotiation: NegotiationCoordinator::new(link.clone()),
            link,
            media: MediaSource::new(devices),
            call_state: ObservableCell::new(CallState::Idle),
            mute: MuteState::default(),
            own_id: RefCell::new(None),
            joined_room: RefCell::new(None),
            remote: RefCell::new(None),
            remote_stream: RefCell::new(None),
            incoming_offer: RefCell::new(None),
            streams_sent: Cell::new(false),
            remote_announced: Cell::new(false),
            subscriptions: RefCell::new(Vec::new()),
            session_events: RefCell::new(None),
        }))
    }

    pub fn call_state(&self) -> CallState {
        self.0.call_state.get()
    }

    pub fn on_call_state_change(&self) -> LocalBoxStream<'static, CallState> {
        self.0.call_state.subscribe()
    }

    /// Resolves once the call reaches `state`.
    pub fn when_call_state(
        &self,
        state: CallState,
    ) -> LocalBoxFuture<'static, ()> {
        self.0.call_state.when_eq(state).map(|_| ()).boxed_local()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.0.negotiation.state()
    }

    pub fn when_negotiation_state(
        &self,
        state: NegotiationState,
    ) -> LocalBoxFuture<'static, ()> {
        self.0.negotiation.when_state(state)
    }

    pub fn is_local_muted(&self) -> bool {
        self.0.mute.is_muted(Direction::Send)
    }

    pub fn is_remote_muted(&self) -> bool {
        self.0.mute.is_muted(Direction::Recv)
    }

    pub fn on_mute_change(
        &self,
        direction: Direction,
    ) -> LocalBoxStream<'static, bool> {
        self.0.mute.subscribe(direction)
    }

    pub fn local_tracks(&self) -> Option<TrackSet> {
        self.0.media.tracks()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.0.remote_stream.borrow().clone()
    }

    pub fn remote_participant(&self) -> Option<ParticipantRef> {
        self.0.remote.borrow().clone()
    }

    pub fn joined_room(&self) -> Option<String> {
        self.0.joined_room.borrow().clone()
    }

    pub fn own_id(&self) -> Option<ParticipantId> {
        self.0.own_id.borrow().clone()
    }

    pub fn streams_sent(&self) -> bool {
        self.0.streams_sent.get()
    }

    /// Subscribes to the relay and asks it to join the configured room.
    pub fn join(&self) -> Result<(), CallError> {
        if self.0.subscriptions.borrow().is_empty() {
            self.spawn_tasks();
        }
        self.0.link.send(ClientMessage::JoinRoom {
            display_name: self.0.config.display_name.clone(),
            room: self.0.config.room.clone(),
        })?;
        Ok(())
    }

    /// Handles relay messages one at a time, in delivery order.
    fn spawn_tasks(&self) {
        let mut messages = self.0.link.subscribe_many(&[
            EventKind::RoomJoined,
            EventKind::UserJoined,
            EventKind::IncomingCall,
            EventKind::CallAccepted,
            EventKind::NegotiationNeeded,
            EventKind::NegotiationFinal,
        ]);
        let weak = Rc::downgrade(&self.0);
        let task = spawn_abortable(async move {
            while let Some(msg) = messages.next().await {
                let room = match weak.upgrade() {
                    Some(inner) => Self(inner),
                    None => break,
                };
                let event = msg.kind();
                if let Err(e) = room.on_message(msg).await {
                    log_error(event, &e);
                }
            }
        });
        self.0.subscriptions.borrow_mut().push(task);
    }

    async fn on_message(&self, msg: ServerMessage) -> Result<(), CallError> {
        match msg {
            ServerMessage::RoomJoined {
                display_name,
                room,
                id,
            } => {
                info!(%display_name, %room, "joined room");
                *self.0.joined_room.borrow_mut() = Some(room);
                *self.0.own_id.borrow_mut() = id;
                Ok(())
            }
            ServerMessage::UserJoined { display_name, id } => {
                self.on_user_joined(ParticipantRef { id, display_name })
            }
            ServerMessage::IncomingCall { from, offer } => {
                self.on_incoming_call(from, offer).await
            }
            ServerMessage::CallAccepted { from, ans } => {
                self.on_call_accepted(from, &ans).await
            }
            ServerMessage::NegotiationNeeded { from, offer } => {
                self.0.negotiation.handle_remote_offer(&from, &offer).await
            }
            ServerMessage::NegotiationFinal { ans } => {
                self.0.negotiation.handle_renegotiation_answer(&ans).await?;
                self.set_connected();
                Ok(())
            }
        }
    }

    fn on_user_joined(&self, remote: ParticipantRef) -> Result<(), CallError> {
        if self.0.negotiation.session().is_some() {
            return Err(CallError::invalid_state(format!(
                "{} joined while a call is active",
                remote.id,
            )));
        }
        info!(
            name = %remote.display_name,
            id = %remote.id,
            "participant joined room",
        );
        *self.0.remote.borrow_mut() = Some(remote);
        self.0.remote_announced.set(true);
        Ok(())
    }

    async fn on_incoming_call(
        &self,
        from: ParticipantId,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        if let Some(session) = self.0.negotiation.session() {
            let own_call_pending = matches!(
                self.0.negotiation.state(),
                NegotiationState::Idle | NegotiationState::OfferSent { .. }
            ) && session.role() == Role::Caller
                && session.remote().id == from;
            if !own_call_pending {
                return Err(CallError::invalid_state(format!(
                    "call from {} while already in a call",
                    from,
                )));
            }
            if !self.yields_to(&from) {
                info!(%from, "ignoring colliding call");
                return Ok(());
            }
            info!(%from, "call collision, answering remote call");
            self.drop_session();
        } else if self.call_state() != CallState::Idle {
            return Err(CallError::invalid_state(format!(
                "call from {} while {:?}",
                from,
                self.call_state(),
            )));
        }

        if self.remote_participant().map_or(true, |r| r.id != from) {
            self.0.remote_announced.set(false);
        }
        let remote = self.participant(from);
        info!(from = %remote.id, name = %remote.display_name, "incoming call");
        *self.0.remote.borrow_mut() = Some(remote.clone());
        *self.0.incoming_offer.borrow_mut() = Some(offer);
        self.0.call_state.set(CallState::Ringing(remote));

        if self.0.config.auto_answer {
            self.accept_call().await?;
        }
        Ok(())
    }

    async fn on_call_accepted(
        &self,
        from: ParticipantId,
        ans: &SessionDescription,
    ) -> Result<(), CallError> {
        if self.remote_participant().map_or(true, |r| r.id != from) {
            return Err(CallError::invalid_state(format!(
                "answer from unknown participant {}",
                from,
            )));
        }

        let tracks = self.0.media.tracks();
        match self.0.negotiation.complete_call(ans, tracks.as_ref()).await {
            Ok(()) => {
                if tracks.is_some() {
                    self.0.streams_sent.set(true);
                }
                info!(%from, "call accepted");
                self.set_connected();
                Ok(())
            }
            Err(e) => {
                if self.0.negotiation.state() == NegotiationState::Idle
                    && self.call_state() == CallState::Connecting
                {
                    self.end_attempt();
                }
                Err(e)
            }
        }
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::NegotiationNeeded => {
                if let Err(e) = self.0.negotiation.on_negotiation_needed().await
                {
                    log_error(EventKind::NegotiationNeeded, &e);
                }
            }
            PeerEvent::RemoteTrackReceived(stream) => {
                info!(
                    stream = %stream.id,
                    tracks = stream.tracks.len(),
                    "remote track received",
                );
                self.0.mute.apply(Direction::Recv, &stream.tracks);
                *self.0.remote_stream.borrow_mut() = Some(stream);
                self.set_connected();
            }
        }
    }

    /// Calls the participant who joined the room.
    pub async fn connect_call(&self) -> Result<(), CallError> {
        let remote = self
            .remote_participant()
            .ok_or(CallError::NoRemoteParticipant)?;
        if self.call_state() != CallState::Idle {
            return Err(CallError::invalid_state("call already in progress"));
        }

        self.0.call_state.set(CallState::Connecting);
        let session = self.open_session(Role::Caller, remote);
        let acquired = self.0.media.acquire(self.0.config.media).await;
        if !self.is_current(&session) {
            debug!("call attempt superseded by incoming call");
            return Ok(());
        }
        if let Err(e) = acquired {
            self.end_attempt();
            return Err(e);
        }
        self.apply_local_mute();

        if let Err(e) = self.0.negotiation.start_call().await {
            if self.is_current(&session) {
                self.end_attempt();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Answers the ringing call.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let remote = match self.call_state() {
            CallState::Ringing(remote) => remote,
            _ => return Err(CallError::invalid_state("no ringing call")),
        };
        let offer = self
            .0
            .incoming_offer
            .borrow_mut()
            .take()
            .ok_or_else(|| CallError::invalid_state("no incoming offer"))?;

        self.0.call_state.set(CallState::Connecting);
        if let Err(e) = self.0.media.acquire(self.0.config.media).await {
            self.0.call_state.set(CallState::Idle);
            return Err(e);
        }
        self.apply_local_mute();

        self.open_session(Role::Callee, remote);
        if let Err(e) = self.0.negotiation.answer_call(&offer).await {
            self.end_attempt();
            return Err(e);
        }
        self.set_connected();
        Ok(())
    }

    /// Starts sending the local tracks to the peer.
    pub fn send_streams(&self) -> Result<(), CallError> {
        let tracks = self
            .0
            .media
            .tracks()
            .ok_or_else(|| CallError::invalid_state("no local media"))?;
        let attached = self.0.negotiation.attach_tracks(&tracks)?;
        self.0.streams_sent.set(true);
        info!(attached, "local streams sent");
        Ok(())
    }

    pub fn set_local_mute(&self, muted: bool) {
        self.0.mute.set_muted(Direction::Send, muted);
        self.apply_local_mute();
    }

    /// Flips the outgoing audio mute, returning the new flag.
    pub fn toggle_local_mute(&self) -> bool {
        let muted = !self.is_local_muted();
        self.set_local_mute(muted);
        muted
    }

    pub fn set_remote_mute(&self, muted: bool) {
        self.0.mute.set_muted(Direction::Recv, muted);
        if let Some(stream) = self.0.remote_stream.borrow().as_ref() {
            self.0.mute.apply(Direction::Recv, &stream.tracks);
        }
    }

    /// Flips local playback of the peer's audio, returning the new flag.
    pub fn toggle_remote_mute(&self) -> bool {
        let muted = !self.is_remote_muted();
        self.set_remote_mute(muted);
        muted
    }

    /// Ends the call, staying in the room.
    pub fn hang_up(&self) {
        self.drop_session();
        self.0.media.release();
        self.0.remote_stream.borrow_mut().take();
        self.0.incoming_offer.borrow_mut().take();
        self.0.streams_sent.set(false);
        self.0.call_state.set(CallState::Idle);
    }

    /// Ends the call and drops every relay subscription.
    pub fn leave(&self) {
        self.0.subscriptions.borrow_mut().clear();
        self.hang_up();
        self.0.remote.borrow_mut().take();
        self.0.remote_announced.set(false);
        self.0.joined_room.borrow_mut().take();
        info!("left room");
    }

    fn open_session(
        &self,
        role: Role,
        remote: ParticipantRef,
    ) -> Rc<PeerSession> {
        let (session, mut events) =
            self.0.negotiation.open_session(role, remote);
        let weak = Rc::downgrade(&self.0);
        let task = spawn_abortable(async move {
            while let Some(event) = events.next().await {
                match weak.upgrade() {
                    Some(inner) => Self(inner).on_peer_event(event).await,
                    None => break,
                }
            }
        });
        *self.0.session_events.borrow_mut() = Some(task);
        session
    }

    fn is_current(&self, session: &Rc<PeerSession>) -> bool {
        self.0
            .negotiation
            .session()
            .map_or(false, |s| Rc::ptr_eq(&s, session))
    }

    fn drop_session(&self) {
        self.0.session_events.borrow_mut().take();
        self.0.negotiation.discard_session();
    }

    /// Abandons a call attempt that never connected.
    fn end_attempt(&self) {
        self.drop_session();
        self.0.incoming_offer.borrow_mut().take();
        self.0.call_state.set(CallState::Idle);
    }

    fn set_connected(&self) {
        if self.call_state() == CallState::Connecting {
            info!("call connected");
            self.0.call_state.set(CallState::Connected);
        }
    }

    fn apply_local_mute(&self) {
        self.0
            .media
            .set_enabled(MediaKind::Audio, !self.is_local_muted());
    }

    fn participant(&self, id: ParticipantId) -> ParticipantRef {
        match self.remote_participant() {
            Some(remote) if remote.id == id => remote,
            _ => ParticipantRef {
                display_name: id.to_string(),
                id,
            },
        }
    }

    /// Whether this side gives up its own initial offer when calls cross.
    ///
    /// The smaller relay id yields. Without an id in the join ack, the side
    /// that joined later yields: only the earlier one saw `user:joined`.
    fn yields_to(&self, other: &ParticipantId) -> bool {
        match self.own_id() {
            Some(own) => own < *other,
            None => !self.0.remote_announced.get(),
        }
    }
}

fn log_error(event: EventKind, err: &CallError) {
    match err {
        CallError::NoSession => debug!(%event, "no session, event ignored"),
        CallError::InvalidState(_) => warn!(%event, %err, "event dropped"),
        _ => error!(%event, %err, "event handling failed"),
    }
}
