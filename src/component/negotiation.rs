use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use futures::{
    future::LocalBoxFuture, stream::LocalBoxStream, FutureExt as _,
};
use medea_reactive::ObservableCell;
use tracing::{debug, info, warn};

use crate::{
    component::{
        media::TrackSet,
        peer::{PeerEvent, PeerSession, Role},
    },
    error::CallError,
    proto::{ClientMessage, ParticipantId, ParticipantRef, SessionDescription},
    signaling::SignalingLink,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationState {
    /// No round completed yet.
    Idle,

    /// Local offer outstanding.
    OfferSent { round: u64 },

    /// Answering a remote offer.
    Answering { round: u64 },

    Stable,
}

/// Sequences signaling messages with [`PeerSession`] operations, keeping at
/// most one negotiation round in flight.
pub struct NegotiationCoordinator {
    link: SignalingLink,
    session: RefCell<Option<Rc<PeerSession>>>,
    state: ObservableCell<NegotiationState>,

    /// A negotiation need arrived mid-round and waits for `Stable`.
    renegotiation_pending: Cell<bool>,

    /// The initial offer/answer round has completed.
    established: Cell<bool>,

    rounds: Cell<u64>,
    sessions: Cell<u64>,
}

impl NegotiationCoordinator {
    pub fn new(link: SignalingLink) -> Self {
        Self {
            link,
            session: RefCell::new(None),
            state: ObservableCell::new(NegotiationState::Idle),
            renegotiation_pending: Cell::new(false),
            established: Cell::new(false),
            rounds: Cell::new(0),
            sessions: Cell::new(0),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state.get()
    }

    pub fn on_state_change(&self) -> LocalBoxStream<'static, NegotiationState> {
        self.state.subscribe()
    }

    /// Resolves once the coordinator reaches `state`.
    pub fn when_state(
        &self,
        state: NegotiationState,
    ) -> LocalBoxFuture<'static, ()> {
        self.state.when_eq(state).map(|_| ()).boxed_local()
    }

    pub fn is_renegotiation_pending(&self) -> bool {
        self.renegotiation_pending.get()
    }

    pub fn session(&self) -> Option<Rc<PeerSession>> {
        self.session.borrow().clone()
    }

    /// Replaces the current session with a fresh one.
    pub fn open_session(
        &self,
        role: Role,
        remote: ParticipantRef,
    ) -> (Rc<PeerSession>, LocalBoxStream<'static, PeerEvent>) {
        self.discard_session();

        let id = self.sessions.get() + 1;
        self.sessions.set(id);
        let (session, events) = PeerSession::new(id, role, remote);
        info!(
            session = id,
            ?role,
            remote = %session.remote().id,
            "peer session opened",
        );
        *self.session.borrow_mut() = Some(Rc::clone(&session));

        (session, events)
    }

    pub fn discard_session(&self) {
        if let Some(session) = self.session.borrow_mut().take() {
            session.close();
            info!(session = session.id(), "peer session discarded");
        }
        self.renegotiation_pending.set(false);
        self.established.set(false);
        self.state.set(NegotiationState::Idle);
    }

    fn current_session(&self) -> Result<Rc<PeerSession>, CallError> {
        self.session().ok_or(CallError::NoSession)
    }

    fn is_current(&self, session: &Rc<PeerSession>) -> bool {
        self.session
            .borrow()
            .as_ref()
            .map_or(false, |s| Rc::ptr_eq(s, session))
    }

    fn next_round(&self) -> u64 {
        let round = self.rounds.get() + 1;
        self.rounds.set(round);
        round
    }

    fn settled_state(&self) -> NegotiationState {
        if self.established.get() {
            NegotiationState::Stable
        } else {
            NegotiationState::Idle
        }
    }

    /// Sends the initial offer of the current session (`user:call`).
    pub async fn start_call(&self) -> Result<(), CallError> {
        let session = self.current_session()?;
        if self.state.get() != NegotiationState::Idle {
            return Err(CallError::invalid_state("call already started"));
        }
        self.send_offer(&session, true).await
    }

    /// Answers the initial `offer` of the current session (`call:accepted`).
    pub async fn answer_call(
        &self,
        offer: &SessionDescription,
    ) -> Result<(), CallError> {
        let session = self.current_session()?;
        if self.state.get() != NegotiationState::Idle {
            return Err(CallError::invalid_state("call already started"));
        }

        let round = self.next_round();
        self.state.set(NegotiationState::Answering { round });
        let ans = match session.create_answer(offer).await {
            Ok(ans) => ans,
            Err(e) => return Err(self.abort_round(&session, e).await),
        };
        if !self.is_current(&session) {
            return Ok(());
        }

        self.link.send(ClientMessage::CallAccepted {
            to: session.remote().id.clone(),
            ans,
        })?;
        info!(round, "call answered");
        self.established.set(true);
        self.state.set(NegotiationState::Stable);

        self.resume_pending().await;
        Ok(())
    }

    /// Applies the answer to the initial offer and starts sending `tracks`.
    pub async fn complete_call(
        &self,
        ans: &SessionDescription,
        tracks: Option<&TrackSet>,
    ) -> Result<(), CallError> {
        let session = self.current_session()?;
        self.apply_answer(&session, ans).await?;
        if !self.is_current(&session) {
            return Ok(());
        }
        info!("call established");

        if let Some(tracks) = tracks {
            session.attach_tracks(tracks)?;
        }
        self.resume_pending().await;
        Ok(())
    }

    /// Starts sending `tracks` on the current session.
    pub fn attach_tracks(&self, tracks: &TrackSet) -> Result<usize, CallError> {
        self.current_session()?.attach_tracks(tracks)
    }

    /// Reacts to a change of local media composition.
    pub async fn on_negotiation_needed(&self) -> Result<(), CallError> {
        let session = match self.session() {
            Some(session) => session,
            None => return Ok(()),
        };
        match self.state.get() {
            NegotiationState::Stable => (),
            state => {
                debug!(?state, "negotiation deferred until stable");
                self.renegotiation_pending.set(true);
                return Ok(());
            }
        }
        if !session.has_unnegotiated_changes() {
            debug!("negotiation need already satisfied");
            return Ok(());
        }
        self.send_offer(&session, false).await
    }

    /// Answers a renegotiation offer of the peer (`peer:nego:done`).
    pub async fn handle_remote_offer(
        &self,
        from: &ParticipantId,
        offer: &SessionDescription,
    ) -> Result<(), CallError> {
        let session = self.current_session()?;
        if session.remote().id != *from {
            return Err(CallError::invalid_state(format!(
                "offer from unknown participant {}",
                from,
            )));
        }

        let collided = match self.state.get() {
            NegotiationState::Stable => false,
            NegotiationState::OfferSent { round } => {
                if !session.role().is_polite() {
                    info!(round, "ignoring colliding remote offer");
                    return Ok(());
                }
                info!(round, "offer collision, yielding to remote offer");
                true
            }
            state => {
                return Err(CallError::invalid_state(format!(
                    "remote offer in {:?}",
                    state,
                )));
            }
        };

        let round = self.next_round();
        self.state.set(NegotiationState::Answering { round });
        if collided {
            // Our own change still has to be negotiated after this round.
            self.renegotiation_pending.set(true);
            if let Err(e) = session.rollback().await {
                return Err(self.abort_round(&session, e).await);
            }
        }

        let ans = match session.create_answer(offer).await {
            Ok(ans) => ans,
            Err(e) => return Err(self.abort_round(&session, e).await),
        };
        if !self.is_current(&session) {
            return Ok(());
        }
        let sent = self.link.send(ClientMessage::NegotiationDone {
            to: from.clone(),
            ans,
        });
        self.state.set(NegotiationState::Stable);
        debug!(round, "renegotiation answered");
        sent?;

        self.resume_pending().await;
        Ok(())
    }

    /// Applies the peer's answer to a renegotiation offer.
    pub async fn handle_renegotiation_answer(
        &self,
        ans: &SessionDescription,
    ) -> Result<(), CallError> {
        let session = self.current_session()?;
        self.apply_answer(&session, ans).await?;
        if !self.is_current(&session) {
            return Ok(());
        }
        self.resume_pending().await;
        Ok(())
    }

    async fn apply_answer(
        &self,
        session: &Rc<PeerSession>,
        ans: &SessionDescription,
    ) -> Result<(), CallError> {
        let round = match self.state.get() {
            NegotiationState::OfferSent { round } => round,
            state => {
                warn!(?state, "answer without an outstanding offer dropped");
                return Err(CallError::invalid_state(format!(
                    "answer in {:?}",
                    state,
                )));
            }
        };
        if let Err(e) = session.apply_remote_answer(ans).await {
            return Err(self.abort_round(session, e).await);
        }
        if self.is_current(session) {
            self.established.set(true);
            self.state.set(NegotiationState::Stable);
            debug!(round, "round completed");
        }
        Ok(())
    }

    async fn send_offer(
        &self,
        session: &Rc<PeerSession>,
        initial: bool,
    ) -> Result<(), CallError> {
        let round = self.next_round();
        let fallback = self.settled_state();
        self.state.set(NegotiationState::OfferSent { round });

        let offer = match session.create_offer().await {
            Ok(offer) => offer,
            Err(_) if !self.is_current(session) => {
                debug!(round, "session discarded, offer dropped");
                return Ok(());
            }
            Err(e) => {
                self.state.set(fallback);
                return Err(e);
            }
        };
        if !self.is_current(session) {
            debug!(round, "session discarded, offer dropped");
            return Ok(());
        }
        if self.state.get() != (NegotiationState::OfferSent { round }) {
            debug!(round, "local offer superseded");
            return Ok(());
        }

        let to = session.remote().id.clone();
        let msg = if initial {
            ClientMessage::CallUser { to, offer }
        } else {
            ClientMessage::NegotiationNeeded { offer, to }
        };
        if let Err(e) = self.link.send(msg) {
            if let Err(e) = session.rollback().await {
                warn!(%e, "rollback of unsent offer failed");
            }
            if self.is_current(session) {
                self.state.set(fallback);
            }
            return Err(e.into());
        }
        info!(round, initial, "offer sent");
        Ok(())
    }

    /// Re-evaluates a negotiation need deferred by an in-flight round.
    async fn resume_pending(&self) {
        if self.renegotiation_pending.replace(false) {
            debug!("re-evaluating deferred negotiation");
            if let Err(e) = self.on_negotiation_needed().await {
                warn!(%e, "deferred renegotiation failed");
            }
        }
    }

    async fn abort_round(
        &self,
        session: &Rc<PeerSession>,
        err: CallError,
    ) -> CallError {
        warn!(%err, "negotiation round aborted");
        if self.is_current(session) {
            if let Err(e) = session.rollback().await {
                warn!(%e, "rollback of aborted round failed");
            }
            self.state.set(self.settled_state());
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc;

    use crate::sys::{MediaKind, MediaStreamTrack};

    use super::*;

    fn remote(id: &str) -> ParticipantRef {
        ParticipantRef {
            id: ParticipantId::from(id),
            display_name: id.to_owned(),
        }
    }

    type Outbox = mpsc::UnboundedReceiver<ClientMessage>;

    fn coordinator() -> (NegotiationCoordinator, Outbox) {
        let (link, out) = SignalingLink::new();
        (NegotiationCoordinator::new(link), out)
    }

    fn sent(out: &mut Outbox) -> Vec<ClientMessage> {
        let mut msgs = Vec::new();
        while let Ok(Some(msg)) = out.try_next() {
            msgs.push(msg);
        }
        msgs
    }

    fn track_set(prefix: &str) -> TrackSet {
        TrackSet {
            stream_id: format!("{}-s", prefix),
            tracks: vec![
                MediaStreamTrack::new(
                    format!("{}-a", prefix),
                    MediaKind::Audio,
                ),
                MediaStreamTrack::new(
                    format!("{}-v", prefix),
                    MediaKind::Video,
                ),
            ],
        }
    }

    /// Runs an initial offer/answer between two coordinators.
    async fn established_pair() -> (
        NegotiationCoordinator,
        mpsc::UnboundedReceiver<ClientMessage>,
        NegotiationCoordinator,
        mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        let (caller, mut caller_out) = coordinator();
        let (callee, mut callee_out) = coordinator();
        caller.open_session(Role::Caller, remote("callee"));
        callee.open_session(Role::Callee, remote("caller"));

        caller.start_call().await.unwrap();
        let offer = match sent(&mut caller_out).pop() {
            Some(ClientMessage::CallUser { offer, .. }) => offer,
            other => panic!("expected user:call, got {:?}", other),
        };
        callee.answer_call(&offer).await.unwrap();
        let ans = match sent(&mut callee_out).pop() {
            Some(ClientMessage::CallAccepted { ans, .. }) => ans,
            other => panic!("expected call:accepted, got {:?}", other),
        };
        caller.complete_call(&ans, None).await.unwrap();

        (caller, caller_out, callee, callee_out)
    }

    #[tokio::test]
    async fn initial_round_reaches_stable() {
        let (caller, _, callee, _) = established_pair().await;

        assert_eq!(caller.state(), NegotiationState::Stable);
        assert_eq!(callee.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn stray_answer_is_rejected_without_state_change() {
        let (caller, _, _, _) = established_pair().await;

        let err = caller
            .handle_renegotiation_answer(&SessionDescription::answer(
                "v=0".into(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
        assert_eq!(caller.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn triggers_during_a_round_are_deferred() {
        let (caller, mut caller_out, _, _) = established_pair().await;
        caller.attach_tracks(&track_set("c")).unwrap();

        futures::join!(
            caller.on_negotiation_needed(),
            caller.on_negotiation_needed(),
        )
        .0
        .unwrap();

        let msgs = sent(&mut caller_out);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], ClientMessage::NegotiationNeeded { .. }));
        assert!(caller.is_renegotiation_pending());
        assert!(matches!(caller.state(), NegotiationState::OfferSent { .. }));
    }

    #[tokio::test]
    async fn superseded_trigger_sends_nothing() {
        let (caller, mut caller_out, callee, mut callee_out) =
            established_pair().await;
        caller.attach_tracks(&track_set("c")).unwrap();
        let _ = futures::join!(
            caller.on_negotiation_needed(),
            caller.on_negotiation_needed(),
        );
        let offer = match sent(&mut caller_out).pop() {
            Some(ClientMessage::NegotiationNeeded { offer, .. }) => offer,
            other => panic!("expected peer:nego:needed, got {:?}", other),
        };

        callee
            .handle_remote_offer(&ParticipantId::from("caller"), &offer)
            .await
            .unwrap();
        let ans = match sent(&mut callee_out).pop() {
            Some(ClientMessage::NegotiationDone { ans, .. }) => ans,
            other => panic!("expected peer:nego:done, got {:?}", other),
        };
        caller.handle_renegotiation_answer(&ans).await.unwrap();

        assert_eq!(caller.state(), NegotiationState::Stable);
        assert!(!caller.is_renegotiation_pending());
        assert!(sent(&mut caller_out).is_empty());
    }

    #[tokio::test]
    async fn deferred_trigger_offers_the_newer_track() {
        let (caller, mut caller_out, callee, mut callee_out) =
            established_pair().await;
        let mut tracks = track_set("c");
        let camera = tracks.tracks.pop().unwrap();

        caller.attach_tracks(&tracks).unwrap();
        caller.on_negotiation_needed().await.unwrap();
        let first = match sent(&mut caller_out).pop() {
            Some(ClientMessage::NegotiationNeeded { offer, .. }) => offer,
            other => panic!("expected peer:nego:needed, got {:?}", other),
        };
        assert!(!first.sdp.contains("c-v"));

        tracks.tracks.push(camera);
        assert_eq!(caller.attach_tracks(&tracks), Ok(1));
        caller.on_negotiation_needed().await.unwrap();
        assert!(caller.is_renegotiation_pending());
        assert!(sent(&mut caller_out).is_empty());

        callee
            .handle_remote_offer(&ParticipantId::from("caller"), &first)
            .await
            .unwrap();
        let ans = match sent(&mut callee_out).pop() {
            Some(ClientMessage::NegotiationDone { ans, .. }) => ans,
            other => panic!("expected peer:nego:done, got {:?}", other),
        };
        caller.handle_renegotiation_answer(&ans).await.unwrap();

        let msgs = sent(&mut caller_out);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            ClientMessage::NegotiationNeeded { offer, .. } => {
                assert!(offer.sdp.contains("a=msid:c-s c-v"));
            }
            other => panic!("expected peer:nego:needed, got {:?}", other),
        }
        assert!(!caller.is_renegotiation_pending());
        assert!(matches!(caller.state(), NegotiationState::OfferSent { .. }));
    }

    #[tokio::test]
    async fn polite_side_yields_on_collision() {
        let (caller, mut caller_out, callee, mut callee_out) =
            established_pair().await;
        caller.attach_tracks(&track_set("c")).unwrap();
        callee.attach_tracks(&track_set("e")).unwrap();
        caller.on_negotiation_needed().await.unwrap();
        callee.on_negotiation_needed().await.unwrap();

        let caller_offer = match sent(&mut caller_out).pop() {
            Some(ClientMessage::NegotiationNeeded { offer, .. }) => offer,
            other => panic!("expected caller offer, got {:?}", other),
        };
        let callee_offer = match sent(&mut callee_out).pop() {
            Some(ClientMessage::NegotiationNeeded { offer, .. }) => offer,
            other => panic!("expected callee offer, got {:?}", other),
        };

        // Both offers cross on the relay.
        caller
            .handle_remote_offer(&ParticipantId::from("callee"), &callee_offer)
            .await
            .unwrap();
        assert!(sent(&mut caller_out).is_empty());

        callee
            .handle_remote_offer(&ParticipantId::from("caller"), &caller_offer)
            .await
            .unwrap();
        let ans = match sent(&mut callee_out).pop() {
            Some(ClientMessage::NegotiationDone { ans, .. }) => ans,
            other => panic!("expected peer:nego:done, got {:?}", other),
        };
        assert!(ans.sdp.contains("e-a"));
        assert_eq!(callee.state(), NegotiationState::Stable);

        caller.handle_renegotiation_answer(&ans).await.unwrap();
        assert_eq!(caller.state(), NegotiationState::Stable);
        assert!(sent(&mut caller_out).is_empty());
        assert!(sent(&mut callee_out).is_empty());
    }

    #[tokio::test]
    async fn discarded_session_ignores_late_messages() {
        let (caller, _, _, _) = established_pair().await;
        caller.discard_session();

        assert_eq!(caller.state(), NegotiationState::Idle);
        assert_eq!(
            caller
                .handle_renegotiation_answer(&SessionDescription::answer(
                    "v=0".into()
                ))
                .await,
            Err(CallError::NoSession)
        );
        assert_eq!(caller.on_negotiation_needed().await, Ok(()));
    }
}
