use std::{future::Future, rc::Rc, time::Duration};

use duo_call::{
    proto::{
        ClientMessage, EventKind, ParticipantId, ServerMessage,
        SessionDescription,
    },
    sys::{MediaDevices, MediaKind},
    CallError, CallState, Config, LocalRelay, NegotiationState,
    RoomController, SignalingLink,
};
use tokio::{
    task::{yield_now, LocalSet},
    time::timeout,
};

const STEP: Duration = Duration::from_secs(2);

struct Client {
    id: ParticipantId,
    link: SignalingLink,
    devices: Rc<MediaDevices>,
    room: RoomController,
}

fn client(relay: &LocalRelay, name: &str, auto_answer: bool) -> Client {
    let (id, link) = relay.connect();
    let devices = Rc::new(MediaDevices::new(name));
    let mut config = Config::default().with_identity(name, "42");
    config.auto_answer = auto_answer;
    let room =
        RoomController::new(config, link.clone(), Rc::clone(&devices));
    Client {
        id,
        link,
        devices,
        room,
    }
}

fn run<F: Future<Output = ()>>(test: F) -> impl Future<Output = ()> {
    let local = LocalSet::new();
    async move { local.run_until(test).await }
}

async fn settle() {
    for _ in 0..50 {
        yield_now().await;
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    timeout(STEP, async {
        while !cond() {
            yield_now().await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

/// Caller joins first, callee second, so only the caller learns the
/// callee's id from `user:joined`.
async fn joined_pair(
    relay: &LocalRelay,
    auto_answer: bool,
) -> (Client, Client) {
    let caller = client(relay, "alice", true);
    let callee = client(relay, "bob", auto_answer);

    caller.room.join().unwrap();
    eventually("caller join ack", || caller.room.joined_room().is_some()).await;
    callee.room.join().unwrap();
    eventually("user:joined", || caller.room.remote_participant().is_some())
        .await;

    (caller, callee)
}

async fn connected_pair(relay: &LocalRelay) -> (Client, Client) {
    let (caller, callee) = joined_pair(relay, true).await;
    caller.room.connect_call().await.unwrap();
    timeout(STEP, caller.room.when_call_state(CallState::Connected))
        .await
        .unwrap();
    timeout(STEP, callee.room.when_call_state(CallState::Connected))
        .await
        .unwrap();
    (caller, callee)
}

async fn stable(c: &Client) {
    timeout(STEP, c.room.when_negotiation_state(NegotiationState::Stable))
        .await
        .unwrap();
}

fn remote_tracks(c: &Client) -> usize {
    c.room.remote_stream().map_or(0, |s| s.tracks.len())
}

fn offers_sent(relay: &LocalRelay, c: &Client) -> Vec<SessionDescription> {
    relay
        .sent_by(&c.id)
        .into_iter()
        .filter_map(|msg| match msg {
            ClientMessage::NegotiationNeeded { offer, .. } => Some(offer),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn call_in_room_42_connects_both_sides() {
    run(async {
        let relay = LocalRelay::new();
        let (caller, callee) = joined_pair(&relay, true).await;
        assert_eq!(caller.room.remote_participant().unwrap().id, callee.id);

        caller.room.connect_call().await.unwrap();
        eventually("user:call forwarded", || {
            relay.sent_by(&caller.id).iter().any(|msg| {
                matches!(
                    msg,
                    ClientMessage::CallUser { to, .. } if *to == callee.id
                )
            })
        })
        .await;

        timeout(STEP, callee.room.when_call_state(CallState::Connected))
            .await
            .unwrap();
        timeout(STEP, caller.room.when_call_state(CallState::Connected))
            .await
            .unwrap();
        assert!(relay.sent_by(&callee.id).iter().any(|msg| matches!(
            msg,
            ClientMessage::CallAccepted { to, .. } if *to == caller.id
        )));
        assert_eq!(
            callee.room.remote_participant().unwrap().id,
            caller.id,
        );
        assert_eq!(callee.room.own_id(), Some(callee.id.clone()));
        assert_eq!(callee.room.joined_room().as_deref(), Some("42"));
    })
    .await;
}

#[tokio::test]
async fn both_caller_tracks_ride_one_renegotiation() {
    run(async {
        let relay = LocalRelay::new();
        let (caller, callee) = connected_pair(&relay).await;

        eventually("callee remote tracks", || remote_tracks(&callee) == 2)
            .await;
        stable(&caller).await;
        settle().await;

        let offers = offers_sent(&relay, &caller);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].sdp.matches("a=msid:").count(), 2);
        assert!(caller.room.streams_sent());

        let before = relay.history().len();
        caller.room.send_streams().unwrap();
        settle().await;
        assert_eq!(relay.history().len(), before);
    })
    .await;
}

#[tokio::test]
async fn callee_streams_reach_caller() {
    run(async {
        let relay = LocalRelay::new();
        let (caller, callee) = connected_pair(&relay).await;
        eventually("callee remote tracks", || remote_tracks(&callee) == 2)
            .await;
        stable(&caller).await;
        assert_eq!(remote_tracks(&caller), 0);

        callee.room.send_streams().unwrap();
        eventually("caller remote tracks", || remote_tracks(&caller) == 2)
            .await;
        stable(&callee).await;
        settle().await;

        assert_eq!(offers_sent(&relay, &callee).len(), 1);
        assert_eq!(caller.room.call_state(), CallState::Connected);
        assert_eq!(callee.room.call_state(), CallState::Connected);
    })
    .await;
}

#[tokio::test]
async fn streams_sent_from_both_sides_at_once_converge() {
    run(async {
        let relay = LocalRelay::new();
        let (caller, callee) = joined_pair(&relay, true).await;
        caller.room.connect_call().await.unwrap();
        timeout(STEP, callee.room.when_call_state(CallState::Connected))
            .await
            .unwrap();
        // Races the caller's own renegotiation after `call:accepted`.
        callee.room.send_streams().unwrap();

        eventually("tracks on both sides", || {
            remote_tracks(&caller) == 2 && remote_tracks(&callee) == 2
        })
        .await;
        stable(&caller).await;
        stable(&callee).await;
        settle().await;

        assert_eq!(caller.room.negotiation_state(), NegotiationState::Stable);
        assert_eq!(callee.room.negotiation_state(), NegotiationState::Stable);
        assert_eq!(caller.room.call_state(), CallState::Connected);
        assert_eq!(callee.room.call_state(), CallState::Connected);
    })
    .await;
}

#[tokio::test]
async fn local_mute_disables_outgoing_audio() {
    run(async {
        let relay = LocalRelay::new();
        let (caller, _callee) = connected_pair(&relay).await;
        let tracks = caller.room.local_tracks().unwrap();
        let audio = || tracks.of_kind(MediaKind::Audio).next().unwrap();

        caller.room.set_local_mute(true);
        caller.room.set_local_mute(true);
        assert!(caller.room.is_local_muted());
        assert!(!audio().enabled());
        assert!(tracks.of_kind(MediaKind::Video).all(|t| t.enabled()));

        assert!(!caller.room.toggle_local_mute());
        assert!(audio().enabled());
    })
    .await;
}

#[tokio::test]
async fn remote_mute_stays_local() {
    run(async {
        let relay = LocalRelay::new();
        let (_caller, callee) = connected_pair(&relay).await;
        eventually("callee remote tracks", || remote_tracks(&callee) == 2)
            .await;
        settle().await;

        let before = relay.history().len();
        assert!(callee.room.toggle_remote_mute());
        let stream = callee.room.remote_stream().unwrap();
        assert!(stream.tracks_of(MediaKind::Audio).all(|t| !t.enabled()));
        assert!(stream.tracks_of(MediaKind::Video).all(|t| t.enabled()));

        assert!(!callee.room.toggle_remote_mute());
        settle().await;
        assert_eq!(relay.history().len(), before);
        assert!(stream.tracks_of(MediaKind::Audio).all(|t| t.enabled()));
    })
    .await;
}

#[tokio::test]
async fn denied_media_returns_callee_to_idle() {
    run(async {
        let relay = LocalRelay::new();
        let (caller, callee) = joined_pair(&relay, true).await;
        callee.devices.set_permission_granted(false);

        caller.room.connect_call().await.unwrap();
        eventually("callee ringing then idle", || {
            callee.room.remote_participant().is_some()
        })
        .await;
        settle().await;

        assert_eq!(callee.room.call_state(), CallState::Idle);
        assert!(relay.sent_by(&callee.id).iter().all(|msg| {
            !matches!(msg, ClientMessage::CallAccepted { .. })
        }));
        assert_eq!(caller.room.call_state(), CallState::Connecting);
    })
    .await;
}

#[tokio::test]
async fn caller_without_media_never_calls() {
    run(async {
        let relay = LocalRelay::new();
        let (caller, callee) = joined_pair(&relay, true).await;
        caller.devices.set_device_present(MediaKind::Video, false);

        let err = caller.room.connect_call().await.unwrap_err();
        assert!(matches!(err, CallError::MediaUnavailable(_)));
        assert_eq!(caller.room.call_state(), CallState::Idle);
        settle().await;
        assert_eq!(callee.room.call_state(), CallState::Idle);
        assert!(relay.sent_by(&caller.id).iter().all(|msg| {
            matches!(msg, ClientMessage::JoinRoom { .. })
        }));
    })
    .await;
}

#[tokio::test]
async fn calling_an_empty_room_fails() {
    run(async {
        let relay = LocalRelay::new();
        let alone = client(&relay, "alice", true);
        alone.room.join().unwrap();
        eventually("join ack", || alone.room.joined_room().is_some()).await;

        let err = alone.room.connect_call().await.unwrap_err();
        assert_eq!(err, CallError::NoRemoteParticipant);
        assert_eq!(err.user_message(), "nobody else is in the room yet");
        assert_eq!(alone.room.call_state(), CallState::Idle);
    })
    .await;
}

#[tokio::test]
async fn stray_final_answer_changes_nothing() {
    run(async {
        let relay = LocalRelay::new();
        let (caller, _callee) = connected_pair(&relay).await;
        stable(&caller).await;
        settle().await;

        caller.link.deliver(ServerMessage::NegotiationFinal {
            ans: SessionDescription::answer("v=0\r\n".into()),
        });
        settle().await;

        assert_eq!(caller.room.call_state(), CallState::Connected);
        assert_eq!(caller.room.negotiation_state(), NegotiationState::Stable);
    })
    .await;
}

#[tokio::test]
async fn manual_answer_waits_for_accept() {
    run(async {
        let relay = LocalRelay::new();
        let (caller, callee) = joined_pair(&relay, false).await;

        caller.room.connect_call().await.unwrap();
        eventually("callee ringing", || {
            matches!(callee.room.call_state(), CallState::Ringing(_))
        })
        .await;
        match callee.room.call_state() {
            CallState::Ringing(from) => assert_eq!(from.id, caller.id),
            state => panic!("unexpected {:?}", state),
        }
        settle().await;
        assert_eq!(caller.room.call_state(), CallState::Connecting);

        callee.room.accept_call().await.unwrap();
        assert_eq!(callee.room.call_state(), CallState::Connected);
        timeout(STEP, caller.room.when_call_state(CallState::Connected))
            .await
            .unwrap();
    })
    .await;
}

#[tokio::test]
async fn leaving_ignores_later_messages() {
    run(async {
        let relay = LocalRelay::new();
        let (caller, callee) = connected_pair(&relay).await;
        settle().await;

        callee.room.leave();
        assert_eq!(callee.room.call_state(), CallState::Idle);
        settle().await;
        assert_eq!(callee.link.subscribers_count(EventKind::IncomingCall), 0);
        assert_eq!(
            callee.link.subscribers_count(EventKind::NegotiationNeeded),
            0,
        );

        callee.link.deliver(ServerMessage::IncomingCall {
            from: caller.id.clone(),
            offer: SessionDescription::offer("v=0\r\n".into()),
        });
        settle().await;
        assert_eq!(callee.room.call_state(), CallState::Idle);
        assert!(callee.room.local_tracks().is_none());
    })
    .await;
}

#[tokio::test]
async fn hang_up_releases_media_but_stays_in_room() {
    run(async {
        let relay = LocalRelay::new();
        let (caller, _callee) = connected_pair(&relay).await;
        let first = caller.room.local_tracks().unwrap();

        caller.room.hang_up();
        assert_eq!(caller.room.call_state(), CallState::Idle);
        assert_eq!(caller.room.negotiation_state(), NegotiationState::Idle);
        assert!(first.tracks.iter().all(|t| t.is_ended()));
        assert!(caller.room.remote_participant().is_some());
    })
    .await;
}

/// Hangs up a connected pair, then has both sides call each other at once.
/// Returns who answered among the crossing calls.
async fn crossing_calls(
    relay: &LocalRelay,
) -> (Client, Client, ParticipantId) {
    let (alice, bob) = connected_pair(relay).await;
    eventually("bob remote tracks", || remote_tracks(&bob) == 2).await;
    stable(&alice).await;
    settle().await;
    alice.room.hang_up();
    bob.room.hang_up();
    settle().await;
    let start = relay.history().len();

    let (a, b) =
        tokio::join!(alice.room.connect_call(), bob.room.connect_call());
    a.unwrap();
    b.unwrap();
    timeout(STEP, alice.room.when_call_state(CallState::Connected))
        .await
        .unwrap();
    timeout(STEP, bob.room.when_call_state(CallState::Connected))
        .await
        .unwrap();

    alice.room.send_streams().unwrap();
    bob.room.send_streams().unwrap();
    eventually("tracks on both sides", || {
        remote_tracks(&alice) == 2 && remote_tracks(&bob) == 2
    })
    .await;
    stable(&alice).await;
    stable(&bob).await;
    settle().await;

    let answers: Vec<_> = relay.history()[start..]
        .iter()
        .filter(|(_, msg)| matches!(msg, ClientMessage::CallAccepted { .. }))
        .map(|(from, _)| from.clone())
        .collect();
    assert_eq!(answers.len(), 1, "crossing calls answered {:?}", answers);
    let answered_by = answers[0].clone();

    (alice, bob, answered_by)
}

#[tokio::test]
async fn crossing_calls_smaller_id_answers() {
    run(async {
        let relay = LocalRelay::new();
        let (alice, bob, answered_by) = crossing_calls(&relay).await;

        assert!(alice.id < bob.id);
        assert_eq!(answered_by, alice.id);
        assert_eq!(alice.room.call_state(), CallState::Connected);
        assert_eq!(bob.room.call_state(), CallState::Connected);
    })
    .await;
}

#[tokio::test]
async fn crossing_calls_without_ids_later_joiner_answers() {
    run(async {
        let relay = LocalRelay::with_anonymous_acks();
        let (alice, bob, answered_by) = crossing_calls(&relay).await;

        assert_eq!(alice.room.own_id(), None);
        assert_eq!(bob.room.own_id(), None);
        assert_eq!(answered_by, bob.id);
        assert_eq!(alice.room.negotiation_state(), NegotiationState::Stable);
        assert_eq!(bob.room.negotiation_state(), NegotiationState::Stable);
    })
    .await;
}
