//! Runs a scripted call between two clients over the in-process relay.

use std::{error::Error, rc::Rc, time::Duration};

use duo_call::{
    sys::MediaDevices, CallState, Config, LocalRelay, NegotiationState,
    RoomController,
};
use tokio::{task, time::timeout};
use tracing::info;
use tracing_subscriber::EnvFilter;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = Config::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    task::LocalSet::new()
        .run_until(async move {
            let relay = LocalRelay::new();
            let room = config.room.clone();

            let (_, caller_link) = relay.connect();
            let caller = RoomController::new(
                config.clone().with_identity("caller", room.clone()),
                caller_link,
                Rc::new(MediaDevices::new("caller")),
            );
            let (_, callee_link) = relay.connect();
            let callee = RoomController::new(
                config.with_identity("callee", room),
                callee_link,
                Rc::new(MediaDevices::new("callee")),
            );

            caller.join()?;
            while caller.joined_room().is_none() {
                task::yield_now().await;
            }
            callee.join()?;
            while caller.remote_participant().is_none() {
                task::yield_now().await;
            }

            caller.connect_call().await?;
            timeout(STEP_TIMEOUT, caller.when_call_state(CallState::Connected))
                .await?;
            timeout(STEP_TIMEOUT, callee.when_call_state(CallState::Connected))
                .await?;
            info!("both sides connected");

            callee.send_streams()?;
            timeout(STEP_TIMEOUT, async {
                while caller.remote_stream().map_or(0, |s| s.tracks.len()) < 2
                    || callee.remote_stream().map_or(0, |s| s.tracks.len()) < 2
                {
                    task::yield_now().await;
                }
            })
            .await?;
            timeout(
                STEP_TIMEOUT,
                caller.when_negotiation_state(NegotiationState::Stable),
            )
            .await?;
            info!("media flowing in both directions");

            info!(muted = caller.toggle_local_mute(), "caller microphone");
            info!(muted = callee.toggle_remote_mute(), "callee playback");

            info!(
                messages = relay.history().len(),
                "relay forwarded all signaling"
            );
            caller.leave();
            callee.leave();

            Ok::<_, Box<dyn Error>>(())
        })
        .await
}
