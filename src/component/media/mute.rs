use futures::stream::LocalBoxStream;
use medea_reactive::ObservableCell;

use crate::sys::{MediaKind, MediaStreamTrack};

/// Media direction, as seen from the local client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Outgoing tracks. Muting turns off what the peer receives.
    Send,

    /// Incoming tracks. Muting only suppresses local playback.
    Recv,
}

/// Audio mute flags of both directions.
pub struct MuteState {
    send_audio: ObservableCell<bool>,
    recv_audio: ObservableCell<bool>,
}

impl Default for MuteState {
    fn default() -> Self {
        Self {
            send_audio: ObservableCell::new(false),
            recv_audio: ObservableCell::new(false),
        }
    }
}

impl MuteState {
    fn cell(&self, direction: Direction) -> &ObservableCell<bool> {
        match direction {
            Direction::Send => &self.send_audio,
            Direction::Recv => &self.recv_audio,
        }
    }

    pub fn is_muted(&self, direction: Direction) -> bool {
        self.cell(direction).get()
    }

    pub fn set_muted(&self, direction: Direction, muted: bool) {
        self.cell(direction).set(muted);
    }

    pub fn subscribe(
        &self,
        direction: Direction,
    ) -> LocalBoxStream<'static, bool> {
        self.cell(direction).subscribe()
    }

    /// Makes the audio tracks among `tracks` follow the mute flag of
    /// `direction`.
    pub fn apply<'a>(
        &self,
        direction: Direction,
        tracks: impl IntoIterator<Item = &'a MediaStreamTrack>,
    ) {
        let enabled = !self.is_muted(direction);
        tracks
            .into_iter()
            .filter(|t| t.kind() == MediaKind::Audio)
            .for_each(|t| t.set_enabled(enabled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_only_touches_audio() {
        let mute = MuteState::default();
        let tracks = vec![
            MediaStreamTrack::new("a", MediaKind::Audio),
            MediaStreamTrack::new("v", MediaKind::Video),
        ];

        mute.set_muted(Direction::Recv, true);
        mute.apply(Direction::Recv, &tracks);
        assert!(!tracks[0].enabled());
        assert!(tracks[1].enabled());

        mute.apply(Direction::Send, &tracks);
        assert!(tracks[0].enabled());
    }
}
