use std::{cell::RefCell, rc::Rc};

use tracing::{debug, info};

use crate::{
    error::CallError,
    sys::{MediaDevices, MediaKind, MediaStreamConstraints, MediaStreamTrack},
};

/// Local tracks of one capture, in capture order.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackSet {
    pub stream_id: String,
    pub tracks: Vec<MediaStreamTrack>,
}

impl TrackSet {
    pub fn of_kind(
        &self,
        kind: MediaKind,
    ) -> impl Iterator<Item = &MediaStreamTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Owner of the local [`TrackSet`].
pub struct MediaSource {
    devices: Rc<MediaDevices>,
    tracks: RefCell<Option<TrackSet>>,
}

impl MediaSource {
    pub fn new(devices: Rc<MediaDevices>) -> Self {
        Self {
            devices,
            tracks: RefCell::new(None),
        }
    }

    /// Captures local media, or returns the tracks already held.
    pub async fn acquire(
        &self,
        constraints: MediaStreamConstraints,
    ) -> Result<TrackSet, CallError> {
        if let Some(tracks) = self.tracks() {
            return Ok(tracks);
        }

        let (stream_id, tracks) =
            self.devices.get_user_media(constraints).await?;
        let set = TrackSet { stream_id, tracks };
        info!(
            stream = %set.stream_id,
            tracks = set.len(),
            "local media acquired",
        );

        // A concurrent acquisition may have finished first.
        let mut held = self.tracks.borrow_mut();
        match held.as_ref() {
            Some(existing) => {
                set.tracks.iter().for_each(MediaStreamTrack::stop);
                Ok(existing.clone())
            }
            None => {
                *held = Some(set.clone());
                Ok(set)
            }
        }
    }

    pub fn set_enabled(&self, kind: MediaKind, enabled: bool) {
        if let Some(set) = self.tracks.borrow().as_ref() {
            for track in set.of_kind(kind) {
                track.set_enabled(enabled);
            }
            debug!(%kind, enabled, "local tracks toggled");
        }
    }

    pub fn tracks(&self) -> Option<TrackSet> {
        self.tracks.borrow().clone()
    }

    /// Stops and forgets every held track.
    pub fn release(&self) {
        if let Some(set) = self.tracks.borrow_mut().take() {
            set.tracks.iter().for_each(MediaStreamTrack::stop);
            info!(stream = %set.stream_id, "local media released");
        }
    }
}
