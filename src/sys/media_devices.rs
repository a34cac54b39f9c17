use std::cell::Cell;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::yield_now;

use super::{MediaKind, MediaStreamTrack};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaStreamConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaStreamConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GetUserMediaError {
    #[error("permission to capture media was denied")]
    PermissionDenied,

    #[error("no {0} capture device found")]
    NotFound(MediaKind),

    #[error("constraints request no media")]
    EmptyConstraints,
}

/// Capture devices of the local machine.
pub struct MediaDevices {
    permission_granted: Cell<bool>,
    has_microphone: Cell<bool>,
    has_camera: Cell<bool>,
    label: String,
    captures: Cell<u32>,
}

impl MediaDevices {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            permission_granted: Cell::new(true),
            has_microphone: Cell::new(true),
            has_camera: Cell::new(true),
            label: label.into(),
            captures: Cell::new(0),
        }
    }

    pub fn set_permission_granted(&self, granted: bool) {
        self.permission_granted.set(granted);
    }

    pub fn set_device_present(&self, kind: MediaKind, present: bool) {
        match kind {
            MediaKind::Audio => self.has_microphone.set(present),
            MediaKind::Video => self.has_camera.set(present),
        }
    }

    /// Captures one track per requested kind, all or nothing.
    pub async fn get_user_media(
        &self,
        constraints: MediaStreamConstraints,
    ) -> Result<(String, Vec<MediaStreamTrack>), GetUserMediaError> {
        yield_now().await;

        if !constraints.audio && !constraints.video {
            return Err(GetUserMediaError::EmptyConstraints);
        }
        if !self.permission_granted.get() {
            return Err(GetUserMediaError::PermissionDenied);
        }
        if constraints.audio && !self.has_microphone.get() {
            return Err(GetUserMediaError::NotFound(MediaKind::Audio));
        }
        if constraints.video && !self.has_camera.get() {
            return Err(GetUserMediaError::NotFound(MediaKind::Video));
        }

        let n = self.captures.get() + 1;
        self.captures.set(n);
        let stream_id = format!("{}-stream-{}", self.label, n);

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaStreamTrack::new(
                format!("{}-audio-{}", self.label, n),
                MediaKind::Audio,
            ));
        }
        if constraints.video {
            tracks.push(MediaStreamTrack::new(
                format!("{}-video-{}", self.label, n),
                MediaKind::Video,
            ));
        }

        Ok((stream_id, tracks))
    }
}
