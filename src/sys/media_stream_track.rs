use std::{cell::Cell, fmt, rc::Rc};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct InnerTrack {
    id: String,
    kind: MediaKind,
    enabled: Cell<bool>,
    ended: Cell<bool>,
}

/// Handle to a single audio or video track. Clones share the same track.
#[derive(Clone)]
pub struct MediaStreamTrack(Rc<InnerTrack>);

impl MediaStreamTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self(Rc::new(InnerTrack {
            id: id.into(),
            kind,
            enabled: Cell::new(true),
            ended: Cell::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn kind(&self) -> MediaKind {
        self.0.kind
    }

    pub fn enabled(&self) -> bool {
        self.0.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.enabled.set(enabled);
    }

    pub fn stop(&self) {
        self.0.enabled.set(false);
        self.0.ended.set(true);
    }

    pub fn is_ended(&self) -> bool {
        self.0.ended.get()
    }
}

impl PartialEq for MediaStreamTrack {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl fmt::Debug for MediaStreamTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStreamTrack")
            .field("id", &self.0.id)
            .field("kind", &self.0.kind)
            .field("enabled", &self.0.enabled.get())
            .finish()
    }
}

/// Group of tracks sharing one stream id.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaStreamTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn tracks_of(
        &self,
        kind: MediaKind,
    ) -> impl Iterator<Item = &MediaStreamTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }
}
