mod mute;
mod source;

pub use self::{
    mute::{Direction, MuteState},
    source::{MediaSource, TrackSet},
};
