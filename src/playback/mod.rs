//! Shared musical clock driven by local and remote playback commands

pub mod clock;
pub mod commands;
pub mod measure;
pub mod tempo;

pub use clock::{PlaybackClock, PlaybackMode, PlaybackSink, PlaybackSnapshot, PlaybackStatus, SongInfo, SongMeta};
pub use commands::{PresenterMessage, RemoteCommand, SongSelection};
pub use measure::{Measure, MeasureMap};
pub use tempo::{bpm_for_quarter_ms, quarter_note_ms, NoteUnit, TempoRamp};
