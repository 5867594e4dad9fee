//! Musical-time playback state machine
//!
//! The clock never reads time for its decisions. Every operation takes the
//! millisecond timestamp (on the shared [`MonotonicClock`]) at which it
//! logically happened, already corrected for network latency, and the
//! position at any later instant follows from the reference pair
//! `(time_at_reference, reference_time)` plus an optional tempo ramp.

use serde::{Deserialize, Serialize};

use crate::playback::measure::MeasureMap;
use crate::playback::tempo::{bpm_for_quarter_ms, effective_bpm, quarter_note_ms, NoteUnit, TempoRamp};
use crate::time::MonotonicClock;

/// Beat intervals outside this window are treated as missed taps
const MIN_BEAT_INTERVAL_MS: f64 = 150.0;
const MAX_BEAT_INTERVAL_MS: f64 = 4_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Unloaded,
    Paused,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    /// Tempo comes from the song
    Normal,
    /// Tempo follows tapped beats
    Synced,
}

/// What the host supplies when loading a song
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongMeta {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub bpm: Option<f64>,
    #[serde(default)]
    pub bpm_unit: Option<NoteUnit>,
}

/// Loaded song with its live and authored tempo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongInfo {
    pub id: String,
    pub title: String,
    pub bpm: f64,
    pub bpm_unit: NoteUnit,
    pub original_bpm: f64,
    pub original_bpm_unit: NoteUnit,
}

impl SongInfo {
    fn from_meta(meta: SongMeta) -> Self {
        let bpm = effective_bpm(meta.bpm.unwrap_or_default());
        let bpm_unit = meta.bpm_unit.unwrap_or_default();
        Self {
            id: meta.id,
            title: meta.title,
            bpm,
            bpm_unit,
            original_bpm: bpm,
            original_bpm_unit: bpm_unit,
        }
    }

    pub fn quarter_ms(&self) -> f64 {
        quarter_note_ms(self.bpm, self.bpm_unit)
    }

    pub fn original_quarter_ms(&self) -> f64 {
        quarter_note_ms(self.original_bpm, self.original_bpm_unit)
    }
}

/// Broadcast form of the playback state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSnapshot {
    pub status: PlaybackStatus,
    pub mode: PlaybackMode,
    pub song: Option<SongInfo>,
    pub time_at_reference: f64,
    pub reference_time: f64,
    /// Sender's clock when the snapshot was taken
    pub sync_time: f64,
    pub can_undo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo_ramp: Option<TempoRamp>,
}

/// Receives every state change
pub trait PlaybackSink: Send {
    fn publish(&mut self, snapshot: &PlaybackSnapshot);
}

impl<F> PlaybackSink for F
where
    F: FnMut(&PlaybackSnapshot) + Send,
{
    fn publish(&mut self, snapshot: &PlaybackSnapshot) {
        self(snapshot)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Timeline {
    status: PlaybackStatus,
    mode: PlaybackMode,
    song: Option<SongInfo>,
    time_at_reference: f64,
    reference_time: f64,
    tempo_ramp: Option<TempoRamp>,
    last_beat: Option<f64>,
}

impl Timeline {
    fn unloaded() -> Self {
        Self {
            status: PlaybackStatus::Unloaded,
            mode: PlaybackMode::Normal,
            song: None,
            time_at_reference: 0.0,
            reference_time: 0.0,
            tempo_ramp: None,
            last_beat: None,
        }
    }
}

pub struct PlaybackClock {
    state: Timeline,
    /// Single-level undo for beat sync
    undo: Option<Timeline>,
    measures: MeasureMap,
    clock: MonotonicClock,
    sink: Box<dyn PlaybackSink>,
}

impl PlaybackClock {
    pub fn new(clock: MonotonicClock, sink: Box<dyn PlaybackSink>) -> Self {
        Self {
            state: Timeline::unloaded(),
            undo: None,
            measures: MeasureMap::default(),
            clock,
            sink,
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        self.state.status
    }

    pub fn mode(&self) -> PlaybackMode {
        self.state.mode
    }

    pub fn song(&self) -> Option<&SongInfo> {
        self.state.song.as_ref()
    }

    pub fn measures(&self) -> &MeasureMap {
        &self.measures
    }

    pub fn can_undo(&self) -> bool {
        self.undo.is_some()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            status: self.state.status,
            mode: self.state.mode,
            song: self.state.song.clone(),
            time_at_reference: self.state.time_at_reference,
            reference_time: self.state.reference_time,
            sync_time: self.clock.now_ms(),
            can_undo: self.undo.is_some(),
            tempo_ramp: self.state.tempo_ramp,
        }
    }

    /// Position in ms (at the live tempo) at instant `t`
    pub fn current_time(&self, t: f64) -> f64 {
        match self.state.status {
            PlaybackStatus::Unloaded => 0.0,
            PlaybackStatus::Paused => self.state.time_at_reference,
            PlaybackStatus::Playing => self.state.time_at_reference + self.elapsed_ms(t),
        }
    }

    /// Position in quarter-note beats at instant `t`
    pub fn current_beats(&self, t: f64) -> f64 {
        let quarter_ms = self.quarter_ms();
        if quarter_ms > 0.0 {
            self.current_time(t) / quarter_ms
        } else {
            0.0
        }
    }

    pub fn load_song(&mut self, meta: SongMeta, measures: MeasureMap) {
        tracing::info!(song_id = %meta.id, title = %meta.title, "Loading song");
        self.state = Timeline {
            status: PlaybackStatus::Paused,
            song: Some(SongInfo::from_meta(meta)),
            ..Timeline::unloaded()
        };
        self.measures = measures;
        self.undo = None;
        self.broadcast();
    }

    pub fn unload_song(&mut self) {
        self.state = Timeline::unloaded();
        self.measures = MeasureMap::default();
        self.undo = None;
        self.broadcast();
    }

    pub fn play(&mut self, t: f64) -> bool {
        self.start(t, PlaybackMode::Normal)
    }

    /// Start playing with the tempo driven by [`sync_beat`](Self::sync_beat);
    /// `t` counts as the first beat.
    pub fn play_synced(&mut self, t: f64) -> bool {
        self.start(t, PlaybackMode::Synced)
    }

    fn start(&mut self, t: f64, mode: PlaybackMode) -> bool {
        if self.state.status != PlaybackStatus::Paused {
            return false;
        }
        self.state.status = PlaybackStatus::Playing;
        self.state.mode = mode;
        self.state.reference_time = t;
        self.state.tempo_ramp = None;
        self.state.last_beat = (mode == PlaybackMode::Synced).then_some(t);
        self.undo = None;
        self.broadcast();
        true
    }

    /// Freeze the position. With `time_override` the clock pauses at that
    /// position even if it was not playing.
    pub fn pause(&mut self, t: f64, time_override: Option<f64>) -> bool {
        if self.state.status == PlaybackStatus::Unloaded {
            return false;
        }
        if self.state.status != PlaybackStatus::Playing && time_override.is_none() {
            return false;
        }
        let position = time_override.unwrap_or_else(|| self.current_time(t));
        self.state.status = PlaybackStatus::Paused;
        self.state.time_at_reference = position;
        self.state.reference_time = 0.0;
        self.state.tempo_ramp = None;
        self.state.last_beat = None;
        self.undo = None;
        self.broadcast();
        true
    }

    pub fn jump(&mut self, time_ms: f64, t: f64) -> bool {
        if self.state.status == PlaybackStatus::Unloaded {
            return false;
        }
        self.state.time_at_reference = time_ms.max(0.0);
        if self.state.status == PlaybackStatus::Playing {
            self.state.reference_time = t;
        }
        self.state.tempo_ramp = None;
        self.undo = None;
        self.broadcast();
        true
    }

    pub fn jump_to_start(&mut self, t: f64) -> bool {
        self.jump(0.0, t)
    }

    /// Move one measure forward (`direction > 0`) or back
    pub fn jump_measure(&mut self, direction: i32, t: f64) -> bool {
        if self.state.status == PlaybackStatus::Unloaded {
            return false;
        }
        let beats = self.current_beats(t);
        match self.measures.jump_target(beats, self.quarter_ms(), direction) {
            Some(target) => self.jump(target, t),
            None => false,
        }
    }

    /// Change the live tempo, keeping the musical position
    pub fn update_bpm(&mut self, bpm: f64, unit: NoteUnit, t: f64) -> bool {
        if self.state.song.is_none() {
            return false;
        }
        let beats = self.current_beats(t);
        if let Some(song) = self.state.song.as_mut() {
            song.bpm = effective_bpm(bpm);
            song.bpm_unit = unit;
        }
        self.state.time_at_reference = beats * self.quarter_ms();
        if self.state.status == PlaybackStatus::Playing {
            self.state.reference_time = t;
        }
        self.state.tempo_ramp = None;
        self.undo = None;
        self.broadcast();
        true
    }

    /// Register a tapped beat at `t`.
    ///
    /// The interval since the previous beat becomes the new quarter-note
    /// duration when plausible. The position snaps to the nearest whole
    /// beat, and with `interpolation_ms > 0` the tempo glides to the new
    /// value instead of switching at once.
    pub fn sync_beat(&mut self, t: f64, interpolation_ms: f64) -> bool {
        if self.state.status != PlaybackStatus::Playing || self.state.mode != PlaybackMode::Synced {
            return false;
        }
        self.settle_ramp(t);
        let Some(song) = self.state.song.as_ref() else {
            return false;
        };

        let current_quarter = song.quarter_ms();
        let bpm_unit = song.bpm_unit;
        let quarter_ms = match self.state.last_beat.map(|previous| t - previous) {
            Some(interval) if (MIN_BEAT_INTERVAL_MS..=MAX_BEAT_INTERVAL_MS).contains(&interval) => interval,
            _ => current_quarter,
        };
        let snapped = self.current_beats(t).round();
        let from_rate = self.rate_at(t);
        let to_rate = 1.0 / quarter_ms;

        self.undo = Some(self.state.clone());
        if let Some(song) = self.state.song.as_mut() {
            song.bpm = bpm_for_quarter_ms(quarter_ms, bpm_unit);
        }
        self.state.time_at_reference = snapped * quarter_ms;
        self.state.reference_time = t;
        self.state.last_beat = Some(t);
        self.state.tempo_ramp = (interpolation_ms > 0.0 && (from_rate - to_rate).abs() > f64::EPSILON).then_some(
            TempoRamp {
                start_time: t,
                duration_ms: interpolation_ms,
                from_rate,
                to_rate,
            },
        );

        tracing::debug!(
            beat = snapped,
            quarter_ms,
            ramp_ms = interpolation_ms,
            "Beat sync"
        );
        self.broadcast();
        true
    }

    /// Revert the last [`sync_beat`](Self::sync_beat). No-op without one.
    pub fn undo_beat(&mut self) -> bool {
        let Some(previous) = self.undo.take() else {
            return false;
        };
        self.state = previous;
        self.broadcast();
        true
    }

    /// Measure jump for synced playback: the tempo returns to the song's
    /// own and the target measure is placed using that tempo. Outside
    /// synced mode this is [`jump_measure`](Self::jump_measure).
    pub fn jump_synced(&mut self, direction: i32, t: f64) -> bool {
        if self.state.mode != PlaybackMode::Synced || self.state.status == PlaybackStatus::Unloaded {
            return self.jump_measure(direction, t);
        }
        let Some(original_quarter) = self.state.song.as_ref().map(SongInfo::original_quarter_ms) else {
            return false;
        };

        let beats = self.current_beats(t);
        let Some(target) = self.measures.jump_target(beats, original_quarter, direction) else {
            return false;
        };

        if let Some(song) = self.state.song.as_mut() {
            song.bpm = song.original_bpm;
            song.bpm_unit = song.original_bpm_unit;
        }
        self.state.time_at_reference = target.max(0.0);
        if self.state.status == PlaybackStatus::Playing {
            self.state.reference_time = t;
        }
        self.state.tempo_ramp = None;
        self.state.last_beat = None;
        self.undo = None;
        self.broadcast();
        true
    }

    fn quarter_ms(&self) -> f64 {
        self.state.song.as_ref().map_or(0.0, SongInfo::quarter_ms)
    }

    /// Fold a completed ramp into the reference point
    fn settle_ramp(&mut self, t: f64) {
        let Some(ramp) = self.state.tempo_ramp else {
            return;
        };
        if self.state.status != PlaybackStatus::Playing || !ramp.is_finished(t) {
            return;
        }
        let end = ramp.end_time().max(self.state.reference_time);
        self.state.time_at_reference = self.current_time(end);
        self.state.reference_time = end;
        self.state.tempo_ramp = None;
    }

    /// Quarter notes per ms at `t`
    fn rate_at(&self, t: f64) -> f64 {
        match self.state.tempo_ramp {
            Some(ramp) => ramp.rate_at(t),
            None => {
                let quarter_ms = self.quarter_ms();
                if quarter_ms > 0.0 {
                    1.0 / quarter_ms
                } else {
                    0.0
                }
            }
        }
    }

    fn elapsed_ms(&self, t: f64) -> f64 {
        match self.state.tempo_ramp {
            Some(ramp) => {
                let beats = ramp.beats_until(t) - ramp.beats_until(self.state.reference_time);
                beats * self.quarter_ms()
            }
            None => t - self.state.reference_time,
        }
    }

    fn broadcast(&mut self) {
        let snapshot = self.snapshot();
        self.sink.publish(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Published = Arc<Mutex<Vec<PlaybackSnapshot>>>;

    fn clock() -> (PlaybackClock, Published) {
        let published = Published::default();
        let sink = published.clone();
        let clock = PlaybackClock::new(
            MonotonicClock::new(),
            Box::new(move |snapshot: &PlaybackSnapshot| sink.lock().push(snapshot.clone())),
        );
        (clock, published)
    }

    fn loaded(bpm: f64) -> (PlaybackClock, Published) {
        let (mut clock, published) = clock();
        clock.load_song(
            SongMeta {
                id: "song-1".into(),
                title: "Opening".into(),
                bpm: Some(bpm),
                bpm_unit: Some(NoteUnit::Quarter),
            },
            MeasureMap::from_lengths(&[4.0, 4.0, 3.0, 4.0]),
        );
        published.lock().clear();
        (clock, published)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_load_defaults() {
        let (mut clock, published) = clock();
        clock.load_song(
            SongMeta {
                id: "x".into(),
                title: String::new(),
                bpm: None,
                bpm_unit: None,
            },
            MeasureMap::default(),
        );
        let song = clock.song().unwrap();
        assert_eq!(song.bpm, 120.0);
        assert_eq!(song.bpm_unit, NoteUnit::Quarter);
        assert_eq!(clock.status(), PlaybackStatus::Paused);
        assert_eq!(published.lock().len(), 1);

        clock.unload_song();
        assert_eq!(clock.status(), PlaybackStatus::Unloaded);
        assert_eq!(clock.current_time(5_000.0), 0.0);
        assert!(!clock.play(0.0));
    }

    #[test]
    fn test_play_advances_in_real_time() {
        let (mut clock, _) = loaded(120.0);
        assert!(clock.play(1_000.0));
        assert!(!clock.play(1_500.0));
        assert!(close(clock.current_time(2_000.0), 1_000.0));
        assert!(close(clock.current_beats(2_000.0), 2.0));
    }

    #[test]
    fn test_pause_then_play_keeps_position() {
        let (mut clock, _) = loaded(120.0);
        clock.play(0.0);
        assert!(clock.pause(1_500.0, None));
        assert!(close(clock.current_time(9_999.0), 1_500.0));
        clock.play(1_500.0);
        assert!(close(clock.current_time(1_500.0), 1_500.0));
    }

    #[test]
    fn test_pause_requires_playing_unless_overridden() {
        let (mut clock, published) = loaded(120.0);
        assert!(!clock.pause(100.0, None));
        assert!(published.lock().is_empty());
        assert!(clock.pause(100.0, Some(3_000.0)));
        assert!(close(clock.current_time(100.0), 3_000.0));
    }

    #[test]
    fn test_jump() {
        let (mut clock, _) = loaded(120.0);
        clock.jump(-50.0, 0.0);
        assert_eq!(clock.current_time(0.0), 0.0);
        assert_eq!(clock.status(), PlaybackStatus::Paused);

        clock.play(0.0);
        clock.jump(4_000.0, 1_000.0);
        assert!(close(clock.current_time(1_500.0), 4_500.0));
        clock.jump_to_start(2_000.0);
        assert!(close(clock.current_time(2_000.0), 0.0));
    }

    #[test]
    fn test_jump_measure() {
        let (mut clock, _) = loaded(120.0);
        clock.play(0.0);
        // Beat 5 is in the second bar
        assert!(clock.jump_measure(-1, 2_500.0));
        assert!(close(clock.current_time(2_500.0), 2_000.0));
        assert!(clock.jump_measure(1, 2_500.0));
        assert!(close(clock.current_time(2_500.0), 4_000.0));
    }

    #[test]
    fn test_update_bpm_keeps_beat_position() {
        let (mut clock, _) = loaded(120.0);
        clock.play(0.0);
        assert!(clock.update_bpm(60.0, NoteUnit::Quarter, 1_000.0));
        assert!(close(clock.current_beats(1_000.0), 2.0));
        assert!(close(clock.current_beats(2_000.0), 3.0));
        assert_eq!(clock.song().unwrap().original_bpm, 120.0);
    }

    #[test]
    fn test_sync_beat_adopts_tapped_tempo() {
        let (mut clock, _) = loaded(120.0);
        assert!(clock.play(0.0));
        assert!(!clock.sync_beat(400.0, 0.0), "normal mode ignores beats");

        clock.pause(0.0, Some(0.0));
        clock.play_synced(0.0);
        assert!(clock.sync_beat(400.0, 0.0));
        assert!(close(clock.song().unwrap().bpm, 150.0));
        assert!(close(clock.current_beats(400.0), 1.0));
        assert!(close(clock.current_beats(800.0), 2.0));
        assert!(clock.can_undo());

        assert!(clock.undo_beat());
        assert!(!clock.can_undo());
        assert!(close(clock.song().unwrap().bpm, 120.0));
        assert!(close(clock.current_time(800.0), 800.0));
    }

    #[test]
    fn test_sync_beat_ignores_implausible_interval() {
        let (mut clock, _) = loaded(120.0);
        clock.play_synced(0.0);
        assert!(clock.sync_beat(5_000.0, 0.0));
        assert!(close(clock.song().unwrap().bpm, 120.0));
        assert!(close(clock.current_time(5_000.0), 5_000.0));
    }

    #[test]
    fn test_sync_beat_ramps_tempo() {
        let (mut clock, _) = loaded(120.0);
        clock.play_synced(0.0);
        // Tap at 250ms: target 240bpm reached over one second
        assert!(clock.sync_beat(250.0, 1_000.0));
        let snapshot = clock.snapshot();
        assert!(snapshot.tempo_ramp.is_some());
        assert!(close(clock.current_beats(250.0), 1.0));
        assert!(close(clock.current_beats(1_250.0), 4.0));
        assert!(close(clock.current_beats(1_500.0), 5.0));

        // The next beat starts from the settled tempo; undo returns there
        assert!(clock.sync_beat(1_500.0, 0.0));
        assert!(clock.undo_beat());
        let settled = clock.snapshot();
        assert!(settled.tempo_ramp.is_none());
        assert!(close(settled.reference_time, 1_250.0));
        assert!(close(clock.current_beats(1_500.0), 5.0));
    }

    #[test]
    fn test_undo_without_beat_is_noop() {
        let (mut clock, published) = loaded(120.0);
        clock.play_synced(0.0);
        published.lock().clear();
        let before = clock.snapshot();
        assert!(!clock.undo_beat());
        assert!(published.lock().is_empty());
        assert_eq!(clock.snapshot().time_at_reference, before.time_at_reference);
    }

    #[test]
    fn test_other_operations_clear_undo() {
        let (mut clock, _) = loaded(120.0);
        clock.play_synced(0.0);
        clock.sync_beat(400.0, 0.0);
        clock.sync_beat(800.0, 0.0);
        assert!(clock.can_undo());
        clock.jump(0.0, 900.0);
        assert!(!clock.can_undo());
    }

    #[test]
    fn test_jump_synced_restores_song_tempo() {
        let (mut clock, _) = loaded(120.0);
        clock.play_synced(0.0);
        clock.sync_beat(400.0, 0.0);
        // 400ms quarters: at 2000ms the position is beat 5, inside bar 2
        assert!(close(clock.current_beats(2_000.0), 5.0));
        assert!(clock.jump_synced(1, 2_000.0));
        let song = clock.song().unwrap();
        assert_eq!(song.bpm, 120.0);
        // Bar 3 starts at beat 8, placed at the song's 500ms quarters
        assert!(close(clock.current_time(2_000.0), 4_000.0));
        assert_eq!(clock.status(), PlaybackStatus::Playing);
        assert!(!clock.can_undo());
    }

    #[test]
    fn test_jump_synced_outside_synced_mode_is_measure_jump() {
        let (mut clock, _) = loaded(120.0);
        clock.play(0.0);
        assert!(clock.jump_synced(1, 2_500.0));
        assert!(close(clock.current_time(2_500.0), 4_000.0));
    }

    #[test]
    fn test_snapshot_serialization() {
        let (clock, _) = loaded(120.0);
        let value = serde_json::to_value(clock.snapshot()).unwrap();
        assert_eq!(value["status"], "paused");
        assert_eq!(value["mode"], "normal");
        assert_eq!(value["song"]["bpmUnit"], "q_note");
        assert_eq!(value["canUndo"], false);
        assert!(value.get("tempoRamp").is_none());
    }
}
