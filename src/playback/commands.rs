use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::playback::clock::{PlaybackClock, PlaybackSnapshot, SongInfo};
use crate::playback::tempo::NoteUnit;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongSelection {
    pub song_id: String,
}

/// Command carried in an application message from the paired device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemoteCommand {
    #[serde(rename = "play")]
    Play,
    #[serde(rename = "play-synced")]
    PlaySynced,
    #[serde(rename = "pause")]
    Pause {
        #[serde(rename = "timeOverride", default, skip_serializing_if = "Option::is_none")]
        time_override: Option<f64>,
    },
    /// Tapped beat; the glide duration travels in seconds
    #[serde(rename = "beat")]
    Beat {
        #[serde(rename = "interpolationDuration", default)]
        interpolation_secs: f64,
    },
    #[serde(rename = "jump-backward")]
    JumpBackward,
    #[serde(rename = "jump-forward")]
    JumpForward,
    #[serde(rename = "undo")]
    Undo,
    #[serde(rename = "jump-to-start")]
    JumpToStart,
    #[serde(rename = "jump")]
    Jump {
        #[serde(rename = "timeInMs")]
        time_ms: f64,
    },
    #[serde(rename = "updateBpm")]
    UpdateBpm {
        bpm: f64,
        #[serde(rename = "bpmUnit")]
        bpm_unit: NoteUnit,
    },
    #[serde(rename = "selectSong")]
    SelectSong { payload: SongSelection },
    #[serde(rename = "requestPlaylist")]
    RequestPlaylist,
    #[serde(rename = "requestCurrentSong")]
    RequestCurrentSong,
}

impl RemoteCommand {
    /// `None` for payloads that are not commands or lack required fields
    pub fn parse(value: &Value) -> Option<Self> {
        match serde_json::from_value(value.clone()) {
            Ok(command) => Some(command),
            Err(err) => {
                tracing::debug!(error = %err, "Ignoring non-command message");
                None
            }
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Commands the host answers itself instead of the playback clock
    pub fn is_host_request(&self) -> bool {
        matches!(
            self,
            RemoteCommand::SelectSong { .. } | RemoteCommand::RequestPlaylist | RemoteCommand::RequestCurrentSong
        )
    }

    /// Apply to `clock` as if issued at `t`. Returns whether the state changed.
    pub fn apply(&self, clock: &mut PlaybackClock, t: f64) -> bool {
        match self {
            RemoteCommand::Play => clock.play(t),
            RemoteCommand::PlaySynced => clock.play_synced(t),
            RemoteCommand::Pause { time_override } => clock.pause(t, *time_override),
            RemoteCommand::Beat { interpolation_secs } => {
                clock.sync_beat(t, interpolation_secs.max(0.0) * 1_000.0)
            }
            RemoteCommand::JumpBackward => clock.jump_synced(-1, t),
            RemoteCommand::JumpForward => clock.jump_synced(1, t),
            RemoteCommand::Undo => clock.undo_beat(),
            RemoteCommand::JumpToStart => clock.jump_to_start(t),
            RemoteCommand::Jump { time_ms } => clock.jump(*time_ms, t),
            RemoteCommand::UpdateBpm { bpm, bpm_unit } => clock.update_bpm(*bpm, *bpm_unit, t),
            RemoteCommand::SelectSong { .. } | RemoteCommand::RequestPlaylist | RemoteCommand::RequestCurrentSong => {
                false
            }
        }
    }
}

/// State the presenter pushes to its companion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PresenterMessage {
    #[serde(rename = "playbackState")]
    PlaybackState(PlaybackSnapshot),
    #[serde(rename = "currentSong")]
    CurrentSong(Option<SongInfo>),
    #[serde(rename = "playlist")]
    Playlist(Vec<SongInfo>),
}

impl PresenterMessage {
    pub fn parse(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::clock::{PlaybackStatus, SongMeta};
    use crate::playback::measure::MeasureMap;
    use crate::time::MonotonicClock;
    use serde_json::json;

    fn clock() -> PlaybackClock {
        let mut clock = PlaybackClock::new(MonotonicClock::new(), Box::new(|_: &PlaybackSnapshot| {}));
        clock.load_song(
            SongMeta {
                id: "s".into(),
                title: "Song".into(),
                bpm: Some(120.0),
                bpm_unit: None,
            },
            MeasureMap::from_lengths(&[4.0, 4.0, 4.0]),
        );
        clock
    }

    #[test]
    fn test_parse() {
        assert_eq!(RemoteCommand::parse(&json!({"type": "play"})), Some(RemoteCommand::Play));
        assert_eq!(
            RemoteCommand::parse(&json!({"type": "beat", "interpolationDuration": 0.5})),
            Some(RemoteCommand::Beat { interpolation_secs: 0.5 })
        );
        assert_eq!(
            RemoteCommand::parse(&json!({"type": "jump", "timeInMs": 1200})),
            Some(RemoteCommand::Jump { time_ms: 1200.0 })
        );
        assert_eq!(
            RemoteCommand::parse(&json!({"type": "updateBpm", "bpm": 90, "bpmUnit": "e_note"})),
            Some(RemoteCommand::UpdateBpm {
                bpm: 90.0,
                bpm_unit: NoteUnit::Eighth
            })
        );
        let select = RemoteCommand::parse(&json!({"type": "selectSong", "payload": {"songId": "abc"}})).unwrap();
        assert!(select.is_host_request());

        assert_eq!(RemoteCommand::parse(&json!({"type": "dance"})), None);
        assert_eq!(RemoteCommand::parse(&json!({"type": "updateBpm", "bpm": 90})), None);
        assert_eq!(RemoteCommand::parse(&json!("play")), None);
    }

    #[test]
    fn test_to_value() {
        let value = RemoteCommand::Pause { time_override: None }.to_value();
        assert_eq!(value, json!({"type": "pause"}));
        let value = RemoteCommand::Beat { interpolation_secs: 0.25 }.to_value();
        assert_eq!(value["interpolationDuration"], 0.25);
    }

    #[test]
    fn test_apply_playback() {
        let mut clock = clock();
        assert!(RemoteCommand::PlaySynced.apply(&mut clock, 0.0));
        assert_eq!(clock.status(), PlaybackStatus::Playing);

        // Half-second glide toward the tapped 400ms quarter
        assert!(RemoteCommand::Beat { interpolation_secs: 0.5 }.apply(&mut clock, 400.0));
        assert!(clock.snapshot().tempo_ramp.map(|r| r.duration_ms) == Some(500.0));

        assert!(RemoteCommand::Undo.apply(&mut clock, 450.0));
        assert!(!RemoteCommand::Undo.apply(&mut clock, 460.0));

        assert!(RemoteCommand::JumpForward.apply(&mut clock, 1_000.0));
        assert!((clock.current_time(1_000.0) - 2_000.0).abs() < 1e-6);

        assert!(RemoteCommand::Pause { time_override: None }.apply(&mut clock, 1_500.0));
        assert!(!RemoteCommand::RequestPlaylist.apply(&mut clock, 1_500.0));
    }

    #[test]
    fn test_presenter_messages() {
        let clock = clock();
        let message = PresenterMessage::PlaybackState(clock.snapshot());
        let value = message.to_value();
        assert_eq!(value["type"], "playbackState");
        assert_eq!(value["payload"]["status"], "paused");
        match PresenterMessage::parse(&value) {
            Some(PresenterMessage::PlaybackState(snapshot)) => {
                assert_eq!(snapshot.song.map(|song| song.id), Some("s".to_string()))
            }
            other => panic!("unexpected {:?}", other),
        }

        // Commands are not presenter messages
        assert_eq!(PresenterMessage::parse(&json!({"type": "play"})), None);
        assert_eq!(RemoteCommand::parse(&PresenterMessage::Playlist(vec![]).to_value()), None);
    }
}
