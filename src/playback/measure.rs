//! Bar boundaries in quarter-note beats

use serde::{Deserialize, Serialize};

/// Start the previous measure instead of restarting the current one when
/// already this close to its start
const AT_MEASURE_START_MS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measure {
    pub start_beat: f64,
    pub duration_beats: f64,
}

impl Measure {
    pub fn new(start_beat: f64, duration_beats: f64) -> Self {
        Self {
            start_beat,
            duration_beats,
        }
    }

    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats
    }

    fn contains(&self, beats: f64) -> bool {
        beats >= self.start_beat && beats < self.end_beat()
    }
}

/// Ordered measure list for one song
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeasureMap(Vec<Measure>);

impl MeasureMap {
    pub fn new(measures: Vec<Measure>) -> Self {
        Self(measures)
    }

    /// Consecutive measures from a list of lengths, starting at beat 0
    pub fn from_lengths(lengths: &[f64]) -> Self {
        let mut start = 0.0;
        let measures = lengths
            .iter()
            .map(|&len| {
                let measure = Measure::new(start, len);
                start += len;
                measure
            })
            .collect();
        Self(measures)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn measures(&self) -> &[Measure] {
        &self.0
    }

    pub fn total_beats(&self) -> f64 {
        self.0.last().map_or(0.0, Measure::end_beat)
    }

    /// Index of the measure containing `beats`
    pub fn index_at(&self, beats: f64) -> Option<usize> {
        self.0.iter().position(|m| m.contains(beats))
    }

    /// Position in ms to jump to from `current_beats` when moving one
    /// measure in `direction` (positive is forward). `quarter_ms` converts
    /// the target beat to milliseconds. `None` means stay put.
    pub fn jump_target(&self, current_beats: f64, quarter_ms: f64, direction: i32) -> Option<f64> {
        let first = self.0.first()?;
        let last = self.0.last()?;
        let total = self.total_beats();

        if current_beats >= total {
            return Some(if direction > 0 {
                (total * quarter_ms - 1.0).max(0.0)
            } else {
                last.start_beat * quarter_ms
            });
        }

        let index = match self.index_at(current_beats) {
            Some(index) => index,
            None if current_beats < first.start_beat => {
                return (direction > 0).then_some(0.0);
            }
            None => {
                // In a gap between measures that do not touch
                let target_beats = if direction > 0 {
                    self.0
                        .iter()
                        .find(|m| m.start_beat > current_beats)
                        .map_or(total, |m| m.start_beat)
                } else {
                    self.0
                        .iter()
                        .rev()
                        .find(|m| m.start_beat <= current_beats)
                        .map_or(first.start_beat, |m| m.start_beat)
                };
                return Some(clamp_to_end(target_beats, total, quarter_ms));
            }
        };

        let target_beats = if direction > 0 {
            self.0.get(index + 1).map_or(total, |next| next.start_beat)
        } else {
            let current = &self.0[index];
            let at_start = (current_beats - current.start_beat) * quarter_ms < AT_MEASURE_START_MS;
            if at_start && index > 0 {
                self.0[index - 1].start_beat
            } else {
                current.start_beat
            }
        };

        Some(clamp_to_end(target_beats, total, quarter_ms))
    }
}

/// Landing exactly on the end would finish the song, so stop 1ms short
fn clamp_to_end(target_beats: f64, total_beats: f64, quarter_ms: f64) -> f64 {
    let target_ms = target_beats * quarter_ms;
    if target_beats >= total_beats && target_ms > 1.0 {
        target_ms - 1.0
    } else {
        target_ms
    }
}
