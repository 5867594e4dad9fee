//! Tempo arithmetic
//!
//! A tempo is a bpm value counted in some note unit. Everything else in the
//! playback module works in quarter-note durations (milliseconds per quarter
//! note), so the unit only matters at the edges.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::DEFAULT_BPM;

/// Note value a bpm figure is counted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NoteUnit {
    #[serde(rename = "w_note")]
    Whole,
    #[serde(rename = "h_note")]
    Half,
    #[default]
    #[serde(rename = "q_note")]
    Quarter,
    #[serde(rename = "e_note")]
    Eighth,
    #[serde(rename = "s_note")]
    Sixteenth,
    #[serde(rename = "w_note_dotted")]
    DottedWhole,
    #[serde(rename = "h_note_dotted")]
    DottedHalf,
    #[serde(rename = "q_note_dotted")]
    DottedQuarter,
    #[serde(rename = "e_note_dotted")]
    DottedEighth,
}

impl NoteUnit {
    /// Length of this note in quarter notes
    pub fn quarter_multiplier(self) -> f64 {
        match self {
            NoteUnit::Whole => 4.0,
            NoteUnit::Half => 2.0,
            NoteUnit::Quarter => 1.0,
            NoteUnit::Eighth => 0.5,
            NoteUnit::Sixteenth => 0.25,
            NoteUnit::DottedWhole => 6.0,
            NoteUnit::DottedHalf => 3.0,
            NoteUnit::DottedQuarter => 1.5,
            NoteUnit::DottedEighth => 0.75,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NoteUnit::Whole => "w_note",
            NoteUnit::Half => "h_note",
            NoteUnit::Quarter => "q_note",
            NoteUnit::Eighth => "e_note",
            NoteUnit::Sixteenth => "s_note",
            NoteUnit::DottedWhole => "w_note_dotted",
            NoteUnit::DottedHalf => "h_note_dotted",
            NoteUnit::DottedQuarter => "q_note_dotted",
            NoteUnit::DottedEighth => "e_note_dotted",
        }
    }
}

impl fmt::Display for NoteUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown note unit '{}'", s))
    }
}

/// Treat a missing, zero or non-finite bpm as the default tempo
pub fn effective_bpm(bpm: f64) -> f64 {
    if bpm.is_finite() && bpm > 0.0 {
        bpm
    } else {
        DEFAULT_BPM
    }
}

/// Milliseconds per quarter note at `bpm` counted in `unit`
pub fn quarter_note_ms(bpm: f64, unit: NoteUnit) -> f64 {
    60_000.0 / (effective_bpm(bpm) * unit.quarter_multiplier())
}

/// Inverse of [`quarter_note_ms`]
pub fn bpm_for_quarter_ms(quarter_ms: f64, unit: NoteUnit) -> f64 {
    60_000.0 / (quarter_ms * unit.quarter_multiplier())
}

/// Linear change of tempo over a fixed wall-clock window.
///
/// Rates are in quarter notes per millisecond; a bpm that changes linearly
/// is a rate that changes linearly, so the integral has a closed form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempoRamp {
    /// Wall-clock ms at which the ramp begins
    pub start_time: f64,
    pub duration_ms: f64,
    pub from_rate: f64,
    pub to_rate: f64,
}

impl TempoRamp {
    pub fn new(start_time: f64, duration_ms: f64, from_quarter_ms: f64, to_quarter_ms: f64) -> Self {
        Self {
            start_time,
            duration_ms,
            from_rate: 1.0 / from_quarter_ms,
            to_rate: 1.0 / to_quarter_ms,
        }
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration_ms
    }

    pub fn is_finished(&self, t: f64) -> bool {
        t >= self.end_time()
    }

    /// Instantaneous rate at `t`
    pub fn rate_at(&self, t: f64) -> f64 {
        if self.duration_ms <= 0.0 || t >= self.end_time() {
            return self.to_rate;
        }
        let progress = ((t - self.start_time) / self.duration_ms).max(0.0);
        self.from_rate + (self.to_rate - self.from_rate) * progress
    }

    /// Quarter notes covered between the ramp start and `t`
    pub fn beats_until(&self, t: f64) -> f64 {
        let elapsed = (t - self.start_time).max(0.0);
        if self.duration_ms <= 0.0 {
            return self.to_rate * elapsed;
        }
        if elapsed <= self.duration_ms {
            (self.from_rate + self.rate_at(t)) / 2.0 * elapsed
        } else {
            (self.from_rate + self.to_rate) / 2.0 * self.duration_ms + self.to_rate * (elapsed - self.duration_ms)
        }
    }
}
