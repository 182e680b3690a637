//! Playback requests.
//!
//! A [`PlaybackRequest`] is the declarative input to the compiler. It can be
//! built in code or loaded from TOML or JSON; every list is optional and an
//! empty request is valid.
//!
//! Note tuples keep their compact array form on disk:
//!
//! ```toml
//! bpm = 120
//! bars = 4
//! track_triggers = [[0, 1, 100], [2, 2, 95]]
//! melody_notes = [[0, 60, 100, 0.5]]
//! loop_notes = [[0, 36, 80]]
//! loop_length = 1   # beats (or loop_length_bars)
//! ```
//!
//! Channels, tracks and programs use the 1-based numbering printed on
//! instruments. The compiler converts channels to 0-based wire values.

use crate::curves::{Envelope, Sweep};
use crate::error::{Error, Result};
use crate::timing::BEATS_PER_BAR;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A track trigger: `[beat, track, velocity]` or `[beat, track, velocity, note]`.
///
/// The three-element form plays the track's fixed note on the trigger
/// channel. The four-element form plays `note` chromatically on the track's
/// own channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "TriggerRepr", into = "TriggerRepr")]
pub struct TrackTrigger {
    pub beat: f64,
    pub track: i64,
    pub velocity: i64,
    pub note: Option<i64>,
}

impl TrackTrigger {
    pub fn new(beat: f64, track: i64, velocity: i64) -> Self {
        Self { beat, track, velocity, note: None }
    }

    pub fn chromatic(beat: f64, track: i64, velocity: i64, note: i64) -> Self {
        Self { beat, track, velocity, note: Some(note) }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TriggerRepr {
    Chromatic(f64, i64, i64, i64),
    Track(f64, i64, i64),
}

impl From<TriggerRepr> for TrackTrigger {
    fn from(repr: TriggerRepr) -> Self {
        match repr {
            TriggerRepr::Chromatic(beat, track, velocity, note) => {
                TrackTrigger::chromatic(beat, track, velocity, note)
            }
            TriggerRepr::Track(beat, track, velocity) => TrackTrigger::new(beat, track, velocity),
        }
    }
}

impl From<TrackTrigger> for TriggerRepr {
    fn from(t: TrackTrigger) -> Self {
        match t.note {
            Some(note) => TriggerRepr::Chromatic(t.beat, t.track, t.velocity, note),
            None => TriggerRepr::Track(t.beat, t.track, t.velocity),
        }
    }
}

/// A melodic note: `[beat, note, velocity, duration_seconds]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, i64, i64, f64)", into = "(f64, i64, i64, f64)")]
pub struct MelodyNote {
    pub beat: f64,
    pub note: i64,
    pub velocity: i64,
    pub duration_seconds: f64,
}

impl MelodyNote {
    pub fn new(beat: f64, note: i64, velocity: i64, duration_seconds: f64) -> Self {
        Self { beat, note, velocity, duration_seconds }
    }
}

impl From<(f64, i64, i64, f64)> for MelodyNote {
    fn from((beat, note, velocity, duration_seconds): (f64, i64, i64, f64)) -> Self {
        Self::new(beat, note, velocity, duration_seconds)
    }
}

impl From<MelodyNote> for (f64, i64, i64, f64) {
    fn from(n: MelodyNote) -> Self {
        (n.beat, n.note, n.velocity, n.duration_seconds)
    }
}

/// A loop template note: `[beat_offset, note, velocity]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, i64, i64)", into = "(f64, i64, i64)")]
pub struct LoopNote {
    pub offset: f64,
    pub note: i64,
    pub velocity: i64,
}

impl LoopNote {
    pub fn new(offset: f64, note: i64, velocity: i64) -> Self {
        Self { offset, note, velocity }
    }
}

impl From<(f64, i64, i64)> for LoopNote {
    fn from((offset, note, velocity): (f64, i64, i64)) -> Self {
        Self::new(offset, note, velocity)
    }
}

impl From<LoopNote> for (f64, i64, i64) {
    fn from(n: LoopNote) -> Self {
        (n.offset, n.note, n.velocity)
    }
}

/// An automation keyframe: `[beat, value]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, i64)", into = "(f64, i64)")]
pub struct AutomationPoint {
    pub beat: f64,
    pub value: i64,
}

impl From<(f64, i64)> for AutomationPoint {
    fn from((beat, value): (f64, i64)) -> Self {
        Self { beat, value }
    }
}

impl From<AutomationPoint> for (f64, i64) {
    fn from(p: AutomationPoint) -> Self {
        (p.beat, p.value)
    }
}

/// A sweep bound to a named parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepLane {
    pub parameter: String,
    #[serde(default)]
    pub start_beat: f64,
    /// Overrides the request's automation channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<i64>,
    #[serde(flatten)]
    pub sweep: Sweep,
}

/// An envelope bound to a named parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeLane {
    pub parameter: String,
    #[serde(default)]
    pub start_beat: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<i64>,
    #[serde(flatten)]
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgramChangeAt {
    pub beat: f64,
    /// 1-based program number (1-128)
    pub program: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<i64>,
}

/// A SysEx payload; `F0`/`F7` framing is added when missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysexAt {
    pub beat: f64,
    pub data: Vec<u8>,
}

/// Everything one playback session should do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackRequest {
    pub bpm: f64,
    /// Session length in 4/4 bars
    pub bars: u32,
    /// Channel for melody, loop notes and automation (1-16)
    pub channel: i64,

    pub track_triggers: Vec<TrackTrigger>,
    pub melody_notes: Vec<MelodyNote>,
    pub loop_notes: Vec<LoopNote>,
    /// Loop template length in beats
    #[serde(alias = "loop_length_beats")]
    pub loop_length: f64,
    /// Loop template length in bars; takes precedence over `loop_length`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_length_bars: Option<f64>,
    /// Channel (as a string key, "1"-"16") to melody notes
    pub channel_notes: BTreeMap<String, Vec<MelodyNote>>,

    /// Parameter name to keyframes
    pub automation: BTreeMap<String, Vec<AutomationPoint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation_channel: Option<i64>,
    /// Repeat the first N bars of automation across the session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation_loop_bars: Option<u32>,
    pub sweeps: Vec<SweepLane>,
    pub envelopes: Vec<EnvelopeLane>,

    pub program_changes: Vec<ProgramChangeAt>,
    pub sysex: Vec<SysexAt>,

    /// Shift non-transport, non-trigger content later by this many bars
    pub preroll_bars: u32,
    /// Beat at which the receiver is positioned and started
    pub midi_start_at_beat: f64,
    pub send_clock: bool,
    pub send_transport: bool,
    pub send_stop: bool,
    /// Overrides the configured trigger length
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_length_seconds: Option<f64>,
    /// Overrides the configured clock-before-start behaviour
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_before_start: Option<bool>,
}

impl Default for PlaybackRequest {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            bars: 4,
            channel: 1,
            track_triggers: Vec::new(),
            melody_notes: Vec::new(),
            loop_notes: Vec::new(),
            loop_length: BEATS_PER_BAR,
            loop_length_bars: None,
            channel_notes: BTreeMap::new(),
            automation: BTreeMap::new(),
            automation_channel: None,
            automation_loop_bars: None,
            sweeps: Vec::new(),
            envelopes: Vec::new(),
            program_changes: Vec::new(),
            sysex: Vec::new(),
            preroll_bars: 0,
            midi_start_at_beat: 0.0,
            send_clock: true,
            send_transport: true,
            send_stop: true,
            trigger_length_seconds: None,
            clock_before_start: None,
        }
    }
}

impl PlaybackRequest {
    /// Request with the given tempo and length and nothing scheduled.
    pub fn new(bpm: f64, bars: u32) -> Self {
        Self { bpm, bars, ..Self::default() }
    }

    /// Parse a request from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Parse a request from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a request file. `.json` files are parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    /// Loop period in beats, from `loop_length_bars` when set.
    pub fn loop_period_beats(&self) -> f64 {
        match self.loop_length_bars {
            Some(bars) => bars * BEATS_PER_BAR,
            None => self.loop_length,
        }
    }

    /// Serialize to pretty TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Parsed `channel_notes` keys, in ascending channel order.
    pub fn channel_note_lanes(&self) -> Result<Vec<(i64, &[MelodyNote])>> {
        let mut lanes = self
            .channel_notes
            .iter()
            .map(|(key, notes)| {
                key.trim()
                    .parse::<i64>()
                    .map(|channel| (channel, notes.as_slice()))
                    .map_err(|_| Error::Config(format!("channel_notes key '{key}' is not a channel number")))
            })
            .collect::<Result<Vec<_>>>()?;
        lanes.sort_by_key(|(channel, _)| *channel);
        Ok(lanes)
    }

    /// True when nothing at all would be scheduled besides transport and clock.
    pub fn has_no_content(&self) -> bool {
        self.track_triggers.is_empty()
            && self.melody_notes.is_empty()
            && self.loop_notes.is_empty()
            && self.channel_notes.values().all(Vec::is_empty)
            && self.automation.values().all(Vec::is_empty)
            && self.sweeps.is_empty()
            && self.envelopes.is_empty()
            && self.program_changes.is_empty()
            && self.sysex.is_empty()
    }
}
