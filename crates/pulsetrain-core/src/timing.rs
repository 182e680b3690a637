//! Timing primitives for the compiler and the dispatcher.
//!
//! This module provides the musical time model used throughout pulsetrain:
//!
//! - [`BeatTime`] - Fixed-point beat position for precise, totally ordered timing
//! - [`Tempo`] - Validated beats-per-minute value
//! - [`SessionClock`] - Absolute wall-clock deadlines for pulses and beats
//!
//! Time signature is fixed at 4/4 with 24 clock pulses per quarter note.

use crate::error::{Error, Result};
use std::fmt;
use std::time::{Duration, Instant};

/// MIDI clock pulses per quarter note.
pub const PULSES_PER_BEAT: u32 = 24;

/// Quarter-note beats per bar (4/4).
pub const BEATS_PER_BAR: f64 = 4.0;

/// Fixed-point beat representation with 16 fractional bits.
///
/// This provides sub-pulse precision while maintaining deterministic ordering.
/// Using fixed-point avoids floating-point comparison issues when sorting
/// timelines with many coinciding events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BeatTime {
    beats: i64,
}

impl BeatTime {
    const SCALE: i64 = 65_536;

    /// Zero beat time constant.
    pub const ZERO: BeatTime = BeatTime { beats: 0 };

    /// Create a BeatTime from a floating-point beat value.
    #[inline]
    pub fn from_float(value: f64) -> Self {
        Self {
            beats: (value * Self::SCALE as f64).round() as i64,
        }
    }

    /// Create a BeatTime at the start of the given bar (0-based).
    #[inline]
    pub fn from_bars(bars: f64) -> Self {
        Self::from_float(bars * BEATS_PER_BAR)
    }

    /// Convert to a floating-point beat value.
    #[inline]
    pub fn to_float(self) -> f64 {
        self.beats as f64 / Self::SCALE as f64
    }
}

impl std::ops::Add for BeatTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            beats: self.beats.saturating_add(rhs.beats),
        }
    }
}

impl std::ops::Sub for BeatTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            beats: self.beats.saturating_sub(rhs.beats),
        }
    }
}

impl From<f64> for BeatTime {
    fn from(value: f64) -> Self {
        BeatTime::from_float(value)
    }
}

impl From<BeatTime> for f64 {
    fn from(value: BeatTime) -> Self {
        value.to_float()
    }
}

impl fmt::Display for BeatTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.to_float())
    }
}

/// Tempo in beats per minute. Always finite and strictly positive.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct Tempo(f64);

impl Tempo {
    /// Create a tempo, rejecting zero, negative and non-finite values.
    pub fn new(bpm: f64) -> Result<Self> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(Error::InvalidTempo(bpm));
        }
        Ok(Self(bpm))
    }

    /// Get the BPM.
    pub fn bpm(self) -> f64 {
        self.0
    }

    /// Length of one quarter note in seconds.
    pub fn seconds_per_beat(self) -> f64 {
        60.0 / self.0
    }

    /// Tempo as microseconds per quarter note (SMF tempo meta-event).
    pub fn micros_per_beat(self) -> u32 {
        (60_000_000.0 / self.0).round() as u32
    }

    /// Recover a tempo from microseconds per quarter note.
    pub fn from_micros_per_beat(micros: u32) -> Result<Self> {
        if micros == 0 {
            return Err(Error::InvalidTempo(f64::INFINITY));
        }
        Self::new(60_000_000.0 / micros as f64)
    }
}

impl Default for Tempo {
    fn default() -> Self {
        Self(120.0)
    }
}

impl fmt::Display for Tempo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} BPM", self.0)
    }
}

/// Convert a beat count to seconds at the given tempo.
pub fn beats_to_seconds(beats: f64, tempo: Tempo) -> f64 {
    beats * 60.0 / tempo.bpm()
}

/// Convert seconds to a beat count at the given tempo.
pub fn seconds_to_beats(seconds: f64, tempo: Tempo) -> f64 {
    seconds * tempo.bpm() / 60.0
}

/// Convert a beat count to the nearest clock pulse.
pub fn beats_to_pulses(beats: f64) -> u64 {
    (beats * PULSES_PER_BEAT as f64).round().max(0.0) as u64
}

/// Seconds between two consecutive clock pulses.
pub fn pulse_interval_seconds(tempo: Tempo) -> f64 {
    60.0 / (tempo.bpm() * PULSES_PER_BEAT as f64)
}

/// Absolute deadlines for one playback session.
///
/// Every deadline is computed from the session origin `t0` rather than from
/// the previous deadline, so sleeping until each one never accumulates drift.
#[derive(Clone, Copy, Debug)]
pub struct SessionClock {
    t0: Instant,
    tempo: Tempo,
}

impl SessionClock {
    /// Create a clock anchored at `t0`.
    pub fn new(t0: Instant, tempo: Tempo) -> Self {
        Self { t0, tempo }
    }

    /// Create a clock anchored at the current instant.
    pub fn start_now(tempo: Tempo) -> Self {
        Self::new(Instant::now(), tempo)
    }

    /// The session origin.
    pub fn origin(&self) -> Instant {
        self.t0
    }

    /// The session tempo.
    pub fn tempo(&self) -> Tempo {
        self.tempo
    }

    /// Due time of clock pulse `n` (0-based).
    pub fn pulse_deadline(&self, n: u64) -> Instant {
        self.t0 + Duration::from_secs_f64(n as f64 * pulse_interval_seconds(self.tempo))
    }

    /// Due time of the given beat position.
    pub fn beat_deadline(&self, beat: BeatTime) -> Instant {
        let seconds = beats_to_seconds(beat.to_float(), self.tempo).max(0.0);
        self.t0 + Duration::from_secs_f64(seconds)
    }

    /// Calculate the beat position at a given instant.
    pub fn beat_at(&self, time: Instant) -> BeatTime {
        if time <= self.t0 {
            return BeatTime::ZERO;
        }
        let elapsed = time.duration_since(self.t0).as_secs_f64();
        BeatTime::from_float(seconds_to_beats(elapsed, self.tempo))
    }
}
