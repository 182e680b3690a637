//! Transport synchronization.
//!
//! Produces the message sequences that position, start, resume and stop a
//! receiving sequencer, and the [`ClockPlan`] describing which clock pulses a
//! session emits.
//!
//! A receiver only honours a song position pointer while stopped, so when a
//! session enters mid-song the pointer is always sent before `Start`, never
//! after. `Continue` is never substituted for `Start`: callers choose.

use crate::action::{Action, TransportKind};
use crate::error::{Error, Result};
use crate::message::MAX_SONG_POSITION;
use crate::timing::{beats_to_pulses, BeatTime, BEATS_PER_BAR, PULSES_PER_BEAT};
use std::ops::Range;

/// Song position (sixteenth notes) for a beat: `round(beat * 4)`.
pub fn song_position(beat: BeatTime) -> Result<u16> {
    let sixteenths = (beat.to_float() * 4.0).round();
    if !(0.0..=MAX_SONG_POSITION as f64).contains(&sixteenths) {
        return Err(Error::InvalidRange {
            field: "song position",
            value: sixteenths,
            min: 0.0,
            max: MAX_SONG_POSITION as f64,
        });
    }
    Ok(sixteenths as u16)
}

/// Actions that start the receiver at `beat`.
///
/// At beat 0 this is a plain `Start` (which resets the receiver to the top).
/// Anywhere else the song position pointer comes first.
pub fn start_actions(beat: BeatTime) -> Result<Vec<Action>> {
    if beat <= BeatTime::ZERO {
        return Ok(vec![Action::Transport(TransportKind::Start)]);
    }
    Ok(vec![
        Action::SongPosition {
            sixteenths: song_position(beat)?,
        },
        Action::Transport(TransportKind::Start),
    ])
}

/// Actions that resume the receiver at `beat` without resetting it.
pub fn continue_actions(beat: BeatTime) -> Result<Vec<Action>> {
    Ok(vec![
        Action::SongPosition {
            sixteenths: song_position(beat)?,
        },
        Action::Transport(TransportKind::Continue),
    ])
}

pub fn stop_action() -> Action {
    Action::Transport(TransportKind::Stop)
}

/// Which clock pulses a session sends.
///
/// Pulses are numbered from the session origin; pulse `n` is due at
/// `t0 + n * pulse_interval`. Starting later than pulse 0 keeps the
/// numbering, so late-starting clocks stay phase-aligned with the beat grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockPlan {
    pub enabled: bool,
    pub first_pulse: u64,
    pub end_pulse: u64,
}

impl ClockPlan {
    /// Clock for a session of `bars` bars.
    ///
    /// With `clock_before_start` unset, pulses begin at the transport start
    /// beat instead of at the session origin.
    pub fn for_session(bars: u32, start_beat: BeatTime, clock_before_start: bool) -> Self {
        let end_pulse = (bars as f64 * BEATS_PER_BAR) as u64 * PULSES_PER_BEAT as u64;
        let first_pulse = if clock_before_start {
            0
        } else {
            beats_to_pulses(start_beat.to_float()).min(end_pulse)
        };
        Self {
            enabled: true,
            first_pulse,
            end_pulse,
        }
    }

    /// A plan that sends no pulses.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            first_pulse: 0,
            end_pulse: 0,
        }
    }

    pub fn pulses(&self) -> Range<u64> {
        if self.enabled {
            self.first_pulse..self.end_pulse
        } else {
            0..0
        }
    }

    pub fn pulse_count(&self) -> u64 {
        self.pulses().end - self.pulses().start
    }
}
