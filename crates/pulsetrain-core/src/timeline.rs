//! Compiled, time-ordered action timelines.
//!
//! A [`CompiledTimeline`] is the single hand-off between the compiler and
//! everything downstream: the dispatcher plays it, the recorder writes it.
//! Once built it is never mutated; callers share it as an `Arc`.

use crate::action::{Action, Lane, TimedAction};
use crate::transport::ClockPlan;
use crate::timing::{beats_to_seconds, BeatTime, Tempo, BEATS_PER_BAR};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// A sorted sequence of timed actions plus the tempo and length it was built for.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTimeline {
    tempo: Tempo,
    bars: u32,
    entries: Vec<TimedAction>,
    clock: ClockPlan,
}

impl CompiledTimeline {
    /// Sort `actions` into timeline order.
    ///
    /// Positions ascend; ties are broken by [`Priority`](crate::action::Priority)
    /// and then by each action's insertion index.
    pub fn new(tempo: Tempo, bars: u32, mut actions: Vec<TimedAction>) -> Self {
        actions.sort_by_key(TimedAction::sort_key);
        Self {
            tempo,
            bars,
            entries: actions,
            clock: ClockPlan::for_session(bars, BeatTime::ZERO, true),
        }
    }

    /// Replace the clock plan (full-length clock from pulse 0 by default).
    pub fn with_clock(mut self, clock: ClockPlan) -> Self {
        self.clock = clock;
        self
    }

    /// A timeline with no actions. Playing it only runs the clock.
    pub fn empty(tempo: Tempo, bars: u32) -> Self {
        Self::new(tempo, bars, Vec::new())
    }

    pub fn tempo(&self) -> Tempo {
        self.tempo
    }

    pub fn bars(&self) -> u32 {
        self.bars
    }

    pub fn clock(&self) -> ClockPlan {
        self.clock
    }

    pub fn entries(&self) -> &[TimedAction] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TimedAction> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position at which the session ends (`bars * 4` beats).
    pub fn end(&self) -> BeatTime {
        BeatTime::from_float(self.bars as f64 * BEATS_PER_BAR)
    }

    /// Wall-clock length of the session.
    pub fn duration_seconds(&self) -> f64 {
        beats_to_seconds(self.end().to_float(), self.tempo)
    }

    /// Distinct channels addressed by actions in the given lane.
    pub fn channels(&self, lane: Lane) -> BTreeSet<u8> {
        self.entries
            .iter()
            .filter(|e| e.lane == lane)
            .filter_map(|e| e.action.channel())
            .collect()
    }

    /// Pair note-ons with their note-offs.
    ///
    /// Notes are matched first-in first-out per (channel, note). A note-on
    /// that never receives a note-off is closed at the end of the session.
    pub fn note_spans(&self) -> Vec<NoteSpan> {
        let mut open: HashMap<(u8, u8), VecDeque<usize>> = HashMap::new();
        let mut spans: Vec<NoteSpan> = Vec::new();

        for entry in &self.entries {
            match entry.action {
                Action::NoteOn { channel, note, velocity } => {
                    open.entry((channel, note)).or_default().push_back(spans.len());
                    spans.push(NoteSpan {
                        channel,
                        note,
                        velocity,
                        on: entry.position,
                        off: self.end(),
                    });
                }
                Action::NoteOff { channel, note } => {
                    if let Some(idx) = open.get_mut(&(channel, note)).and_then(VecDeque::pop_front) {
                        spans[idx].off = entry.position;
                    }
                }
                _ => {}
            }
        }
        spans
    }
}

impl<'a> IntoIterator for &'a CompiledTimeline {
    type Item = &'a TimedAction;
    type IntoIter = std::slice::Iter<'a, TimedAction>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// One sounding note recovered from a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteSpan {
    pub channel: u8,
    pub note: u8,
    pub velocity: u8,
    pub on: BeatTime,
    pub off: BeatTime,
}
