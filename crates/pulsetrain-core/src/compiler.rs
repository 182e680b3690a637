//! Event compiler.
//!
//! Reduces a [`PlaybackRequest`] to a [`CompiledTimeline`]. Everything is
//! validated here, before any message can reach a device: a request that
//! compiles is guaranteed to contain only protocol-valid actions inside the
//! session length.
//!
//! Expansion rules:
//!
//! - track triggers become a fixed-length note on/off pair, anchored to the
//!   bar grid (never shifted by preroll)
//! - melody and per-channel notes get a note-off `duration_seconds` later;
//!   overlapping notes are resolved by the [`CollisionPolicy`]
//! - loop notes are replicated every `loop_length` beats (or
//!   `loop_length_bars` bars) until the session ends
//! - automation keyframes, sweeps and envelopes become parameter changes
//! - preroll shifts everything except transport and triggers

use crate::action::{Action, Lane, TimedAction};
use crate::curves::Keyframe;
use crate::error::{check_u7, Error, Result};
use crate::message::frame_sysex;
use crate::params::{ParameterAddress, ParameterResolver};
use crate::request::{MelodyNote, PlaybackRequest};
use crate::timeline::CompiledTimeline;
use crate::timing::{seconds_to_beats, BeatTime, Tempo, BEATS_PER_BAR};
use crate::transport::{self, ClockPlan};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default length of a track trigger in seconds.
pub const DEFAULT_TRIGGER_LENGTH: f64 = 0.05;

/// Highest user-facing channel or track number.
pub const MAX_CHANNEL: u8 = 16;

/// How overlapping melodic notes are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// One sounding note per channel: a new onset cuts the previous note
    #[default]
    Monophonic,
    /// Only a repeated (channel, note) cuts the earlier instance
    PerNote,
}

/// Settings that shape compilation but are not part of a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompileOptions {
    /// 0-based channel that receives track triggers in track mode
    pub trigger_channel: u8,
    pub trigger_length_seconds: f64,
    pub collision: CollisionPolicy,
    /// Run the clock from the session origin even when `Start` comes later
    pub clock_before_start: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            trigger_channel: 0,
            trigger_length_seconds: DEFAULT_TRIGGER_LENGTH,
            collision: CollisionPolicy::Monophonic,
            clock_before_start: true,
        }
    }
}

/// Compile a request into a sorted timeline.
pub fn compile(
    request: &PlaybackRequest,
    resolver: &dyn ParameterResolver,
    options: &CompileOptions,
) -> Result<CompiledTimeline> {
    let tempo = Tempo::new(request.bpm)?;
    if request.bars == 0 {
        return Err(Error::range("bars", request.bars, 1, u16::MAX as u32));
    }

    let mut builder = Builder {
        tempo,
        end: request.bars as f64 * BEATS_PER_BAR,
        shift: request.preroll_bars as f64 * BEATS_PER_BAR,
        actions: Vec::new(),
    };

    let start_beat = builder.anchored("midi_start_at_beat", request.midi_start_at_beat)?;
    if request.send_transport {
        for action in transport::start_actions(start_beat)? {
            builder.push(start_beat, action, Lane::Transport);
        }
    }

    builder.triggers(request, options)?;
    builder.melodic(request, options.collision)?;
    builder.loops(request, options)?;
    builder.automation(request, resolver)?;
    builder.system(request)?;

    let clock_before_start = request.clock_before_start.unwrap_or(options.clock_before_start);
    let clock = if request.send_clock {
        ClockPlan::for_session(request.bars, start_beat, clock_before_start)
    } else {
        ClockPlan::disabled()
    };

    let timeline = CompiledTimeline::new(tempo, request.bars, builder.actions).with_clock(clock);
    log::debug!(
        "Compiled {} actions over {} bars at {} ({} clock pulses)",
        timeline.len(),
        timeline.bars(),
        tempo,
        clock.pulse_count()
    );
    Ok(timeline)
}

fn channel(value: i64) -> Result<u8> {
    Ok(check_u7("channel", value, 1, MAX_CHANNEL)? - 1)
}

fn check_seconds(field: &'static str, seconds: f64) -> Result<f64> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(Error::InvalidRange {
            field,
            value: seconds,
            min: 0.0,
            max: f64::INFINITY,
        });
    }
    Ok(seconds)
}

/// A melodic note before its note-off has been settled.
struct PendingNote {
    channel: u8,
    note: u8,
    velocity: u8,
    on: BeatTime,
    off: BeatTime,
    cut: bool,
}

struct Builder {
    tempo: Tempo,
    /// Session end in beats
    end: f64,
    /// Preroll offset in beats
    shift: f64,
    actions: Vec<TimedAction>,
}

impl Builder {
    fn push(&mut self, position: BeatTime, action: Action, lane: Lane) -> &mut TimedAction {
        let mut timed = TimedAction::new(position, action, lane);
        timed.seq = self.actions.len();
        self.actions.push(timed);
        let last = self.actions.len() - 1;
        &mut self.actions[last]
    }

    fn place(&self, field: &'static str, beat: f64, shift: f64) -> Result<BeatTime> {
        if !beat.is_finite() || beat < 0.0 || beat + shift >= self.end {
            return Err(Error::InvalidRange {
                field,
                value: beat,
                min: 0.0,
                max: self.end - shift,
            });
        }
        Ok(BeatTime::from_float(beat + shift))
    }

    /// Position on the bar grid, ignoring preroll.
    fn anchored(&self, field: &'static str, beat: f64) -> Result<BeatTime> {
        self.place(field, beat, 0.0)
    }

    /// Position of shiftable content, after preroll.
    fn shifted(&self, field: &'static str, beat: f64) -> Result<BeatTime> {
        self.place(field, beat, self.shift)
    }

    /// Note-off position `seconds` after `on`, clamped to the session end.
    fn release(&self, on: BeatTime, seconds: f64) -> BeatTime {
        let off = on + BeatTime::from_float(seconds_to_beats(seconds, self.tempo));
        off.min(BeatTime::from_float(self.end))
    }

    fn note_pair(&mut self, on: BeatTime, off: BeatTime, channel: u8, note: u8, velocity: u8, lane: Lane) {
        self.push(on, Action::NoteOn { channel, note, velocity }, lane);
        self.push(off, Action::NoteOff { channel, note }, lane);
    }

    fn triggers(&mut self, request: &PlaybackRequest, options: &CompileOptions) -> Result<()> {
        let length = check_seconds(
            "trigger length",
            request.trigger_length_seconds.unwrap_or(options.trigger_length_seconds),
        )?;

        for trigger in &request.track_triggers {
            let track = check_u7("track", trigger.track, 1, MAX_CHANNEL)?;
            let velocity = check_u7("velocity", trigger.velocity, 1, 127)?;
            let (channel, note) = match trigger.note {
                Some(note) => (track - 1, check_u7("note", note, 0, 127)?),
                None => (options.trigger_channel, track - 1),
            };
            let on = self.anchored("trigger beat", trigger.beat)?;
            let off = self.release(on, length);
            self.note_pair(on, off, channel, note, velocity, Lane::Trigger);
        }
        Ok(())
    }

    fn pending(&self, channel: u8, n: &MelodyNote) -> Result<PendingNote> {
        let note = check_u7("note", n.note, 0, 127)?;
        let velocity = check_u7("velocity", n.velocity, 1, 127)?;
        let on = self.shifted("melody beat", n.beat)?;
        let off = self.release(on, check_seconds("duration", n.duration_seconds)?);
        Ok(PendingNote { channel, note, velocity, on, off, cut: false })
    }

    fn melodic(&mut self, request: &PlaybackRequest, policy: CollisionPolicy) -> Result<()> {
        let mut notes = Vec::new();
        let melody_channel = channel(request.channel)?;
        for n in &request.melody_notes {
            notes.push(self.pending(melody_channel, n)?);
        }
        for (ch, lane_notes) in request.channel_note_lanes()? {
            let ch = channel(ch)?;
            for n in lane_notes {
                notes.push(self.pending(ch, n)?);
            }
        }

        resolve_collisions(&mut notes, policy);

        for n in notes {
            self.push(
                n.on,
                Action::NoteOn { channel: n.channel, note: n.note, velocity: n.velocity },
                Lane::Melodic,
            );
            self.push(n.off, Action::NoteOff { channel: n.channel, note: n.note }, Lane::Melodic)
                .cut = n.cut;
        }
        Ok(())
    }

    fn loops(&mut self, request: &PlaybackRequest, options: &CompileOptions) -> Result<()> {
        if request.loop_notes.is_empty() {
            return Ok(());
        }
        let period = request.loop_period_beats();
        if !period.is_finite() || period <= 0.0 {
            return Err(Error::InvalidRange {
                field: "loop length",
                value: period,
                min: 0.0,
                max: self.end,
            });
        }
        let ch = channel(request.channel)?;
        let length = check_seconds(
            "trigger length",
            request.trigger_length_seconds.unwrap_or(options.trigger_length_seconds),
        )?;

        for n in &request.loop_notes {
            let note = check_u7("note", n.note, 0, 127)?;
            let velocity = check_u7("velocity", n.velocity, 1, 127)?;
            // The template itself must fit; replicas stop at the session end.
            self.shifted("loop offset", n.offset)?;

            let mut k = 0u32;
            loop {
                let beat = n.offset + k as f64 * period;
                if beat + self.shift >= self.end {
                    break;
                }
                let on = self.shifted("loop offset", beat)?;
                let off = self.release(on, length);
                self.note_pair(on, off, ch, note, velocity, Lane::Melodic);
                k += 1;
            }
        }
        Ok(())
    }

    fn automation(&mut self, request: &PlaybackRequest, resolver: &dyn ParameterResolver) -> Result<()> {
        let default_channel = channel(request.automation_channel.unwrap_or(request.channel))?;
        let address = |name: &str, ch: Option<i64>| -> Result<ParameterAddress> {
            let kind = resolver
                .resolve(name)
                .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
            let channel = match ch {
                Some(ch) => channel(ch)?,
                None => default_channel,
            };
            Ok(ParameterAddress { channel, kind })
        };

        let mut lanes: Vec<(ParameterAddress, Vec<Keyframe>)> = Vec::new();
        for (name, points) in &request.automation {
            let frames = points
                .iter()
                .map(|p| {
                    Ok(Keyframe {
                        beat: p.beat,
                        value: check_u7("automation value", p.value, 0, 127)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            lanes.push((address(name, None)?, frames));
        }
        for lane in &request.sweeps {
            let frames = lane.sweep.keyframes(lane.start_beat, self.tempo)?;
            lanes.push((address(&lane.parameter, lane.channel)?, frames));
        }
        for lane in &request.envelopes {
            let frames = lane.envelope.keyframes(lane.start_beat, self.tempo)?;
            lanes.push((address(&lane.parameter, lane.channel)?, frames));
        }

        let window = request
            .automation_loop_bars
            .filter(|bars| *bars > 0)
            .map(|bars| bars as f64 * BEATS_PER_BAR);

        for (address, frames) in lanes {
            for frame in &frames {
                let at = self.shifted("automation beat", frame.beat)?;
                self.push(at, Action::ParameterChange { address, value: frame.value }, Lane::Automation);
            }

            let Some(window) = window else { continue };
            let mut k = 1u32;
            while k as f64 * window + self.shift < self.end {
                let offset = k as f64 * window;
                for frame in frames.iter().filter(|f| f.beat < window) {
                    let beat = frame.beat + offset;
                    if beat + self.shift < self.end {
                        let at = self.shifted("automation beat", beat)?;
                        self.push(at, Action::ParameterChange { address, value: frame.value }, Lane::Automation);
                    }
                }
                k += 1;
            }
        }
        Ok(())
    }

    fn system(&mut self, request: &PlaybackRequest) -> Result<()> {
        for pc in &request.program_changes {
            let ch = channel(pc.channel.unwrap_or(request.channel))?;
            let program = check_u7("program", pc.program, 1, 128)? - 1;
            let at = self.shifted("program change beat", pc.beat)?;
            self.push(at, Action::ProgramChange { channel: ch, program }, Lane::System);
        }
        for sysex in &request.sysex {
            let framed = frame_sysex(&sysex.data);
            let body = &framed[1..framed.len() - 1];
            if let Some(bad) = body.iter().find(|b| **b > 0x7F) {
                return Err(Error::range("sysex data byte", *bad, 0, 0x7F));
            }
            let at = self.shifted("sysex beat", sysex.beat)?;
            self.push(at, Action::Raw(framed), Lane::System);
        }
        Ok(())
    }
}

/// Shorten notes that are still sounding when a colliding note starts.
///
/// The earlier note's note-off moves to the new onset and is flagged as a cut
/// so it sorts ahead of that onset. A note ending exactly where the next one
/// starts is flagged too. Two notes starting together are not cut; the
/// earlier one simply becomes zero-length.
fn resolve_collisions(notes: &mut [PendingNote], policy: CollisionPolicy) {
    let mut order: Vec<usize> = (0..notes.len()).collect();
    order.sort_by_key(|&i| (notes[i].on, i));

    let mut sounding: HashMap<(u8, Option<u8>), usize> = HashMap::new();
    for idx in order {
        let key = match policy {
            CollisionPolicy::Monophonic => (notes[idx].channel, None),
            CollisionPolicy::PerNote => (notes[idx].channel, Some(notes[idx].note)),
        };
        if let Some(prev) = sounding.insert(key, idx) {
            let onset = notes[idx].on;
            let prev = &mut notes[prev];
            if prev.on < onset && prev.off >= onset {
                if prev.off > onset {
                    log::debug!("Cutting note {} on channel {} at beat {}", prev.note, prev.channel + 1, onset);
                }
                prev.off = onset;
                prev.cut = true;
            } else if prev.off > onset {
                prev.off = onset;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::TransportKind;
    use crate::curves::{Curve, Sweep};
    use crate::params::{ParameterKind, ParameterTable};
    use crate::request::{AutomationPoint, LoopNote, ProgramChangeAt, SweepLane, SysexAt, TrackTrigger};

    fn table() -> ParameterTable {
        ParameterTable::new()
            .with_cc("filter_cutoff", 74)
            .with_nrpn("filter_resonance", 1, 21)
    }

    fn build(request: &PlaybackRequest) -> Result<CompiledTimeline> {
        compile(request, &table(), &CompileOptions::default())
    }

    fn beat(value: f64) -> BeatTime {
        BeatTime::from_float(value)
    }

    #[test]
    fn test_empty_request_is_valid() {
        let mut request = PlaybackRequest::default();
        request.send_transport = false;
        let timeline = build(&request).unwrap();
        assert!(timeline.is_empty());
        assert_eq!(timeline.clock().pulse_count(), 4 * 96);
    }

    #[test]
    fn test_rejects_bad_tempo_and_bars() {
        let request = PlaybackRequest::new(0.0, 4);
        assert!(matches!(build(&request), Err(Error::InvalidTempo(_))));
        let request = PlaybackRequest::new(120.0, 0);
        assert!(matches!(build(&request), Err(Error::InvalidRange { field: "bars", .. })));
    }

    #[test]
    fn test_track_triggers_use_fixed_note_map() {
        let mut request = PlaybackRequest::default();
        request.send_transport = false;
        request.track_triggers = vec![TrackTrigger::new(0.0, 1, 100), TrackTrigger::new(2.0, 2, 95)];
        let timeline = build(&request).unwrap();

        let spans = timeline.note_spans();
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[0].channel, spans[0].note, spans[0].velocity), (0, 0, 100));
        assert_eq!((spans[1].channel, spans[1].note, spans[1].velocity), (0, 1, 95));
        // 50 ms at 120 BPM is a tenth of a beat
        assert!(((spans[0].off - spans[0].on).to_float() - 0.1).abs() < 1e-3);
        assert!(timeline.iter().all(|e| e.lane == Lane::Trigger));
    }

    #[test]
    fn test_chromatic_trigger_uses_track_channel() {
        let mut request = PlaybackRequest::default();
        request.track_triggers = vec![TrackTrigger::chromatic(1.0, 3, 90, 48)];
        let timeline = build(&request).unwrap();
        let span = timeline.note_spans()[0];
        assert_eq!((span.channel, span.note), (2, 48));
    }

    #[test]
    fn test_trigger_validation() {
        let mut request = PlaybackRequest::default();
        request.track_triggers = vec![TrackTrigger::new(0.0, 17, 100)];
        assert!(matches!(build(&request), Err(Error::InvalidRange { field: "track", .. })));

        request.track_triggers = vec![TrackTrigger::new(0.0, 1, 128)];
        assert!(matches!(build(&request), Err(Error::InvalidRange { field: "velocity", .. })));

        request.track_triggers = vec![TrackTrigger::new(16.0, 1, 100)];
        assert!(matches!(build(&request), Err(Error::InvalidRange { field: "trigger beat", .. })));
    }

    #[test]
    fn test_zero_velocity_onsets_rejected() {
        let zero_velocity = |request: &PlaybackRequest| {
            matches!(build(request), Err(Error::InvalidRange { field: "velocity", .. }))
        };

        let mut request = PlaybackRequest::default();
        request.track_triggers = vec![TrackTrigger::new(0.0, 1, 0), TrackTrigger::new(2.0, 2, 95)];
        assert!(zero_velocity(&request));

        let mut request = PlaybackRequest::default();
        request.melody_notes = vec![MelodyNote::new(0.0, 60, 0, 0.5)];
        assert!(zero_velocity(&request));

        let mut request = PlaybackRequest::default();
        request.channel_notes.insert("2".to_string(), vec![MelodyNote::new(0.0, 40, 0, 0.5)]);
        assert!(zero_velocity(&request));

        let mut request = PlaybackRequest::default();
        request.loop_notes = vec![LoopNote::new(0.0, 36, 0)];
        assert!(zero_velocity(&request));

        // Lowest audible velocity still compiles
        let mut request = PlaybackRequest::default();
        request.track_triggers = vec![TrackTrigger::new(0.0, 1, 1)];
        assert_eq!(build(&request).unwrap().note_spans()[0].velocity, 1);
    }

    #[test]
    fn test_monophonic_collision_cuts_previous_note() {
        let mut request = PlaybackRequest::default();
        request.send_transport = false;
        request.melody_notes = vec![
            MelodyNote::new(0.0, 60, 100, 2.0),
            MelodyNote::new(1.0, 64, 100, 2.0),
        ];
        let timeline = build(&request).unwrap();

        let at_one: Vec<&Action> = timeline
            .iter()
            .filter(|e| e.position == beat(1.0))
            .map(|e| &e.action)
            .collect();
        assert_eq!(
            at_one,
            vec![
                &Action::NoteOff { channel: 0, note: 60 },
                &Action::NoteOn { channel: 0, note: 64, velocity: 100 },
            ]
        );
        // Second note keeps its full two seconds (4 beats)
        let spans = timeline.note_spans();
        assert_eq!(spans[1].off, beat(5.0));
    }

    #[test]
    fn test_per_note_policy_allows_chords() {
        let mut request = PlaybackRequest::default();
        request.melody_notes = vec![
            MelodyNote::new(0.0, 60, 100, 2.0),
            MelodyNote::new(1.0, 64, 100, 2.0),
            MelodyNote::new(2.0, 60, 100, 0.5),
        ];
        let options = CompileOptions {
            collision: CollisionPolicy::PerNote,
            ..CompileOptions::default()
        };
        let timeline = compile(&request, &table(), &options).unwrap();
        let spans = timeline.note_spans();
        // 60 is cut by its repeat at beat 2, 64 is untouched
        assert_eq!(spans[0].off, beat(2.0));
        assert_eq!(spans[1].off, beat(5.0));
        assert_eq!(spans[2].off, beat(3.0));
    }

    #[test]
    fn test_simultaneous_onsets_are_not_reordered() {
        let mut request = PlaybackRequest::default();
        request.send_transport = false;
        request.melody_notes = vec![
            MelodyNote::new(0.0, 60, 100, 1.0),
            MelodyNote::new(0.0, 67, 100, 1.0),
        ];
        let timeline = build(&request).unwrap();
        let first_off = timeline
            .iter()
            .position(|e| matches!(e.action, Action::NoteOff { .. }))
            .unwrap();
        // Both onsets precede any note-off
        assert_eq!(first_off, 2);
    }

    #[test]
    fn test_back_to_back_repeat_releases_first() {
        let mut request = PlaybackRequest::default();
        request.send_transport = false;
        // 0.5 s at 120 BPM ends exactly on beat 1
        request.melody_notes = vec![MelodyNote::new(0.0, 60, 100, 0.5), MelodyNote::new(1.0, 60, 100, 0.5)];
        let timeline = build(&request).unwrap();
        let at_one: Vec<&Action> = timeline
            .iter()
            .filter(|e| e.position == beat(1.0))
            .map(|e| &e.action)
            .collect();
        assert_eq!(
            at_one,
            vec![
                &Action::NoteOff { channel: 0, note: 60 },
                &Action::NoteOn { channel: 0, note: 60, velocity: 100 },
            ]
        );
    }

    #[test]
    fn test_note_off_clamped_to_session_end() {
        let mut request = PlaybackRequest::new(120.0, 1);
        request.melody_notes = vec![MelodyNote::new(3.0, 60, 100, 10.0)];
        let timeline = build(&request).unwrap();
        assert_eq!(timeline.note_spans()[0].off, beat(4.0));
    }

    #[test]
    fn test_loop_expansion() {
        let mut request = PlaybackRequest::default();
        request.loop_notes = vec![LoopNote::new(0.0, 2, 80)];
        request.loop_length = 1.0;
        let timeline = build(&request).unwrap();

        let onsets: Vec<BeatTime> = timeline
            .iter()
            .filter(|e| matches!(e.action, Action::NoteOn { .. }))
            .map(|e| e.position)
            .collect();
        assert_eq!(onsets, vec![beat(0.0), beat(1.0), beat(2.0), beat(3.0)]);
    }

    #[test]
    fn test_loop_length_in_bars() {
        let mut request = PlaybackRequest::default();
        request.loop_notes = vec![LoopNote::new(0.5, 36, 80)];
        request.loop_length = 1.0;
        request.loop_length_bars = Some(1.0);
        let timeline = build(&request).unwrap();

        let onsets: Vec<BeatTime> = timeline
            .iter()
            .filter(|e| matches!(e.action, Action::NoteOn { .. }))
            .map(|e| e.position)
            .collect();
        assert_eq!(onsets, vec![beat(0.5), beat(4.5), beat(8.5), beat(12.5)]);
    }

    #[test]
    fn test_loop_rejects_zero_length() {
        let mut request = PlaybackRequest::default();
        request.loop_notes = vec![LoopNote::new(0.0, 2, 80)];
        request.loop_length = 0.0;
        assert!(matches!(build(&request), Err(Error::InvalidRange { field: "loop length", .. })));
    }

    #[test]
    fn test_midi_start_at_beat_orders_pointer_then_start() {
        let mut request = PlaybackRequest::new(120.0, 8);
        request.midi_start_at_beat = 16.0;
        request.melody_notes = vec![MelodyNote::new(16.0, 60, 100, 0.5)];
        let timeline = build(&request).unwrap();

        let actions: Vec<(&BeatTime, &Action)> =
            timeline.iter().map(|e| (&e.position, &e.action)).take(3).collect();
        assert_eq!(actions[0], (&beat(16.0), &Action::SongPosition { sixteenths: 64 }));
        assert_eq!(actions[1], (&beat(16.0), &Action::Transport(TransportKind::Start)));
        assert!(matches!(actions[2].1, Action::NoteOn { .. }));
    }

    #[test]
    fn test_delayed_clock() {
        let mut request = PlaybackRequest::new(120.0, 8);
        request.midi_start_at_beat = 16.0;
        request.clock_before_start = Some(false);
        let timeline = build(&request).unwrap();
        assert_eq!(timeline.clock().first_pulse, 16 * 24);

        request.send_clock = false;
        assert!(!build(&request).unwrap().clock().enabled);
    }

    #[test]
    fn test_preroll_shifts_content_but_not_triggers() {
        let mut request = PlaybackRequest::new(120.0, 4);
        request.preroll_bars = 1;
        request.track_triggers = vec![TrackTrigger::new(0.0, 1, 100)];
        request.melody_notes = vec![MelodyNote::new(0.0, 60, 100, 0.5)];
        let timeline = build(&request).unwrap();

        let start = timeline.iter().find(|e| e.lane == Lane::Transport).unwrap();
        assert_eq!(start.position, beat(0.0));
        let trigger = timeline.iter().find(|e| e.lane == Lane::Trigger).unwrap();
        assert_eq!(trigger.position, beat(0.0));
        let melody = timeline.iter().find(|e| e.lane == Lane::Melodic).unwrap();
        assert_eq!(melody.position, beat(4.0));

        // Content pushed past the end is rejected
        request.melody_notes = vec![MelodyNote::new(12.0, 60, 100, 0.5)];
        assert!(build(&request).is_err());
    }

    #[test]
    fn test_automation_resolves_parameters() {
        let mut request = PlaybackRequest::default();
        request.channel = 2;
        request.automation.insert(
            "filter_resonance".to_string(),
            vec![AutomationPoint { beat: 0.0, value: 10 }, AutomationPoint { beat: 2.0, value: 90 }],
        );
        let timeline = build(&request).unwrap();
        let changes: Vec<&TimedAction> = timeline.iter().filter(|e| e.lane == Lane::Automation).collect();
        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes[1].action,
            Action::ParameterChange {
                address: ParameterAddress { channel: 1, kind: ParameterKind::Nrpn { msb: 1, lsb: 21 } },
                value: 90,
            }
        );

        request.automation.insert("unknown".to_string(), vec![AutomationPoint { beat: 0.0, value: 1 }]);
        assert!(matches!(build(&request), Err(Error::UnknownParameter(name)) if name == "unknown"));
    }

    #[test]
    fn test_automation_value_range() {
        let mut request = PlaybackRequest::default();
        request
            .automation
            .insert("cc:1".to_string(), vec![AutomationPoint { beat: 0.0, value: 200 }]);
        assert!(matches!(
            build(&request),
            Err(Error::InvalidRange { field: "automation value", .. })
        ));
    }

    #[test]
    fn test_automation_loop_repeats_first_window() {
        let mut request = PlaybackRequest::new(120.0, 4);
        request.send_transport = false;
        request.automation_loop_bars = Some(1);
        request.automation.insert(
            "filter_cutoff".to_string(),
            vec![AutomationPoint { beat: 0.0, value: 0 }, AutomationPoint { beat: 2.0, value: 100 }],
        );
        let timeline = build(&request).unwrap();
        let positions: Vec<f64> = timeline.iter().map(|e| e.position.to_float()).collect();
        assert_eq!(positions, vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0]);
    }

    #[test]
    fn test_sweep_lane_expands() {
        let mut request = PlaybackRequest::default();
        request.send_transport = false;
        request.sweeps = vec![SweepLane {
            parameter: "filter_cutoff".to_string(),
            start_beat: 0.0,
            channel: Some(5),
            sweep: Sweep {
                start: 0.0,
                end: 127.0,
                duration_seconds: 2.0,
                curve: Curve::Linear,
                steps: 2,
            },
        }];
        let timeline = build(&request).unwrap();
        let values: Vec<u8> = timeline
            .iter()
            .filter_map(|e| match e.action {
                Action::ParameterChange { address, value } => {
                    assert_eq!(address.channel, 4);
                    Some(value)
                }
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![0, 127]);
    }

    #[test]
    fn test_program_change_and_sysex() {
        let mut request = PlaybackRequest::default();
        request.program_changes = vec![ProgramChangeAt { beat: 0.0, program: 1, channel: Some(10) }];
        request.sysex = vec![SysexAt { beat: 1.0, data: vec![0x00, 0x20, 0x3C] }];
        let timeline = build(&request).unwrap();
        assert!(timeline
            .iter()
            .any(|e| e.action == Action::ProgramChange { channel: 9, program: 0 }));
        assert!(timeline
            .iter()
            .any(|e| e.action == Action::Raw(vec![0xF0, 0x00, 0x20, 0x3C, 0xF7])));

        request.sysex = vec![SysexAt { beat: 1.0, data: vec![0x00, 0x90] }];
        assert!(matches!(
            build(&request),
            Err(Error::InvalidRange { field: "sysex data byte", .. })
        ));
    }

    #[test]
    fn test_positions_non_decreasing() {
        let mut request = PlaybackRequest::new(133.0, 2);
        request.track_triggers = vec![TrackTrigger::new(1.5, 4, 70), TrackTrigger::new(0.25, 1, 100)];
        request.melody_notes = vec![MelodyNote::new(3.0, 50, 90, 0.1), MelodyNote::new(0.0, 52, 90, 3.0)];
        request.loop_notes = vec![LoopNote::new(0.5, 36, 60)];
        let timeline = build(&request).unwrap();
        for pair in timeline.entries().windows(2) {
            assert!(pair[0].sort_key() <= pair[1].sort_key());
        }
    }
}
