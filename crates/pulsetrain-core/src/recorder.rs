//! Standard MIDI File export and import.
//!
//! A compiled timeline is written as a format-1 file at
//! [`TICKS_PER_BEAT`] ticks per quarter note:
//!
//! - track 0 (conductor): name, tempo, 4/4 time signature, transport
//!   markers, raw SysEx payloads, and an end-of-track event placed exactly
//!   at the session end so the bar count survives a round trip
//! - a `triggers` track holding all track-trigger notes
//! - one track per remaining channel with notes, controls and program changes
//!
//! Parameter changes are written as the control changes they expand to, so
//! an NRPN write appears as its four CCs.

use crate::action::{Action, Lane, TimedAction, TransportKind};
use crate::error::{Error, Result};
use crate::message::SYSEX_START;
use crate::timeline::CompiledTimeline;
use crate::timing::{BeatTime, Tempo, BEATS_PER_BAR};
use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::collections::BTreeMap;
use std::path::Path;

/// File resolution in ticks per quarter note.
pub const TICKS_PER_BEAT: u16 = 480;

/// Name of the track that carries track-trigger notes.
pub const TRIGGER_TRACK: &str = "triggers";

const CONDUCTOR_TRACK: &str = "pulsetrain";

/// An event with an absolute tick, owning its payload.
#[derive(Debug, Clone)]
enum RecordedEvent {
    Midi { channel: u8, message: midly::MidiMessage },
    Tempo(u32),
    TimeSignature,
    Marker(String),
    SysEx(Vec<u8>),
    Escape(Vec<u8>),
}

#[derive(Debug, Default)]
struct TrackBuffer {
    name: String,
    events: Vec<(u64, RecordedEvent)>,
}

impl TrackBuffer {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
        }
    }
}

/// Accumulates timeline actions into SMF tracks.
pub struct SmfWriter {
    conductor: TrackBuffer,
    triggers: TrackBuffer,
    channels: BTreeMap<u8, TrackBuffer>,
    end_tick: u64,
}

impl SmfWriter {
    /// Create a writer for a session of `bars` bars at `tempo`.
    pub fn new(tempo: Tempo, bars: u32) -> Self {
        let mut conductor = TrackBuffer::named(CONDUCTOR_TRACK);
        conductor.events.push((0, RecordedEvent::Tempo(tempo.micros_per_beat())));
        conductor.events.push((0, RecordedEvent::TimeSignature));
        Self {
            conductor,
            triggers: TrackBuffer::named(TRIGGER_TRACK),
            channels: BTreeMap::new(),
            end_tick: beat_to_tick(BeatTime::from_float(bars as f64 * BEATS_PER_BAR)),
        }
    }

    /// Build a writer holding every action of `timeline`.
    pub fn from_timeline(timeline: &CompiledTimeline) -> Self {
        let mut writer = Self::new(timeline.tempo(), timeline.bars());
        for entry in timeline {
            writer.add(entry);
        }
        writer
    }

    /// Add one timed action. Actions must be added in timeline order.
    pub fn add(&mut self, entry: &TimedAction) {
        let tick = beat_to_tick(entry.position);
        match &entry.action {
            Action::Transport(kind) => {
                let text = match kind {
                    TransportKind::Start => "start",
                    TransportKind::Stop => "stop",
                    TransportKind::Continue => "continue",
                };
                self.conductor.events.push((tick, RecordedEvent::Marker(text.to_string())));
            }
            Action::SongPosition { sixteenths } => {
                self.conductor
                    .events
                    .push((tick, RecordedEvent::Marker(format!("songpos {sixteenths}"))));
            }
            Action::Raw(bytes) if bytes.first() == Some(&SYSEX_START) => {
                self.conductor.events.push((tick, RecordedEvent::SysEx(bytes[1..].to_vec())));
            }
            Action::Raw(bytes) => {
                self.conductor.events.push((tick, RecordedEvent::Escape(bytes.clone())));
            }
            action => {
                let track = if entry.lane == Lane::Trigger {
                    &mut self.triggers
                } else {
                    let channel = action.channel().unwrap_or(0);
                    self.channels
                        .entry(channel)
                        .or_insert_with(|| TrackBuffer::named(format!("channel {}", channel + 1)))
                };
                for message in action.messages() {
                    if let Some((channel, message)) = to_midly(&message) {
                        track.events.push((tick, RecordedEvent::Midi { channel, message }));
                    }
                }
            }
        }
    }

    /// Number of tracks that will be written.
    pub fn track_count(&self) -> usize {
        1 + usize::from(!self.triggers.events.is_empty()) + self.channels.len()
    }

    /// Encode the accumulated tracks as SMF bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buffers: Vec<&TrackBuffer> = vec![&self.conductor];
        if !self.triggers.events.is_empty() {
            buffers.push(&self.triggers);
        }
        buffers.extend(self.channels.values());

        let mut smf = Smf::new(Header::new(
            Format::Parallel,
            Timing::Metrical(u15::from(TICKS_PER_BEAT)),
        ));
        for (index, buffer) in buffers.into_iter().enumerate() {
            let end = if index == 0 { Some(self.end_tick) } else { None };
            smf.tracks.push(encode_track(buffer, end)?);
        }

        let mut bytes = Vec::new();
        smf.write_std(&mut bytes)?;
        Ok(bytes)
    }

    /// Write the file to `path`.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes)?;
        log::info!("Wrote {} tracks to {}", self.track_count(), path.display());
        Ok(())
    }
}

fn beat_to_tick(beat: BeatTime) -> u64 {
    (beat.to_float() * TICKS_PER_BEAT as f64).round().max(0.0) as u64
}

fn tick_to_beat(tick: u64, ticks_per_beat: u16) -> BeatTime {
    BeatTime::from_float(tick as f64 / ticks_per_beat as f64)
}

fn to_midly(message: &crate::message::MidiMessage) -> Option<(u8, midly::MidiMessage)> {
    use crate::message::MidiMessage as M;
    let converted = match *message {
        M::NoteOn { channel, note, velocity } => (
            channel,
            midly::MidiMessage::NoteOn { key: u7::from(note), vel: u7::from(velocity) },
        ),
        M::NoteOff { channel, note } => (
            channel,
            midly::MidiMessage::NoteOff { key: u7::from(note), vel: u7::from(0) },
        ),
        M::ControlChange { channel, controller, value } => (
            channel,
            midly::MidiMessage::Controller { controller: u7::from(controller), value: u7::from(value) },
        ),
        M::ProgramChange { channel, program } => {
            (channel, midly::MidiMessage::ProgramChange { program: u7::from(program) })
        }
        _ => return None,
    };
    Some(converted)
}

/// Delta time as a 28-bit variable-length quantity.
fn delta(ticks: u64) -> Result<u28> {
    u32::try_from(ticks)
        .ok()
        .and_then(u28::try_from)
        .ok_or_else(|| Error::range("delta time", ticks as f64, 0, u28::max_value().as_int()))
}

fn encode_track(buffer: &TrackBuffer, end_tick: Option<u64>) -> Result<Vec<TrackEvent<'_>>> {
    let mut events = Vec::with_capacity(buffer.events.len() + 2);
    events.push(TrackEvent {
        delta: u28::from(0),
        kind: TrackEventKind::Meta(MetaMessage::TrackName(buffer.name.as_bytes())),
    });

    let mut last = 0u64;
    for (tick, event) in &buffer.events {
        let kind = match event {
            RecordedEvent::Midi { channel, message } => TrackEventKind::Midi {
                channel: u4::from(*channel),
                message: *message,
            },
            RecordedEvent::Tempo(micros) => {
                let micros = u24::try_from(*micros).ok_or_else(|| {
                    Error::range("tempo (microseconds per beat)", *micros, 1, u24::max_value().as_int())
                })?;
                TrackEventKind::Meta(MetaMessage::Tempo(micros))
            }
            RecordedEvent::TimeSignature => TrackEventKind::Meta(MetaMessage::TimeSignature(4, 2, 24, 8)),
            RecordedEvent::Marker(text) => TrackEventKind::Meta(MetaMessage::Marker(text.as_bytes())),
            RecordedEvent::SysEx(data) => TrackEventKind::SysEx(data),
            RecordedEvent::Escape(data) => TrackEventKind::Escape(data),
        };
        events.push(TrackEvent {
            delta: delta(tick.saturating_sub(last))?,
            kind,
        });
        last = last.max(*tick);
    }

    let end = end_tick.map_or(last, |end| end.max(last));
    events.push(TrackEvent {
        delta: delta(end - last)?,
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    Ok(events)
}

/// Encode a timeline as SMF bytes.
pub fn to_smf_bytes(timeline: &CompiledTimeline) -> Result<Vec<u8>> {
    SmfWriter::from_timeline(timeline).to_bytes()
}

/// Write a timeline to a `.mid` file.
pub fn write_file(timeline: &CompiledTimeline, path: &Path) -> Result<()> {
    SmfWriter::from_timeline(timeline).write_to_file(path)
}

/// Rebuild a timeline from SMF bytes.
///
/// Tempo comes from the first tempo event (120 BPM if absent). The bar
/// count is the length of the longest track rounded up to whole bars.
pub fn import_bytes(bytes: &[u8]) -> Result<CompiledTimeline> {
    let smf = Smf::parse(bytes)?;
    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(ticks) => ticks.as_int(),
        Timing::Timecode(..) => return Err(Error::Midi("timecode-based MIDI files are not supported".to_string())),
    };
    if ticks_per_beat == 0 {
        return Err(Error::Midi("MIDI file declares zero ticks per beat".to_string()));
    }

    let mut tempo = None;
    let mut actions = Vec::new();
    let mut max_tick = 0u64;

    for track in &smf.tracks {
        let mut tick = 0u64;
        let mut lane = Lane::Melodic;
        let start = actions.len();

        for event in track {
            tick += event.delta.as_int() as u64;
            let position = tick_to_beat(tick, ticks_per_beat);
            let imported = match event.kind {
                TrackEventKind::Meta(MetaMessage::TrackName(name)) => {
                    if name == TRIGGER_TRACK.as_bytes() {
                        lane = Lane::Trigger;
                    }
                    None
                }
                TrackEventKind::Meta(MetaMessage::Tempo(micros)) => {
                    if tempo.is_none() {
                        tempo = Some(Tempo::from_micros_per_beat(micros.as_int())?);
                    }
                    None
                }
                TrackEventKind::Meta(MetaMessage::Marker(text)) => parse_marker(text).map(|a| (a, Lane::Transport)),
                TrackEventKind::SysEx(data) => {
                    let mut raw = vec![SYSEX_START];
                    raw.extend_from_slice(data);
                    Some((Action::Raw(raw), Lane::System))
                }
                TrackEventKind::Escape(data) => Some((Action::Raw(data.to_vec()), Lane::System)),
                TrackEventKind::Midi { channel, message } => {
                    from_midly(channel.as_int(), message).map(|action| {
                        let lane = match action {
                            Action::NoteOn { .. } | Action::NoteOff { .. } => lane,
                            Action::ControlChange { .. } => Lane::Automation,
                            _ => Lane::System,
                        };
                        (action, lane)
                    })
                }
                _ => None,
            };
            if let Some((action, lane)) = imported {
                let mut timed = TimedAction::new(position, action, lane);
                timed.seq = actions.len();
                actions.push(timed);
            }
        }
        max_tick = max_tick.max(tick);
        mark_cuts(&mut actions[start..]);
    }

    let tempo = tempo.unwrap_or_default();
    let bar_ticks = ticks_per_beat as u64 * BEATS_PER_BAR as u64;
    let bars = max_tick.div_ceil(bar_ticks).max(1) as u32;
    log::debug!("Imported {} actions, {} bars at {}", actions.len(), bars, tempo);
    Ok(CompiledTimeline::new(tempo, bars, actions))
}

/// Read a `.mid` file into a timeline.
pub fn read_file(path: &Path) -> Result<CompiledTimeline> {
    let bytes = std::fs::read(path)?;
    import_bytes(&bytes)
}

fn parse_marker(text: &[u8]) -> Option<Action> {
    let text = std::str::from_utf8(text).ok()?.trim();
    match text {
        "start" => Some(Action::Transport(TransportKind::Start)),
        "stop" => Some(Action::Transport(TransportKind::Stop)),
        "continue" => Some(Action::Transport(TransportKind::Continue)),
        _ => text
            .strip_prefix("songpos ")
            .and_then(|n| n.parse().ok())
            .map(|sixteenths| Action::SongPosition { sixteenths }),
    }
}

fn from_midly(channel: u8, message: midly::MidiMessage) -> Option<Action> {
    match message {
        midly::MidiMessage::NoteOn { key, vel } if vel.as_int() == 0 => {
            Some(Action::NoteOff { channel, note: key.as_int() })
        }
        midly::MidiMessage::NoteOn { key, vel } => Some(Action::NoteOn {
            channel,
            note: key.as_int(),
            velocity: vel.as_int(),
        }),
        midly::MidiMessage::NoteOff { key, .. } => Some(Action::NoteOff { channel, note: key.as_int() }),
        midly::MidiMessage::Controller { controller, value } => Some(Action::ControlChange {
            channel,
            controller: controller.as_int(),
            value: value.as_int(),
        }),
        midly::MidiMessage::ProgramChange { program } => {
            Some(Action::ProgramChange { channel, program: program.as_int() })
        }
        _ => None,
    }
}

/// Restore cut flags: a note-off written before a note-on on the same
/// channel at the same tick was a collision cut.
fn mark_cuts(track: &mut [TimedAction]) {
    for i in 0..track.len() {
        let Action::NoteOff { channel, .. } = track[i].action else {
            continue;
        };
        let position = track[i].position;
        track[i].cut = track[i + 1..]
            .iter()
            .take_while(|later| later.position == position)
            .any(|later| matches!(later.action, Action::NoteOn { channel: c, .. } if c == channel));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompileOptions};
    use crate::params::ParameterTable;
    use crate::request::{MelodyNote, PlaybackRequest, SysexAt, TrackTrigger};
    use crate::timeline::NoteSpan;

    const ONE_TICK: f64 = 1.0 / TICKS_PER_BEAT as f64;

    fn compiled(request: &PlaybackRequest) -> CompiledTimeline {
        compile(request, &ParameterTable::new(), &CompileOptions::default()).unwrap()
    }

    fn assert_spans_match(a: &[NoteSpan], b: &[NoteSpan]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert_eq!((x.channel, x.note, x.velocity), (y.channel, y.note, y.velocity));
            assert!((x.on.to_float() - y.on.to_float()).abs() <= ONE_TICK);
            assert!((x.off.to_float() - y.off.to_float()).abs() <= ONE_TICK);
        }
    }

    #[test]
    fn test_trigger_round_trip() {
        let mut request = PlaybackRequest::default();
        request.track_triggers = vec![TrackTrigger::new(0.0, 1, 100), TrackTrigger::new(2.0, 2, 95)];
        let original = compiled(&request);

        let bytes = to_smf_bytes(&original).unwrap();
        let restored = import_bytes(&bytes).unwrap();

        assert_spans_match(&original.note_spans(), &restored.note_spans());
        assert_eq!(restored.bars(), original.bars());
        assert!((restored.tempo().bpm() - 120.0).abs() < 1e-3);
        assert!(restored
            .iter()
            .filter(|e| matches!(e.action, Action::NoteOn { .. }))
            .all(|e| e.lane == Lane::Trigger));
    }

    #[test]
    fn test_track_layout() {
        let mut request = PlaybackRequest::new(96.0, 2);
        request.track_triggers = vec![TrackTrigger::new(0.0, 1, 100)];
        request.melody_notes = vec![MelodyNote::new(0.0, 60, 100, 0.5)];
        request.channel_notes.insert("3".to_string(), vec![MelodyNote::new(1.0, 40, 90, 0.25)]);
        let timeline = compiled(&request);

        let writer = SmfWriter::from_timeline(&timeline);
        assert_eq!(writer.track_count(), 4);

        let bytes = writer.to_bytes().unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.header.format, Format::Parallel);
        assert_eq!(smf.header.timing, Timing::Metrical(u15::from(TICKS_PER_BEAT)));
        assert_eq!(smf.tracks.len(), 4);
        assert!(smf.tracks[0]
            .iter()
            .any(|e| matches!(e.kind, TrackEventKind::Meta(MetaMessage::Tempo(_)))));
        assert!(smf.tracks[0]
            .iter()
            .any(|e| e.kind == TrackEventKind::Meta(MetaMessage::Marker(b"start"))));
    }

    #[test]
    fn test_collision_cut_survives_round_trip() {
        let mut request = PlaybackRequest::default();
        request.melody_notes = vec![MelodyNote::new(0.0, 60, 100, 2.0), MelodyNote::new(1.0, 64, 100, 2.0)];
        let original = compiled(&request);
        let restored = import_bytes(&to_smf_bytes(&original).unwrap()).unwrap();

        let at_one: Vec<&Action> = restored
            .iter()
            .filter(|e| e.position == BeatTime::from_float(1.0))
            .map(|e| &e.action)
            .collect();
        assert_eq!(
            at_one,
            vec![
                &Action::NoteOff { channel: 0, note: 60 },
                &Action::NoteOn { channel: 0, note: 64, velocity: 100 },
            ]
        );
    }

    #[test]
    fn test_transport_and_sysex_round_trip() {
        let mut request = PlaybackRequest::new(120.0, 8);
        request.midi_start_at_beat = 16.0;
        request.sysex = vec![SysexAt { beat: 17.0, data: vec![0x00, 0x20, 0x3C] }];
        let original = compiled(&request);
        let restored = import_bytes(&to_smf_bytes(&original).unwrap()).unwrap();

        let actions: Vec<&Action> = restored.iter().map(|e| &e.action).collect();
        assert_eq!(
            actions,
            vec![
                &Action::SongPosition { sixteenths: 64 },
                &Action::Transport(TransportKind::Start),
                &Action::Raw(vec![0xF0, 0x00, 0x20, 0x3C, 0xF7]),
            ]
        );
        assert_eq!(restored.bars(), 8);
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.mid");
        let mut request = PlaybackRequest::default();
        request.track_triggers = vec![TrackTrigger::new(1.0, 4, 110)];
        let original = compiled(&request);

        write_file(&original, &path).unwrap();
        let restored = read_file(&path).unwrap();
        assert_spans_match(&original.note_spans(), &restored.note_spans());
    }

    #[test]
    fn test_slow_tempo_export() {
        // 4 BPM still fits the 24-bit tempo field
        let slow = CompiledTimeline::empty(Tempo::new(4.0).unwrap(), 1);
        let restored = import_bytes(&to_smf_bytes(&slow).unwrap()).unwrap();
        assert!((restored.tempo().bpm() - 4.0).abs() < 1e-6);

        // 2 BPM needs 30 000 000 us per beat, which does not
        let too_slow = CompiledTimeline::empty(Tempo::new(2.0).unwrap(), 1);
        assert!(matches!(to_smf_bytes(&too_slow), Err(Error::InvalidRange { .. })));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(import_bytes(b"not a midi file"), Err(Error::Smf(_))));
    }
}
