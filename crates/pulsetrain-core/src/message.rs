//! MIDI wire messages.
//!
//! [`MidiMessage`] is the unit handed to a [`MidiSink`](crate::sink::MidiSink):
//! every compiled action resolves to one or more of these before it is sent.

/// System real-time: timing clock.
pub const CLOCK: u8 = 0xF8;
/// System real-time: start.
pub const START: u8 = 0xFA;
/// System real-time: continue.
pub const CONTINUE: u8 = 0xFB;
/// System real-time: stop.
pub const STOP: u8 = 0xFC;
/// System common: song position pointer.
pub const SONG_POSITION: u8 = 0xF2;
/// System exclusive start / end framing bytes.
pub const SYSEX_START: u8 = 0xF0;
pub const SYSEX_END: u8 = 0xF7;

/// Highest song position value (14 bits of sixteenth notes).
pub const MAX_SONG_POSITION: u16 = 0x3FFF;

/// MIDI message types. Channels are 0-based (0-15).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note on: channel, note, velocity
    NoteOn { channel: u8, note: u8, velocity: u8 },
    /// Note off: channel, note
    NoteOff { channel: u8, note: u8 },
    /// Control change: channel, controller, value
    ControlChange { channel: u8, controller: u8, value: u8 },
    /// Program change: channel, program
    ProgramChange { channel: u8, program: u8 },
    /// Song position pointer in sixteenth notes
    SongPosition(u16),
    /// Timing clock (24 per quarter note)
    Clock,
    /// Start playback from the song position (reset to 0 unless preceded by a pointer)
    Start,
    /// Resume playback without resetting the position
    Continue,
    /// Stop playback
    Stop,
    /// Opaque bytes sent verbatim (SysEx payloads arrive already framed)
    Raw(Vec<u8>),
}

impl MidiMessage {
    /// Convert to raw MIDI bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            MidiMessage::NoteOn { channel, note, velocity } => {
                vec![0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
            }
            MidiMessage::NoteOff { channel, note } => {
                vec![0x80 | (channel & 0x0F), note & 0x7F, 0]
            }
            MidiMessage::ControlChange { channel, controller, value } => {
                vec![0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F]
            }
            MidiMessage::ProgramChange { channel, program } => {
                vec![0xC0 | (channel & 0x0F), program & 0x7F]
            }
            MidiMessage::SongPosition(pos) => {
                let pos = (*pos).min(MAX_SONG_POSITION);
                vec![SONG_POSITION, (pos & 0x7F) as u8, ((pos >> 7) & 0x7F) as u8]
            }
            MidiMessage::Clock => vec![CLOCK],
            MidiMessage::Start => vec![START],
            MidiMessage::Continue => vec![CONTINUE],
            MidiMessage::Stop => vec![STOP],
            MidiMessage::Raw(bytes) => bytes.clone(),
        }
    }

    /// Parse raw MIDI bytes into a MidiMessage.
    ///
    /// Unknown or truncated status bytes come back as [`MidiMessage::Raw`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let status = *bytes.first()?;

        // System real-time messages (single byte)
        match status {
            CLOCK => return Some(MidiMessage::Clock),
            START => return Some(MidiMessage::Start),
            CONTINUE => return Some(MidiMessage::Continue),
            STOP => return Some(MidiMessage::Stop),
            SONG_POSITION if bytes.len() >= 3 => {
                let pos = (bytes[1] as u16 & 0x7F) | ((bytes[2] as u16 & 0x7F) << 7);
                return Some(MidiMessage::SongPosition(pos));
            }
            _ => {}
        }

        let channel = status & 0x0F;
        let message = match status & 0xF0 {
            0x90 if bytes.len() >= 3 => {
                if bytes[2] == 0 {
                    // Note on with velocity 0 is treated as note off
                    MidiMessage::NoteOff { channel, note: bytes[1] }
                } else {
                    MidiMessage::NoteOn { channel, note: bytes[1], velocity: bytes[2] }
                }
            }
            0x80 if bytes.len() >= 3 => MidiMessage::NoteOff { channel, note: bytes[1] },
            0xB0 if bytes.len() >= 3 => MidiMessage::ControlChange {
                channel,
                controller: bytes[1],
                value: bytes[2],
            },
            0xC0 if bytes.len() >= 2 => MidiMessage::ProgramChange { channel, program: bytes[1] },
            _ => MidiMessage::Raw(bytes.to_vec()),
        };
        Some(message)
    }

    /// Whether this is a single-byte system real-time message.
    pub fn is_realtime(&self) -> bool {
        matches!(
            self,
            MidiMessage::Clock | MidiMessage::Start | MidiMessage::Continue | MidiMessage::Stop
        )
    }
}

/// Frame a SysEx payload with F0/F7, leaving already-framed payloads alone.
pub fn frame_sysex(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 2);
    if payload.first() != Some(&SYSEX_START) {
        framed.push(SYSEX_START);
    }
    framed.extend_from_slice(payload);
    if payload.last() != Some(&SYSEX_END) {
        framed.push(SYSEX_END);
    }
    framed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midi_message_bytes() {
        let note_on = MidiMessage::NoteOn { channel: 0, note: 60, velocity: 100 };
        assert_eq!(note_on.to_bytes(), vec![0x90, 60, 100]);

        let note_off = MidiMessage::NoteOff { channel: 1, note: 48 };
        assert_eq!(note_off.to_bytes(), vec![0x81, 48, 0]);

        let cc = MidiMessage::ControlChange { channel: 0, controller: 74, value: 64 };
        assert_eq!(cc.to_bytes(), vec![0xB0, 74, 64]);

        let pc = MidiMessage::ProgramChange { channel: 2, program: 5 };
        assert_eq!(pc.to_bytes(), vec![0xC2, 5]);
    }

    #[test]
    fn test_song_position_encoding() {
        // 64 sixteenths = bar 5 in 4/4
        assert_eq!(MidiMessage::SongPosition(64).to_bytes(), vec![0xF2, 64, 0]);
        // LSB first, 7 bits each
        assert_eq!(MidiMessage::SongPosition(300).to_bytes(), vec![0xF2, 44, 2]);
        assert_eq!(
            MidiMessage::from_bytes(&[0xF2, 44, 2]),
            Some(MidiMessage::SongPosition(300))
        );
    }

    #[test]
    fn test_parse_realtime_and_channel_messages() {
        assert_eq!(MidiMessage::from_bytes(&[0xF8]), Some(MidiMessage::Clock));
        assert_eq!(MidiMessage::from_bytes(&[0xFA]), Some(MidiMessage::Start));
        assert_eq!(MidiMessage::from_bytes(&[0xFC]), Some(MidiMessage::Stop));
        assert_eq!(
            MidiMessage::from_bytes(&[0x93, 60, 0]),
            Some(MidiMessage::NoteOff { channel: 3, note: 60 })
        );
        assert_eq!(MidiMessage::from_bytes(&[]), None);
        assert!(MidiMessage::Clock.is_realtime());
        assert!(!MidiMessage::SongPosition(0).is_realtime());
    }

    #[test]
    fn test_frame_sysex() {
        assert_eq!(frame_sysex(&[0x00, 0x20, 0x3C]), vec![0xF0, 0x00, 0x20, 0x3C, 0xF7]);
        assert_eq!(frame_sysex(&[0xF0, 0x01, 0xF7]), vec![0xF0, 0x01, 0xF7]);
    }
}
