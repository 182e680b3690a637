//! Atomic timed actions.
//!
//! Every input shape the compiler accepts is reduced to a list of
//! [`TimedAction`]s: one [`Action`] at one [`BeatTime`], tagged with the
//! [`Lane`] it came from and a stable insertion index for tie-breaking.

use crate::message::MidiMessage;
use crate::params::ParameterAddress;
use crate::timing::BeatTime;

/// Transport command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Start,
    Stop,
    Continue,
}

impl TransportKind {
    pub fn message(self) -> MidiMessage {
        match self {
            TransportKind::Start => MidiMessage::Start,
            TransportKind::Stop => MidiMessage::Stop,
            TransportKind::Continue => MidiMessage::Continue,
        }
    }
}

/// A single schedulable action. Channels are 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    /// Named parameter write, expanded to one CC or an NRPN quadruple on send
    ParameterChange { address: ParameterAddress, value: u8 },
    Transport(TransportKind),
    /// Song position pointer in sixteenth notes
    SongPosition { sixteenths: u16 },
    /// Opaque bytes (framed SysEx and anything else sent verbatim)
    Raw(Vec<u8>),
}

impl Action {
    /// The wire messages this action resolves to, in send order.
    pub fn messages(&self) -> Vec<MidiMessage> {
        match self {
            Action::NoteOn { channel, note, velocity } => vec![MidiMessage::NoteOn {
                channel: *channel,
                note: *note,
                velocity: *velocity,
            }],
            Action::NoteOff { channel, note } => {
                vec![MidiMessage::NoteOff { channel: *channel, note: *note }]
            }
            Action::ControlChange { channel, controller, value } => {
                vec![MidiMessage::ControlChange {
                    channel: *channel,
                    controller: *controller,
                    value: *value,
                }]
            }
            Action::ProgramChange { channel, program } => {
                vec![MidiMessage::ProgramChange { channel: *channel, program: *program }]
            }
            Action::ParameterChange { address, value } => address.messages(*value),
            Action::Transport(kind) => vec![kind.message()],
            Action::SongPosition { sixteenths } => vec![MidiMessage::SongPosition(*sixteenths)],
            Action::Raw(bytes) => vec![MidiMessage::Raw(bytes.clone())],
        }
    }

    /// The channel this action addresses, if it is a channel message.
    pub fn channel(&self) -> Option<u8> {
        match self {
            Action::NoteOn { channel, .. }
            | Action::NoteOff { channel, .. }
            | Action::ControlChange { channel, .. }
            | Action::ProgramChange { channel, .. } => Some(*channel),
            Action::ParameterChange { address, .. } => Some(address.channel),
            Action::Transport(_) | Action::SongPosition { .. } | Action::Raw(_) => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Action::Transport(_) | Action::SongPosition { .. })
    }
}

/// Which input category produced an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Start/stop/song position
    Transport,
    /// Track triggers (anchored, never shifted by preroll)
    Trigger,
    /// Melody, loop and multi-channel note content
    Melodic,
    /// Parameter automation
    Automation,
    /// Program changes and raw payloads
    System,
}

/// Ordering class used to break ties between actions at the same position.
///
/// Transport first so the receiver is positioned before anything plays,
/// then note-offs that cut a colliding note, then onsets and controls,
/// then ordinary note-offs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Transport = 0,
    Cut = 1,
    Onset = 2,
    Release = 3,
}

/// An action at an absolute beat position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedAction {
    pub position: BeatTime,
    pub action: Action,
    pub lane: Lane,
    /// Set on note-offs moved forward by the collision policy
    pub cut: bool,
    /// Insertion index, assigned by the compiler
    pub seq: usize,
}

impl TimedAction {
    pub fn new(position: BeatTime, action: Action, lane: Lane) -> Self {
        Self {
            position,
            action,
            lane,
            cut: false,
            seq: 0,
        }
    }

    pub fn priority(&self) -> Priority {
        match &self.action {
            Action::Transport(_) | Action::SongPosition { .. } => Priority::Transport,
            Action::NoteOff { .. } if self.cut => Priority::Cut,
            Action::NoteOff { .. } => Priority::Release,
            _ => Priority::Onset,
        }
    }

    /// Total order used by [`CompiledTimeline`](crate::timeline::CompiledTimeline).
    pub fn sort_key(&self) -> (BeatTime, Priority, usize) {
        (self.position, self.priority(), self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterKind;

    #[test]
    fn test_priority_classes() {
        let at = BeatTime::from_float(1.0);
        let start = TimedAction::new(at, Action::Transport(TransportKind::Start), Lane::Transport);
        let on = TimedAction::new(at, Action::NoteOn { channel: 0, note: 60, velocity: 100 }, Lane::Melodic);
        let off = TimedAction::new(at, Action::NoteOff { channel: 0, note: 60 }, Lane::Melodic);
        let mut cut = off.clone();
        cut.cut = true;

        assert!(start.priority() < cut.priority());
        assert!(cut.priority() < on.priority());
        assert!(on.priority() < off.priority());
    }

    #[test]
    fn test_parameter_change_messages() {
        let action = Action::ParameterChange {
            address: ParameterAddress { channel: 1, kind: ParameterKind::Nrpn { msb: 1, lsb: 20 } },
            value: 64,
        };
        assert_eq!(action.messages().len(), 4);
        assert_eq!(action.channel(), Some(1));
        assert!(!action.is_transport());
        assert!(Action::SongPosition { sixteenths: 4 }.is_transport());
    }
}
