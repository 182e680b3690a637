//! pulsetrain - beat-addressed MIDI scheduling and clock engine
//!
//! Turns declarative, musical-time descriptions (drum triggers, melodies,
//! looped ostinati, parameter automation, transport commands) into one
//! precisely ordered stream of MIDI messages, played alongside a generated
//! 24 PPQN master clock.
//!
//! - **Timing** - beats, pulses, seconds and absolute session deadlines
//! - **Compiler** - requests to a sorted [`CompiledTimeline`]
//! - **Curves** - sweeps and envelopes as keyframes
//! - **Transport** - song position, Start/Continue/Stop, clock plans
//! - **Dispatcher** - concurrent clock and action loops, cancellable
//! - **Recorder** - Standard MIDI File export and import
//!
//! # Usage as a Library
//!
//! ```no_run
//! use pulsetrain_core::{shared, Conductor, LogSink, PlaybackRequest, TrackTrigger};
//!
//! let conductor = Conductor::new(shared(LogSink));
//!
//! let mut request = PlaybackRequest::new(120.0, 4);
//! request.track_triggers = vec![TrackTrigger::new(0.0, 1, 100), TrackTrigger::new(2.0, 2, 95)];
//!
//! conductor.play(&request)?;
//! conductor.wait()?;
//! conductor.export(std::path::Path::new("groove.mid"))?;
//! # Ok::<(), pulsetrain_core::Error>(())
//! ```
//!
//! # Feature Flags
//!
//! - `native` (default) - hardware and virtual MIDI ports through midir

pub mod action;
pub mod compiler;
pub mod conductor;
pub mod config;
pub mod curves;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod params;
pub mod recorder;
pub mod request;
pub mod sink;
pub mod timeline;
pub mod timing;
pub mod transport;

// Re-export main types
pub use action::{Action, Lane, Priority, TimedAction, TransportKind};
pub use compiler::{compile, CollisionPolicy, CompileOptions};
pub use conductor::{Conductor, OneShot, PreemptionPolicy};
pub use config::Config;
pub use curves::{Curve, Envelope, Keyframe, Sweep};
pub use dispatcher::{dispatch, DispatchOptions, SessionHandle, SessionStatus};
pub use error::{Error, Result};
pub use message::MidiMessage;
pub use params::{ParameterAddress, ParameterKind, ParameterResolver, ParameterTable};
pub use recorder::{import_bytes, read_file, to_smf_bytes, write_file, SmfWriter};
pub use request::{
    AutomationPoint, EnvelopeLane, LoopNote, MelodyNote, PlaybackRequest, ProgramChangeAt, SweepLane,
    SysexAt, TrackTrigger,
};
pub use sink::{shared, LogSink, MemorySink, MidiSink, SharedSink};
pub use timeline::{CompiledTimeline, NoteSpan};
pub use timing::{
    beats_to_pulses, beats_to_seconds, pulse_interval_seconds, seconds_to_beats, BeatTime, SessionClock, Tempo,
};
pub use transport::ClockPlan;

#[cfg(feature = "native")]
pub use sink::{list_output_ports, MidirSink};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile, play and export one request end to end.
    #[test]
    fn test_compile_play_export() {
        let _ = env_logger::builder().is_test(true).try_init();

        let probe = MemorySink::new();
        let conductor = Conductor::new(shared(probe.clone()));

        let mut request = PlaybackRequest::new(960.0, 1);
        request.track_triggers = vec![TrackTrigger::new(0.0, 1, 100), TrackTrigger::new(2.0, 2, 95)];
        request.melody_notes = vec![MelodyNote::new(0.0, 60, 100, 0.05), MelodyNote::new(1.0, 64, 100, 0.05)];

        conductor.play(&request).unwrap();
        assert_eq!(conductor.wait().unwrap(), SessionStatus::Completed);

        let sent_notes = probe.non_clock().iter().filter(|b| b[0] & 0xF0 == 0x90).count();
        assert_eq!(sent_notes, 4);
        assert_eq!(probe.clock_count(), 96);

        let restored = import_bytes(&conductor.export_bytes().unwrap()).unwrap();
        assert_eq!(restored.note_spans().len(), 4);
    }
}
