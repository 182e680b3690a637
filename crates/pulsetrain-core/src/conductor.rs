//! Session ownership.
//!
//! The [`Conductor`] is the entry point applications talk to. It owns the
//! output sink, the live-session slot and the most recently compiled
//! timeline, and enforces that at most one session plays at a time.

use crate::compiler::{compile, CompileOptions, MAX_CHANNEL};
use crate::config::Config;
use crate::dispatcher::{dispatch, DispatchOptions, SessionHandle, SessionStatus};
use crate::error::{check_u7, Error, Result};
use crate::message::{frame_sysex, MidiMessage};
use crate::params::{ParameterAddress, ParameterResolver, ParameterTable};
use crate::recorder;
use crate::request::PlaybackRequest;
use crate::sink::{send_all, SharedSink};
use crate::timeline::CompiledTimeline;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// What happens to a running session when another one is requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionPolicy {
    /// Cancel the running session, wait for it, then start the new one
    #[default]
    CancelActive,
    /// Refuse with [`Error::SessionConflict`]
    Reject,
}

/// An immediate message outside any session. Channels are 1-16.
#[derive(Debug, Clone, PartialEq)]
pub enum OneShot {
    /// Note on, then note off after `duration_seconds` (blocks the caller)
    Note { channel: i64, note: i64, velocity: i64, duration_seconds: f64 },
    ControlChange { channel: i64, controller: i64, value: i64 },
    /// Program numbers are 1-128
    ProgramChange { channel: i64, program: i64 },
    /// Named or inline parameter (`cc:74`, `nrpn:1:21`)
    Parameter { channel: i64, name: String, value: i64 },
    /// SysEx payload, framed with F0/F7 when missing
    SysEx(Vec<u8>),
}

/// Owns the sink, the live session and the last compiled timeline.
pub struct Conductor {
    sink: SharedSink,
    resolver: Arc<dyn ParameterResolver>,
    options: CompileOptions,
    preemption: PreemptionPolicy,
    active: Mutex<Option<Arc<SessionHandle>>>,
    /// Serializes session starts; `active` is only ever locked briefly
    launch: Mutex<()>,
    last: RwLock<Option<Arc<CompiledTimeline>>>,
    next_id: AtomicU64,
}

impl Conductor {
    /// Conductor with default options and an empty parameter table.
    pub fn new(sink: SharedSink) -> Self {
        Self {
            sink,
            resolver: Arc::new(ParameterTable::new()),
            options: CompileOptions::default(),
            preemption: PreemptionPolicy::default(),
            active: Mutex::new(None),
            launch: Mutex::new(()),
            last: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Conductor configured from a [`Config`].
    pub fn from_config(config: &Config, sink: SharedSink) -> Self {
        Self::new(sink)
            .with_resolver(Arc::new(config.parameters.clone()))
            .with_options(config.compile_options())
            .with_preemption(config.playback.preemption)
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ParameterResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_preemption(mut self, preemption: PreemptionPolicy) -> Self {
        self.preemption = preemption;
        self
    }

    /// Compile a request and remember it as the last timeline.
    pub fn compile(&self, request: &PlaybackRequest) -> Result<Arc<CompiledTimeline>> {
        let timeline = Arc::new(compile(request, self.resolver.as_ref(), &self.options)?);
        self.store_last(Arc::clone(&timeline));
        Ok(timeline)
    }

    /// Compile a request and start playing it. Returns the session id.
    ///
    /// Compilation errors leave any running session untouched.
    pub fn play(&self, request: &PlaybackRequest) -> Result<u64> {
        let timeline = self.compile(request)?;
        self.play_timeline(
            timeline,
            DispatchOptions {
                send_stop: request.send_stop,
            },
        )
    }

    /// Start playing an already compiled timeline.
    ///
    /// Status queries stay answerable while a preempted session is joined.
    pub fn play_timeline(&self, timeline: Arc<CompiledTimeline>, options: DispatchOptions) -> Result<u64> {
        let _launch = self
            .launch
            .lock()
            .map_err(|_| Error::Midi("session launch lock poisoned".to_string()))?;

        if let Some(previous) = self.current() {
            if !previous.status().is_finished() {
                if self.preemption == PreemptionPolicy::Reject {
                    return Err(Error::SessionConflict);
                }
                log::warn!("Preempting running session {}", previous.id());
            }
            // A failure of the old session must not block the new one
            if let Err(e) = previous.stop() {
                log::warn!("Previous session {} ended with error: {}", previous.id(), e);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(dispatch(id, timeline, Arc::clone(&self.sink), options)?);
        let mut active = self
            .active
            .lock()
            .map_err(|_| Error::Midi("session slot lock poisoned".to_string()))?;
        *active = Some(handle);
        Ok(id)
    }

    fn current(&self) -> Option<Arc<SessionHandle>> {
        self.active.lock().ok().and_then(|slot| slot.clone())
    }

    /// Status of the current (or most recent) session.
    pub fn status(&self) -> SessionStatus {
        self.current()
            .map(|session| session.status())
            .unwrap_or(SessionStatus::Idle)
    }

    /// Id of the current (or most recent) session.
    pub fn session_id(&self) -> Option<u64> {
        self.current().map(|session| session.id())
    }

    /// Cancel the current session and wait for it to finish.
    pub fn stop(&self) -> Result<SessionStatus> {
        match self.current() {
            Some(session) => session.stop(),
            None => Ok(SessionStatus::Idle),
        }
    }

    /// Wait for the current session to finish on its own.
    pub fn wait(&self) -> Result<SessionStatus> {
        match self.current() {
            Some(session) => session.wait(),
            None => Ok(SessionStatus::Idle),
        }
    }

    /// The most recently compiled timeline.
    pub fn last_timeline(&self) -> Option<Arc<CompiledTimeline>> {
        self.last.read().ok().and_then(|last| last.clone())
    }

    fn store_last(&self, timeline: Arc<CompiledTimeline>) {
        if let Ok(mut last) = self.last.write() {
            *last = Some(timeline);
        }
    }

    /// Encode the last timeline as SMF bytes.
    pub fn export_bytes(&self) -> Result<Vec<u8>> {
        let timeline = self.last_timeline().ok_or(Error::NoTimelineAvailable)?;
        recorder::to_smf_bytes(&timeline)
    }

    /// Write the last timeline to a `.mid` file.
    pub fn export(&self, path: &Path) -> Result<()> {
        let timeline = self.last_timeline().ok_or(Error::NoTimelineAvailable)?;
        recorder::write_file(&timeline, path)
    }

    /// Send a one-shot message through the session sink.
    pub fn send_now(&self, shot: &OneShot) -> Result<()> {
        let channel = |value: i64| -> Result<u8> { Ok(check_u7("channel", value, 1, MAX_CHANNEL)? - 1) };
        match shot {
            OneShot::Note { channel: ch, note, velocity, duration_seconds } => {
                let channel = channel(*ch)?;
                let note = check_u7("note", *note, 0, 127)?;
                let velocity = check_u7("velocity", *velocity, 1, 127)?;
                if !duration_seconds.is_finite() || *duration_seconds < 0.0 {
                    return Err(Error::InvalidRange {
                        field: "duration",
                        value: *duration_seconds,
                        min: 0.0,
                        max: f64::INFINITY,
                    });
                }
                send_all(&self.sink, &[MidiMessage::NoteOn { channel, note, velocity }])?;
                std::thread::sleep(Duration::from_secs_f64(*duration_seconds));
                send_all(&self.sink, &[MidiMessage::NoteOff { channel, note }])
            }
            OneShot::ControlChange { channel: ch, controller, value } => {
                let message = MidiMessage::ControlChange {
                    channel: channel(*ch)?,
                    controller: check_u7("controller", *controller, 0, 127)?,
                    value: check_u7("value", *value, 0, 127)?,
                };
                send_all(&self.sink, &[message])
            }
            OneShot::ProgramChange { channel: ch, program } => {
                let message = MidiMessage::ProgramChange {
                    channel: channel(*ch)?,
                    program: check_u7("program", *program, 1, 128)? - 1,
                };
                send_all(&self.sink, &[message])
            }
            OneShot::Parameter { channel: ch, name, value } => {
                let kind = self
                    .resolver
                    .resolve(name)
                    .ok_or_else(|| Error::UnknownParameter(name.clone()))?;
                let address = ParameterAddress { channel: channel(*ch)?, kind };
                send_all(&self.sink, &address.messages(check_u7("value", *value, 0, 127)?))
            }
            OneShot::SysEx(payload) => {
                let framed = frame_sysex(payload);
                if let Some(bad) = framed[1..framed.len() - 1].iter().find(|b| **b > 0x7F) {
                    return Err(Error::range("sysex data byte", *bad, 0, 0x7F));
                }
                send_all(&self.sink, &[MidiMessage::Raw(framed)])
            }
        }
    }
}

impl Drop for Conductor {
    fn drop(&mut self) {
        if let Some(session) = self.current() {
            let _ = session.stop();
        }
    }
}
