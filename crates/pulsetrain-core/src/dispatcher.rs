//! Real-time dispatcher.
//!
//! Plays a [`CompiledTimeline`] against the monotonic clock. Each session
//! runs two loops that share nothing but the session origin `t0`, the cancel
//! flag and the output sink:
//!
//! - the clock loop sends `0xF8` at `t0 + n * pulse_interval`
//! - the action loop sends each entry at `t0 + beats_to_seconds(position)`
//!
//! Both sleep toward absolute deadlines, so lateness in one wake-up never
//! accumulates into the next. Sleeps are sliced so cancellation is noticed
//! within [`CANCEL_SLICE`].
//!
//! A session moves `Idle → Running → Completed | Cancelled` exactly once.

use crate::action::TimedAction;
use crate::error::{Error, Result};
use crate::message::MidiMessage;
use crate::sink::{send_all, SharedSink};
use crate::timeline::CompiledTimeline;
use crate::timing::{SessionClock, PULSES_PER_BEAT};
use crate::transport::ClockPlan;
use crossbeam_channel::{unbounded, Sender};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest uninterrupted sleep; bounds cancellation latency.
pub const CANCEL_SLICE: Duration = Duration::from_millis(5);

/// Actions later than this are reported as late.
const LATE_WARNING: Duration = Duration::from_millis(10);

/// Lifecycle of a playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Idle = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionStatus::Running,
            2 => SessionStatus::Completed,
            3 => SessionStatus::Cancelled,
            _ => SessionStatus::Idle,
        }
    }

    /// True once the session can no longer send anything.
    pub fn is_finished(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Per-session behaviour not carried by the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Send a final `Stop` when the session ends or is cancelled
    pub send_stop: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { send_stop: true }
    }
}

/// A send that failed, with the beat it was due at.
#[derive(Debug, Clone, PartialEq)]
struct Failure {
    beat: f64,
    reason: String,
}

impl Failure {
    fn to_error(&self) -> Error {
        Error::SendFailure {
            beat: self.beat,
            reason: self.reason.clone(),
        }
    }
}

/// What a loop reports to the coordinator when it exits.
enum LoopReport {
    Finished,
    Failed(Failure),
}

/// State shared between a session's threads and its handle.
struct SessionShared {
    status: AtomicU8,
    cancel: AtomicBool,
    failure: Mutex<Option<Failure>>,
}

impl SessionShared {
    fn set_status(&self, status: SessionStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Handle to one running (or finished) session.
pub struct SessionHandle {
    id: u64,
    shared: Arc<SessionShared>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    timeline: Arc<CompiledTimeline>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current status, readable at any time without blocking.
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.shared.status.load(Ordering::SeqCst))
    }

    pub fn timeline(&self) -> &Arc<CompiledTimeline> {
        &self.timeline
    }

    /// Ask both loops to stop. Returns immediately; use [`wait`](Self::wait) to join.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    /// Block until the session has finished and return its final status.
    ///
    /// A session aborted by a send failure returns [`Error::SendFailure`]
    /// carrying the beat of the failed send, on every call.
    pub fn wait(&self) -> Result<SessionStatus> {
        {
            // Held across the join so concurrent waiters all block until the end
            let mut coordinator = self
                .coordinator
                .lock()
                .map_err(|_| Error::Midi("session handle lock poisoned".to_string()))?;
            if let Some(handle) = coordinator.take() {
                if handle.join().is_err() {
                    log::error!("Session {} coordinator panicked", self.id);
                    self.shared.set_status(SessionStatus::Cancelled);
                }
            }
        }

        let failure = self
            .shared
            .failure
            .lock()
            .map_err(|_| Error::Midi("session failure lock poisoned".to_string()))?;
        match failure.as_ref() {
            Some(failure) => Err(failure.to_error()),
            None => Ok(self.status()),
        }
    }

    /// Cancel and wait in one step.
    pub fn stop(&self) -> Result<SessionStatus> {
        self.cancel();
        self.wait()
    }
}

/// Start playing `timeline` on `sink`.
///
/// Returns as soon as the session threads are running. `t0` is captured
/// here, so the first action at beat 0 goes out immediately.
pub fn dispatch(
    id: u64,
    timeline: Arc<CompiledTimeline>,
    sink: SharedSink,
    options: DispatchOptions,
) -> Result<SessionHandle> {
    let shared = Arc::new(SessionShared {
        status: AtomicU8::new(SessionStatus::Idle as u8),
        cancel: AtomicBool::new(false),
        failure: Mutex::new(None),
    });

    let clock = SessionClock::start_now(timeline.tempo());
    shared.set_status(SessionStatus::Running);
    log::info!(
        "Session {} started: {} actions, {} bars at {}",
        id,
        timeline.len(),
        timeline.bars(),
        timeline.tempo()
    );

    let (report_tx, report_rx) = unbounded::<LoopReport>();

    let clock_thread = {
        let shared = Arc::clone(&shared);
        let sink = Arc::clone(&sink);
        let report_tx = report_tx.clone();
        let plan = timeline.clock();
        thread::Builder::new()
            .name(format!("pulsetrain-clock-{id}"))
            .spawn(move || run_clock(plan, clock, &sink, &shared, &report_tx))
    };
    let clock_thread = match clock_thread {
        Ok(handle) => handle,
        Err(e) => {
            shared.set_status(SessionStatus::Cancelled);
            return Err(e.into());
        }
    };

    let coordinator = {
        let shared = Arc::clone(&shared);
        let timeline = Arc::clone(&timeline);
        thread::Builder::new()
            .name(format!("pulsetrain-session-{id}"))
            .spawn(move || {
                run_actions(&timeline, clock, &sink, &shared, &report_tx);
                if clock_thread.join().is_err() {
                    log::error!("Session {} clock thread panicked", id);
                }
                drop(report_tx);

                let failure = report_rx.iter().find_map(|report| match report {
                    LoopReport::Failed(failure) => Some(failure),
                    LoopReport::Finished => None,
                });
                finish(id, &timeline, failure, &sink, &shared, options);
            })
    };

    match coordinator {
        Ok(handle) => Ok(SessionHandle {
            id,
            shared,
            coordinator: Mutex::new(Some(handle)),
            timeline,
        }),
        Err(e) => {
            shared.cancel.store(true, Ordering::SeqCst);
            shared.set_status(SessionStatus::Cancelled);
            Err(e.into())
        }
    }
}

/// Sleep until `deadline` in short slices. Returns false if cancelled first.
fn sleep_until(deadline: Instant, shared: &SessionShared) -> bool {
    loop {
        if shared.cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_SLICE));
    }
}

fn fail(shared: &SessionShared, report_tx: &Sender<LoopReport>, beat: f64, error: Error) {
    let reason = error.to_string();
    log::error!("Send failed at beat {:.3}: {}", beat, reason);
    shared.cancel.store(true, Ordering::SeqCst);
    let _ = report_tx.send(LoopReport::Failed(Failure { beat, reason }));
}

fn run_clock(
    plan: ClockPlan,
    clock: SessionClock,
    sink: &SharedSink,
    shared: &SessionShared,
    report_tx: &Sender<LoopReport>,
) {
    for n in plan.pulses() {
        if !sleep_until(clock.pulse_deadline(n), shared) {
            break;
        }
        if let Err(e) = send_all(sink, &[MidiMessage::Clock]) {
            fail(shared, report_tx, n as f64 / PULSES_PER_BEAT as f64, e);
            return;
        }
    }
    let _ = report_tx.send(LoopReport::Finished);
}

fn run_actions(
    timeline: &CompiledTimeline,
    clock: SessionClock,
    sink: &SharedSink,
    shared: &SessionShared,
    report_tx: &Sender<LoopReport>,
) {
    for entry in timeline {
        let deadline = clock.beat_deadline(entry.position);
        if !sleep_until(deadline, shared) {
            return;
        }
        let lateness = Instant::now().saturating_duration_since(deadline);
        if lateness > LATE_WARNING {
            log::warn!(
                "Action at beat {} sent {:.1} ms late",
                entry.position,
                lateness.as_secs_f64() * 1000.0
            );
        }
        if let Err(e) = send_entry(sink, entry) {
            fail(shared, report_tx, entry.position.to_float(), e);
            return;
        }
    }

    // Hold the session open until its nominal end
    if sleep_until(clock.beat_deadline(timeline.end()), shared) {
        let _ = report_tx.send(LoopReport::Finished);
    }
}

fn send_entry(sink: &SharedSink, entry: &TimedAction) -> Result<()> {
    log::trace!("beat {} -> {:?}", entry.position, entry.action);
    send_all(sink, &entry.action.messages())
}

fn finish(
    id: u64,
    timeline: &CompiledTimeline,
    failure: Option<Failure>,
    sink: &SharedSink,
    shared: &SessionShared,
    options: DispatchOptions,
) {
    let failure = match failure {
        Some(failure) => Some(failure),
        None if options.send_stop => send_all(sink, &[MidiMessage::Stop]).err().map(|e| Failure {
            beat: timeline.end().to_float(),
            reason: e.to_string(),
        }),
        None => None,
    };

    let status = if failure.is_some() || shared.cancelled() {
        SessionStatus::Cancelled
    } else {
        SessionStatus::Completed
    };
    if let Some(failure) = failure {
        if let Ok(mut slot) = shared.failure.lock() {
            *slot = Some(failure);
        }
    }
    shared.set_status(status);
    log::info!("Session {} {}", id, status);
}
