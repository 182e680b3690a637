//! MIDI output sinks
//!
//! Everything that reaches a device goes through a [`MidiSink`]. The
//! dispatcher shares one sink between its clock and action loops behind a
//! mutex ([`SharedSink`]), so each send is atomic with respect to the other
//! loop.

use crate::error::{Error, Result};
use crate::message::MidiMessage;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// A byte-oriented MIDI output.
pub trait MidiSink: Send {
    /// Send one complete MIDI message.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Human-readable name of the destination
    fn name(&self) -> &str;
}

/// A sink shared between threads.
pub type SharedSink = Arc<Mutex<Box<dyn MidiSink>>>;

/// Wrap a sink for sharing.
pub fn shared(sink: impl MidiSink + 'static) -> SharedSink {
    let sink: Box<dyn MidiSink> = Box::new(sink);
    Arc::new(Mutex::new(sink))
}

/// Send a batch of messages while holding the sink lock once.
///
/// Nothing from another thread can be interleaved between the messages of
/// one batch, which keeps NRPN quadruples contiguous on the wire.
pub fn send_all(sink: &SharedSink, messages: &[MidiMessage]) -> Result<()> {
    let mut guard = sink
        .lock()
        .map_err(|_| Error::Midi("output sink lock poisoned".to_string()))?;
    for message in messages {
        guard.send(&message.to_bytes())?;
    }
    Ok(())
}

/// One message captured by a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub at: Instant,
    pub bytes: Vec<u8>,
}

/// Records every message in memory.
///
/// Clones share the same log, so a test can keep one handle while the
/// dispatcher owns another. Can be told to fail after a number of sends.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<Vec<SentMessage>>>,
    fail_after: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose `limit + 1`-th send returns an error.
    pub fn failing_after(limit: usize) -> Self {
        Self {
            log: Arc::default(),
            fail_after: Some(limit),
        }
    }

    /// Everything sent so far, in send order.
    pub fn messages(&self) -> Vec<SentMessage> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Raw bytes of everything sent so far.
    pub fn bytes(&self) -> Vec<Vec<u8>> {
        self.messages().into_iter().map(|m| m.bytes).collect()
    }

    /// Sent messages that are not clock pulses.
    pub fn non_clock(&self) -> Vec<Vec<u8>> {
        self.bytes()
            .into_iter()
            .filter(|b| b.as_slice() != [crate::message::CLOCK])
            .collect()
    }

    /// Number of clock pulses sent.
    pub fn clock_count(&self) -> usize {
        self.bytes()
            .iter()
            .filter(|b| b.as_slice() == [crate::message::CLOCK])
            .count()
    }

    pub fn clear(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }
}

impl MidiSink for MemorySink {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| Error::Midi("memory sink lock poisoned".to_string()))?;
        if self.fail_after.is_some_and(|limit| log.len() >= limit) {
            return Err(Error::Midi("memory sink closed".to_string()));
        }
        log.push(SentMessage {
            at: Instant::now(),
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Logs messages instead of sending them (for dry runs).
pub struct LogSink;

impl MidiSink for LogSink {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        match MidiMessage::from_bytes(bytes) {
            Some(MidiMessage::Clock) => log::trace!("MIDI clock"),
            Some(message) => log::info!("MIDI {:?}", message),
            None => log::info!("MIDI raw {:02X?}", bytes),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(feature = "native")]
pub use native::{list_output_ports, MidirSink};

#[cfg(feature = "native")]
mod native {
    use super::MidiSink;
    use crate::error::{Error, Result};
    use midir::{MidiOutput, MidiOutputConnection};

    /// Names of all available MIDI output ports.
    pub fn list_output_ports() -> Result<Vec<String>> {
        let midi_out = MidiOutput::new("pulsetrain-probe")
            .map_err(|e| Error::Midi(format!("Failed to create MIDI output: {}", e)))?;

        Ok(midi_out
            .ports()
            .iter()
            .enumerate()
            .map(|(index, port)| {
                midi_out
                    .port_name(port)
                    .unwrap_or_else(|_| format!("Unknown Device {}", index))
            })
            .collect())
    }

    /// A hardware or virtual output port opened through midir.
    pub struct MidirSink {
        connection: MidiOutputConnection,
        port_name: String,
    }

    impl MidirSink {
        /// Open the first port whose name contains `query` (case-insensitive),
        /// or the first port at all when no query is given.
        pub fn open(client_name: &str, query: Option<&str>) -> Result<Self> {
            let midi_out = MidiOutput::new(client_name)
                .map_err(|e| Error::Midi(format!("Failed to create MIDI output: {}", e)))?;

            let ports = midi_out.ports();
            let query_lower = query.map(str::to_lowercase);
            let (port, port_name) = ports
                .iter()
                .filter_map(|port| midi_out.port_name(port).ok().map(|name| (port, name)))
                .find(|(_, name)| match &query_lower {
                    Some(q) => name.to_lowercase().contains(q),
                    None => true,
                })
                .ok_or_else(|| match query {
                    Some(q) => Error::Midi(format!("No MIDI output found matching '{}'", q)),
                    None => Error::Midi("No MIDI output ports available".to_string()),
                })?;

            let connection = midi_out
                .connect(port, "pulsetrain-out")
                .map_err(|e| Error::Midi(format!("Failed to connect to '{}': {}", port_name, e)))?;

            log::info!("Connected to MIDI output: {}", port_name);
            Ok(Self { connection, port_name })
        }
    }

    impl MidiSink for MidirSink {
        fn send(&mut self, bytes: &[u8]) -> Result<()> {
            self.connection
                .send(bytes)
                .map_err(|e| Error::Midi(format!("Send to '{}' failed: {}", self.port_name, e)))
        }

        fn name(&self) -> &str {
            &self.port_name
        }
    }
}
