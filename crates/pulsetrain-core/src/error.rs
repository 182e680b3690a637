//! Error types for pulsetrain

use thiserror::Error;

/// Result type alias for pulsetrain operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while compiling, dispatching or recording a timeline
#[derive(Debug, Error)]
pub enum Error {
    /// Tempo was zero, negative or not a number
    #[error("Invalid tempo: {0} BPM (must be > 0)")]
    InvalidTempo(f64),

    /// A value fell outside its protocol-defined bounds
    #[error("{field} out of range: {value} (valid range: {min}-{max})")]
    InvalidRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// A parameter name could not be resolved to a CC or NRPN address
    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),

    /// Export was requested before anything was compiled
    #[error("No timeline available: nothing has been compiled yet")]
    NoTimelineAvailable,

    /// The output transport rejected a message mid-session
    #[error("Send failed at beat {beat:.3}: {reason}")]
    SendFailure { beat: f64, reason: String },

    /// A session was already running and the preemption policy forbids replacing it
    #[error("A session is already running")]
    SessionConflict,

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// MIDI backend error
    #[error("MIDI error: {0}")]
    Midi(String),

    /// Standard MIDI File could not be parsed
    #[error("MIDI file error: {0}")]
    Smf(#[from] midly::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build an [`Error::InvalidRange`] for an integer-valued field.
    pub(crate) fn range(field: &'static str, value: impl Into<f64>, min: u32, max: u32) -> Self {
        Error::InvalidRange {
            field,
            value: value.into(),
            min: min as f64,
            max: max as f64,
        }
    }
}

/// Check that `value` lies in `min..=max` and narrow it to a byte.
pub(crate) fn check_u7(field: &'static str, value: i64, min: u8, max: u8) -> Result<u8> {
    if value < min as i64 || value > max as i64 {
        return Err(Error::range(field, value as f64, min as u32, max as u32));
    }
    Ok(value as u8)
}
