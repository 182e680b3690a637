//! Configuration file support for pulsetrain
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/pulsetrain/config.toml`
//! - macOS: `~/Library/Application Support/pulsetrain/config.toml`
//! - Windows: `%APPDATA%\pulsetrain\config.toml`

use crate::compiler::{CollisionPolicy, CompileOptions, DEFAULT_TRIGGER_LENGTH, MAX_CHANNEL};
use crate::conductor::PreemptionPolicy;
use crate::error::{check_u7, Error, Result};
use crate::params::ParameterTable;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// MIDI output configuration
    pub output: OutputSettings,
    /// Compilation and session behaviour
    pub playback: PlaybackSettings,
    /// Named automation targets
    pub parameters: ParameterTable,
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load and validate configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            log::debug!("Using default configuration: {}", e);
            Self::default()
        })
    }

    /// Save configuration to the default config file location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "pulsetrain") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, DEFAULT_CONFIG)?;
        Ok(path)
    }

    /// Check values that serde cannot check on its own
    pub fn validate(&self) -> Result<()> {
        check_u7("trigger channel", self.playback.trigger_channel as i64, 1, MAX_CHANNEL)?;
        let length = self.playback.trigger_length_seconds;
        if !length.is_finite() || length < 0.0 {
            return Err(Error::Config(format!(
                "trigger_length_seconds must be a non-negative number, got {length}"
            )));
        }
        self.parameters.validate()
    }

    /// Compiler settings derived from `[playback]`
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            trigger_channel: self.playback.trigger_channel.clamp(1, MAX_CHANNEL) - 1,
            trigger_length_seconds: self.playback.trigger_length_seconds,
            collision: self.playback.collision,
            clock_before_start: self.playback.clock_before_start,
        }
    }
}

const DEFAULT_CONFIG: &str = r#"# pulsetrain configuration file

[output]
# Client name shown to the MIDI system
client_name = "pulsetrain"

# Output port to open: first port whose name contains this text
# (case-insensitive). Leave unset to use the first available port.
# port = "Digitakt"

[playback]
# Channel (1-16) that receives track triggers without an explicit note
trigger_channel = 1

# Length of a track trigger in seconds
trigger_length_seconds = 0.05

# Send clock pulses from the session start even when Start comes later
clock_before_start = true

# Overlapping melody notes: "monophonic" (one note per channel)
# or "per_note" (only repeated pitches cut each other)
collision = "monophonic"

# A new session while one is running: "cancel_active" or "reject"
preemption = "cancel_active"

[parameters]
# Named automation targets, either a control change or an NRPN pair
# filter_cutoff = { cc = 74 }
# filter_resonance = { nrpn = [1, 21] }
"#;

/// MIDI output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Client name shown to the MIDI system
    pub client_name: String,
    /// Port name substring to match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            client_name: "pulsetrain".to_string(),
            port: None,
        }
    }
}

/// Playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Track trigger channel (1-16)
    pub trigger_channel: u8,
    /// Track trigger length in seconds
    pub trigger_length_seconds: f64,
    /// Run the clock before a delayed Start
    pub clock_before_start: bool,
    /// Overlapping note handling
    pub collision: CollisionPolicy,
    /// What happens to a running session when a new one starts
    pub preemption: PreemptionPolicy,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            trigger_channel: 1,
            trigger_length_seconds: DEFAULT_TRIGGER_LENGTH,
            clock_before_start: true,
            collision: CollisionPolicy::default(),
            preemption: PreemptionPolicy::default(),
        }
    }
}
