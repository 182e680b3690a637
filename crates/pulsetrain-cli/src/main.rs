//! pulse - command line front end for pulsetrain
//!
//! Plays playback requests (TOML or JSON) on a MIDI output port with a
//! generated clock, renders them to Standard MIDI Files, and sends one-shot
//! messages.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pulsetrain_core::{
    config::Config,
    recorder,
    sink::{list_output_ports, shared, LogSink, MidirSink, SharedSink},
    Conductor, Lane, OneShot, PlaybackRequest, SessionStatus,
};

#[derive(Parser)]
#[command(name = "pulse")]
#[command(author, version, about = "Beat-addressed MIDI sequencing with a master clock", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: ~/.config/pulsetrain/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a request file on a MIDI output
    Play {
        /// Request file (.toml or .json)
        request: PathBuf,
        /// Output port name (substring match, overrides the config)
        #[arg(short, long)]
        port: Option<String>,
        /// Also write the compiled timeline to this .mid file
        #[arg(long)]
        export: Option<PathBuf>,
        /// Log messages instead of opening a port
        #[arg(long)]
        dry_run: bool,
    },
    /// Compile a request file straight to a .mid file
    Render {
        request: PathBuf,
        output: PathBuf,
    },
    /// Summarize a .mid file
    Inspect {
        file: PathBuf,
    },
    /// List available MIDI output ports
    Ports,
    /// Create a default configuration file
    Init,
    /// Show the configuration file path
    ConfigPath,
    /// Send a single message immediately
    Send {
        #[command(subcommand)]
        message: SendCommand,
        /// Output port name (substring match, overrides the config)
        #[arg(short, long, global = true)]
        port: Option<String>,
        /// Log messages instead of opening a port
        #[arg(long, global = true)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum SendCommand {
    /// Play a note for a duration
    Note {
        note: i64,
        #[arg(long, default_value = "100")]
        velocity: i64,
        /// Channel (1-16)
        #[arg(long, default_value = "1")]
        channel: i64,
        /// Duration in seconds
        #[arg(long, default_value = "0.5")]
        duration: f64,
    },
    /// Send a control change
    Cc {
        controller: i64,
        value: i64,
        #[arg(long, default_value = "1")]
        channel: i64,
    },
    /// Set a named or inline (cc:N, nrpn:MSB:LSB) parameter
    Param {
        name: String,
        value: i64,
        #[arg(long, default_value = "1")]
        channel: i64,
    },
    /// Send a program change (1-128)
    Program {
        program: i64,
        #[arg(long, default_value = "1")]
        channel: i64,
    },
    /// Send SysEx given as hex ("F0 43 10 F7" or "4310")
    Sysex {
        hex: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let path = Config::create_default_config_file()?;
            println!("Created default config at: {}", path.display());
            Ok(())
        }
        Commands::ConfigPath => {
            let path = Config::config_path()?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Ports => {
            let ports = list_output_ports()?;
            if ports.is_empty() {
                println!("No MIDI output ports found");
            } else {
                println!("Available MIDI output ports:");
                for port in ports {
                    println!("  {}", port);
                }
            }
            Ok(())
        }
        Commands::Play { request, port, export, dry_run } => {
            let config = load_config(cli.config.as_deref())?;
            play(&config, &request, port, export, dry_run)
        }
        Commands::Render { request, output } => {
            let config = load_config(cli.config.as_deref())?;
            let request = load_request(&request)?;
            let conductor = Conductor::from_config(&config, shared(LogSink));
            let timeline = conductor.compile(&request)?;
            recorder::write_file(&timeline, &output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "Rendered {} actions ({} bars at {}) to {}",
                timeline.len(),
                timeline.bars(),
                timeline.tempo(),
                output.display()
            );
            Ok(())
        }
        Commands::Inspect { file } => inspect(&file),
        Commands::Send { message, port, dry_run } => {
            let config = load_config(cli.config.as_deref())?;
            let sink = open_sink(&config, port, dry_run)?;
            let conductor = Conductor::from_config(&config, sink);
            let shot = match message {
                SendCommand::Note { note, velocity, channel, duration } => OneShot::Note {
                    channel,
                    note,
                    velocity,
                    duration_seconds: duration,
                },
                SendCommand::Cc { controller, value, channel } => {
                    OneShot::ControlChange { channel, controller, value }
                }
                SendCommand::Param { name, value, channel } => OneShot::Parameter { channel, name, value },
                SendCommand::Program { program, channel } => OneShot::ProgramChange { channel, program },
                SendCommand::Sysex { hex } => OneShot::SysEx(parse_hex(&hex)?),
            };
            conductor.send_now(&shot)?;
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load_from(path).with_context(|| format!("Failed to load config {}", path.display()))
        }
        None => Ok(Config::load_or_default()),
    }
}

fn load_request(path: &Path) -> Result<PlaybackRequest> {
    PlaybackRequest::load(path).with_context(|| format!("Failed to load request {}", path.display()))
}

fn open_sink(config: &Config, port: Option<String>, dry_run: bool) -> Result<SharedSink> {
    if dry_run {
        log::info!("Dry run: logging MIDI output");
        return Ok(shared(LogSink));
    }
    let query = port.or_else(|| config.output.port.clone());
    let sink = MidirSink::open(&config.output.client_name, query.as_deref())
        .context("Failed to open MIDI output")?;
    Ok(shared(sink))
}

fn play(
    config: &Config,
    request_path: &Path,
    port: Option<String>,
    export: Option<PathBuf>,
    dry_run: bool,
) -> Result<()> {
    let request = load_request(request_path)?;
    let conductor = Conductor::from_config(config, open_sink(config, port, dry_run)?);

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
        .context("Failed to install Ctrl-C handler")?;

    let id = conductor.play(&request)?;
    if let Some(timeline) = conductor.last_timeline() {
        println!(
            "Playing session {}: {} actions, {} bars at {} ({:.1} s). Ctrl-C to stop.",
            id,
            timeline.len(),
            timeline.bars(),
            timeline.tempo(),
            timeline.duration_seconds()
        );
    }

    while conductor.status() == SessionStatus::Running {
        if interrupted.load(Ordering::Relaxed) {
            log::info!("Interrupted, stopping session");
            conductor.stop()?;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    let status = conductor.wait()?;
    println!("Session {}", status);

    if let Some(path) = export {
        conductor
            .export(&path)
            .with_context(|| format!("Failed to export {}", path.display()))?;
        println!("Exported timeline to {}", path.display());
    }
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let timeline = recorder::read_file(path).with_context(|| format!("Failed to read {}", path.display()))?;
    println!("{}", path.display());
    println!(
        "  {} bars at {} ({:.1} s), {} actions",
        timeline.bars(),
        timeline.tempo(),
        timeline.duration_seconds(),
        timeline.len()
    );

    for (lane, label) in [
        (Lane::Transport, "transport"),
        (Lane::Trigger, "triggers"),
        (Lane::Melodic, "notes"),
        (Lane::Automation, "controls"),
        (Lane::System, "system"),
    ] {
        let count = timeline.iter().filter(|e| e.lane == lane).count();
        if count > 0 {
            let channels: Vec<String> = timeline.channels(lane).iter().map(|c| (c + 1).to_string()).collect();
            if channels.is_empty() {
                println!("  {:<10} {}", label, count);
            } else {
                println!("  {:<10} {} (channels {})", label, count, channels.join(", "));
            }
        }
    }

    for span in timeline.note_spans() {
        println!(
            "  ch {:>2}  note {:>3}  vel {:>3}  {:>8.3} -> {:>8.3}",
            span.channel + 1,
            span.note,
            span.velocity,
            span.on.to_float(),
            span.off.to_float()
        );
    }
    Ok(())
}

/// Parse hex bytes, ignoring whitespace.
fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if let Some(bad) = text.chars().find(|c| !c.is_ascii_whitespace() && !c.is_ascii_hexdigit()) {
        anyhow::bail!("Invalid hex digit '{}' in: {}", bad, text);
    }
    if digits.len() % 2 != 0 {
        anyhow::bail!("Hex string has an odd number of digits: {}", text);
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).context("Hex digits must be ASCII")?;
            u8::from_str_radix(pair, 16).with_context(|| format!("Invalid hex byte '{}'", pair))
        })
        .collect()
}
