//! Command-line interface implementation

use clap::Parser;
use std::error::Error;
use std::io::{self, Write};
use std::time::Duration;

use crate::audio::{Buffer, SourceId};
use crate::config::Settings;

/// Command-line arguments for voicepool-play
#[derive(Parser, Debug)]
#[command(author, version, about = "Plays audio files through a pooled virtual device", long_about = None)]
pub struct Args {
    /// Files to play, one after another
    #[arg(required = true)]
    pub files: Vec<String>,

    /// Load buffers on the background worker
    #[arg(short = 'a', long = "async")]
    pub async_load: bool,

    /// Stream files instead of loading them whole
    #[arg(short, long, conflicts_with = "async_load")]
    pub stream: bool,

    /// Background worker wake interval in milliseconds
    #[arg(short, long, env = "VOICEPOOL_WAKE_INTERVAL")]
    pub wake_interval: Option<u32>,

    /// Voices offered by the virtual device
    #[arg(short, long, env = "VOICEPOOL_VOICES")]
    pub voices: Option<usize>,

    /// Priority of the playing source
    #[arg(short, long)]
    pub priority: Option<u32>,

    /// Tracing filter (overridden by RUST_LOG)
    #[arg(short, long, env = "VOICEPOOL_LOG")]
    pub log: Option<String>,

    /// Config file path
    #[arg(short, long, env = "VOICEPOOL_CONFIG")]
    pub config: Option<String>,
}

impl Args {
    /// Folds command-line overrides into `settings`.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(interval) = self.wake_interval {
            settings.async_wake_interval_ms = interval;
        }
        if let Some(voices) = self.voices {
            settings.virtual_voices = voices;
        }
        if let Some(priority) = self.priority {
            settings.default_priority = priority;
        }
        if let Some(log) = &self.log {
            settings.log_filter = log.clone();
        }
    }
}

/// CLI user interface for the player
pub struct Cli {
    pub args: Args,
}

impl Cli {
    /// Create a new CLI instance
    pub fn new() -> Self {
        Cli {
            args: Args::parse(),
        }
    }

    /// One-line description of a loaded buffer
    pub fn describe_buffer(buffer: &Buffer) -> String {
        let frequency = buffer.frequency().max(1);
        let seconds = buffer.length() as f64 / f64::from(frequency);
        format!(
            "{} {}, {}hz, {} frames ({:.2}s)",
            buffer.channel_config(),
            buffer.sample_type(),
            buffer.frequency(),
            buffer.length(),
            seconds
        )
    }

    /// Formats a playback position as m:ss
    pub fn format_position(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        format!("{}:{:02}", secs / 60, secs % 60)
    }

    /// Display the file about to play
    pub fn display_now_playing(&self, name: &str, detail: &str) {
        println!("Playing {} ({})", name, detail);
    }

    /// Display playback progress on a single line
    pub fn display_progress(&self, source: SourceId, elapsed: Duration) {
        print!("\r  {} {}", source, Self::format_position(elapsed));
        let _ = io::stdout().flush();
    }

    /// Display error messages
    pub fn display_error(&self, error: &dyn Error) {
        eprintln!("Error: {}", error);
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}
