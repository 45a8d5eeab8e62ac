use std::{path::PathBuf, time::Duration};

use audio_worker::{config::SupervisorConfig, protocol::CommandRecord};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about = "Plays audio through an out-of-process worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Spawn a worker for FILE and stream its audio.
    ///
    /// Runtime commands are read from stdin, one per line. Type `help` for the list.
    Play(PlayParams),
}

#[derive(Clone, Debug, Args)]
pub struct PlayParams {
    /// The media file to play.
    pub file: String,

    /// The worker id. A fresh one is generated if not provided.
    #[arg(long)]
    pub id: Option<String>,

    /// The session the worker belongs to.
    #[arg(long, default_value = "")]
    pub guild: String,

    /// Initial volume in percent.
    ///
    /// Values above 500 are clamped.
    #[arg(long, short = 'v')]
    pub volume: Option<u32>,

    /// Initial position, in `[[h:]m:]s` form.
    #[arg(long, short = 's')]
    pub seek: Option<String>,

    /// An effect to apply, in the engine's filter syntax. May be repeated; order is kept.
    #[arg(long = "effect", short = 'e')]
    pub effects: Vec<String>,

    /// Make the worker log at debug level.
    #[arg(long)]
    pub debug: bool,

    /// Where to write the raw audio (s16le, 48 kHz, stereo). Defaults to stdout.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// How long to wait for the worker to start streaming, in milliseconds.
    #[clap(default_value = "10000")]
    #[arg(long = "ready-timeout")]
    pub ready_timeout: u64,

    /// The media engine to run. Defaults to `ffmpeg` from `PATH`.
    #[arg(long)]
    pub engine: Option<PathBuf>,

    /// The directory to create the audio FIFO in. Defaults to the temporary directory.
    #[arg(long = "fifo-dir")]
    pub fifo_dir: Option<PathBuf>,

    /// Whether to collect a backtrace of a worker that failed to report readiness in time.
    ///
    /// The backtrace is written next to the FIFO.
    #[clap(default_value = "false")]
    #[arg(long = "backtrace-on-timeout")]
    pub backtrace_on_timeout: bool,
}

impl PlayParams {
    pub fn config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig::default();
        if let Some(ref engine) = self.engine {
            config.engine = engine.clone();
        }
        if let Some(ref dir) = self.fifo_dir {
            config.fifo_dir = dir.clone();
        }
        config.ready_timeout = Duration::from_millis(self.ready_timeout);
        config
    }

    pub fn record(&self) -> CommandRecord {
        let mut record =
            CommandRecord::create_processor(self.id.clone().unwrap_or_default(), &self.file);
        record.guild_id = self.guild.clone();
        record.debug = self.debug;
        record.volume = self.volume;
        record.seek = self.seek.clone();
        record.helper_chain = self.effects.clone();
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_worker::config;

    #[test]
    fn play_flags_map_onto_the_record() {
        let cli = Cli::parse_from([
            "audio-worker",
            "play",
            "/tmp/a.mp3",
            "--id",
            "w1",
            "--guild",
            "42",
            "-v",
            "150",
            "-e",
            "bass=g=5",
            "-e",
            "atempo=1.25",
            "--ready-timeout",
            "250",
        ]);
        let Commands::Play(params) = cli.command;
        let record = params.record();
        assert_eq!(record.id, "w1");
        assert_eq!(record.guild_id, "42");
        assert_eq!(record.file_path, "/tmp/a.mp3");
        assert_eq!(record.volume, Some(150));
        assert_eq!(record.helper_chain, vec!["bass=g=5", "atempo=1.25"]);
        assert_eq!(
            params.config().ready_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn defaults() {
        let Commands::Play(params) = Cli::parse_from(["audio-worker", "play", "x.ogg"]).command;
        let record = params.record();
        assert!(record.id.is_empty());
        assert_eq!(record.volume, None);
        assert!(!params.backtrace_on_timeout);
        assert_eq!(
            params.config().ready_timeout,
            config::DEFAULT_READY_TIMEOUT
        );
    }
}
