//! The media pipeline of a worker.
//!
//! Decoding and filtering are done by an external engine speaking ffmpeg's command line. The
//! pipeline reads raw s16le stereo from the engine, applies the volume in-process and writes the
//! result into the audio FIFO. A seek or a new effect chain restarts the engine, but never the
//! FIFO, so the consumer sees one continuous stream.

use std::{io, path::PathBuf, process::Stdio, time::Duration};

use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::unix::pipe,
    process::{Child, ChildStdout, Command},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::protocol::CommandRecord;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;
const BYTES_PER_SAMPLE: u64 = 2;
const BYTES_PER_SECOND: u64 = SAMPLE_RATE as u64 * CHANNELS as u64 * BYTES_PER_SAMPLE;

pub const DEFAULT_VOLUME: u32 = 100;
/// Volumes above this are clamped unless the update is forced.
pub const MAX_VOLUME: u32 = 500;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub engine: PathBuf,
    pub file_path: String,
    pub start: Duration,
    pub volume: u32,
    pub helper_chain: Vec<String>,
}

impl Settings {
    /// Builds the initial settings from a create record.
    pub fn from_record(engine: PathBuf, record: &CommandRecord) -> Self {
        let start = record
            .seek
            .as_deref()
            .and_then(|s| {
                let pos = parse_seek(s);
                if pos.is_none() {
                    warn!(seek = s, "ignoring malformed seek");
                }
                pos
            })
            .unwrap_or_default();
        Self {
            engine,
            file_path: record.file_path.clone(),
            start,
            volume: guard_volume(record.volume.unwrap_or(DEFAULT_VOLUME), record.force),
            helper_chain: record.helper_chain.clone(),
        }
    }

    /// The engine's arguments for decoding from `self.start`.
    pub fn engine_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-nostdin", "-hide_banner", "-loglevel", "error"]
            .map(String::from)
            .into();
        if !self.start.is_zero() {
            args.push("-ss".into());
            args.push(format!("{:.3}", self.start.as_secs_f64()));
        }
        args.push("-i".into());
        args.push(self.file_path.clone());
        if !self.helper_chain.is_empty() {
            args.push("-af".into());
            args.push(self.helper_chain.join(","));
        }
        args.extend(
            [
                "-f".to_string(),
                "s16le".to_string(),
                "-ar".to_string(),
                SAMPLE_RATE.to_string(),
                "-ac".to_string(),
                CHANNELS.to_string(),
                "pipe:1".to_string(),
            ],
        );
        args
    }
}

/// Parses `[[h:]m:]s[.fraction]`.
///
/// The most significant component is not bounded by its unit: `"83"` is 83 seconds and `"90:00"`
/// is ninety minutes. Inner components must stay below 60. Positions too large for a [`Duration`]
/// are rejected rather than saturated.
pub fn parse_seek(s: &str) -> Option<Duration> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    // UNWRAP: split always yields at least one part.
    let (last, leading) = parts.split_last().unwrap();
    let seconds: f64 = last.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 || (!leading.is_empty() && seconds >= 60.0) {
        return None;
    }

    let mut whole = 0u64;
    for (i, part) in leading.iter().enumerate() {
        let value: u64 = part.parse().ok()?;
        // Only the most significant component may exceed its unit.
        if i > 0 && value >= 60 {
            return None;
        }
        whole = whole.checked_mul(60)?.checked_add(value)?;
    }
    Duration::from_secs(whole.checked_mul(60)?)
        .checked_add(Duration::try_from_secs_f64(seconds).ok()?)
}

fn guard_volume(volume: u32, force: bool) -> u32 {
    if force {
        volume
    } else {
        volume.min(MAX_VOLUME)
    }
}

/// A live change requested by the parent.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Seek(Duration),
    Volume(u32),
    Chain { chain: Vec<String>, force: bool },
    Stop,
}

/// Turns an update record into pipeline controls. Invalid parts are logged and skipped.
pub fn controls(record: &CommandRecord) -> Vec<Control> {
    let mut controls = Vec::new();
    if let Some(ref seek) = record.seek {
        match parse_seek(seek) {
            Some(pos) => controls.push(Control::Seek(pos)),
            None => warn!(seek = %seek, "ignoring malformed seek"),
        }
    }
    if let Some(volume) = record.volume {
        controls.push(Control::Volume(guard_volume(volume, record.force)));
    }
    // A forced update with nothing else in it clears the chain.
    if !record.helper_chain.is_empty() || (record.force && controls.is_empty()) {
        controls.push(Control::Chain {
            chain: record.helper_chain.clone(),
            force: record.force,
        });
    }
    controls
}

/// Scales s16le samples in place by `volume` percent, saturating.
pub fn apply_gain(samples: &mut [u8], volume: u32) {
    if volume == 100 {
        return;
    }
    for sample in samples.chunks_exact_mut(2) {
        let value = i16::from_le_bytes([sample[0], sample[1]]) as i64;
        let scaled = (value * volume as i64 / 100).clamp(i16::MIN as i64, i16::MAX as i64);
        sample.copy_from_slice(&(scaled as i16).to_le_bytes());
    }
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The engine reached the end of the input. Carries the engine's exit status.
    Finished(i32),
    /// A stop was requested.
    Stopped,
}

struct Engine {
    child: Child,
    stdout: ChildStdout,
}

impl Engine {
    fn start(settings: &Settings) -> io::Result<Self> {
        debug!(engine = %settings.engine.display(), start = ?settings.start, "starting engine");
        let mut child = Command::new(&settings.engine)
            .args(settings.engine_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("engine stdout is not captured"))?;
        Ok(Self { child, stdout })
    }

    async fn stop(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

pub struct Pipeline {
    settings: Settings,
    engine: Engine,
    out: pipe::Sender,
    /// Bytes produced since the start of the input, at the current settings.
    position: u64,
}

impl Pipeline {
    /// Starts the engine. An error here means the worker never becomes ready.
    pub fn start(settings: Settings, out: pipe::Sender) -> io::Result<Self> {
        let engine = Engine::start(&settings)?;
        let position = duration_to_bytes(settings.start);
        Ok(Self {
            settings,
            engine,
            out,
            position,
        })
    }

    pub fn position(&self) -> Duration {
        Duration::from_secs_f64(self.position as f64 / BYTES_PER_SECOND as f64)
    }

    /// Pumps audio until the input ends or a stop is requested.
    ///
    /// A closed control queue counts as a stop.
    pub async fn run(mut self, mut controls: mpsc::UnboundedReceiver<Control>) -> io::Result<Outcome> {
        let mut buf = vec![0u8; READ_CHUNK];
        // Audio waiting for the FIFO, and how much of it was written.
        let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut written = 0;
        // An odd trailing byte, kept until the rest of its sample arrives.
        let mut carry: Option<u8> = None;

        loop {
            let flushing = written < pending.len();
            tokio::select! {
                control = controls.recv() => {
                    let Some(control) = control else {
                        self.engine.stop().await;
                        return Ok(Outcome::Stopped);
                    };
                    match control {
                        Control::Stop => {
                            self.engine.stop().await;
                            return Ok(Outcome::Stopped);
                        }
                        Control::Volume(volume) => {
                            debug!(volume, "volume changed");
                            self.settings.volume = volume;
                        }
                        Control::Seek(to) => {
                            info!(?to, "seeking");
                            self.settings.start = to;
                            self.restart().await?;
                            pending.clear();
                            written = 0;
                            carry = None;
                        }
                        Control::Chain { chain, force } => {
                            if chain == self.settings.helper_chain && !force {
                                continue;
                            }
                            info!(?chain, "effect chain changed");
                            self.settings.helper_chain = chain;
                            self.settings.start = self.position();
                            self.restart().await?;
                            carry = None;
                        }
                    }
                }
                n = self.out.write(&pending[written..]), if flushing => {
                    written += n?;
                }
                n = self.engine.stdout.read(&mut buf), if !flushing => {
                    let n = n?;
                    if n == 0 {
                        let status = self.engine.child.wait().await?;
                        let code = status.code().unwrap_or(-1);
                        self.out.flush().await?;
                        return Ok(Outcome::Finished(code));
                    }
                    self.position += n as u64;
                    pending.clear();
                    written = 0;
                    if let Some(b) = carry.take() {
                        pending.push(b);
                    }
                    pending.extend_from_slice(&buf[..n]);
                    if pending.len() % 2 == 1 {
                        carry = pending.pop();
                    }
                    apply_gain(&mut pending, self.settings.volume);
                }
            }
        }
    }

    async fn restart(&mut self) -> io::Result<()> {
        let engine = Engine::start(&self.settings)?;
        let old = std::mem::replace(&mut self.engine, engine);
        old.stop().await;
        self.position = duration_to_bytes(self.settings.start);
        Ok(())
    }
}

fn duration_to_bytes(d: Duration) -> u64 {
    // Whole frames only, so the stream never shifts by half a sample.
    let frame = CHANNELS as u64 * BYTES_PER_SAMPLE;
    (d.as_secs_f64() * BYTES_PER_SECOND as f64) as u64 / frame * frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_formats() {
        assert_eq!(parse_seek("83"), Some(Duration::from_secs(83)));
        assert_eq!(parse_seek("4:20"), Some(Duration::from_secs(260)));
        assert_eq!(
            parse_seek("1:02:03.5"),
            Some(Duration::from_millis(3_723_500))
        );
        assert_eq!(parse_seek("90:00"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_seek("0:61"), None);
        assert_eq!(parse_seek("1:60:00"), None);
        assert_eq!(parse_seek("1:2:3:4"), None);
        assert_eq!(parse_seek("-3"), None);
        assert_eq!(parse_seek("soon"), None);
        assert_eq!(parse_seek(""), None);
        // Out of range for a Duration.
        assert_eq!(parse_seek("1e300"), None);
        assert_eq!(parse_seek("307445734561825860:59"), None);
        assert_eq!(parse_seek("18446744073709551615:00:00"), None);
    }

    #[test]
    fn engine_args_follow_settings() {
        let mut settings = Settings {
            engine: PathBuf::from("ffmpeg"),
            file_path: "/tmp/a.mp3".into(),
            start: Duration::ZERO,
            volume: 100,
            helper_chain: vec![],
        };
        assert_eq!(
            settings.engine_args().join(" "),
            "-nostdin -hide_banner -loglevel error -i /tmp/a.mp3 -f s16le -ar 48000 -ac 2 pipe:1"
        );

        settings.start = Duration::from_millis(1500);
        settings.helper_chain = vec!["bass=g=5".into(), "atempo=1.25".into()];
        let args = settings.engine_args();
        assert_eq!(&args[4..6], ["-ss", "1.500"]);
        assert_eq!(&args[8..10], ["-af", "bass=g=5,atempo=1.25"]);
    }

    #[test]
    fn create_record_defaults() {
        let record = CommandRecord::create_processor("w1", "/tmp/a.mp3");
        let settings = Settings::from_record(PathBuf::from("ffmpeg"), &record);
        assert_eq!(settings.volume, DEFAULT_VOLUME);
        assert_eq!(settings.start, Duration::ZERO);

        let mut loud = record.clone();
        loud.volume = Some(900);
        assert_eq!(
            Settings::from_record(PathBuf::from("ffmpeg"), &loud).volume,
            MAX_VOLUME
        );
        loud.force = true;
        assert_eq!(
            Settings::from_record(PathBuf::from("ffmpeg"), &loud).volume,
            900
        );

        let mut far = record.clone();
        far.seek = Some("1e300".into());
        assert_eq!(
            Settings::from_record(PathBuf::from("ffmpeg"), &far).start,
            Duration::ZERO
        );
    }

    #[test]
    fn update_records_become_controls() {
        let mut record = CommandRecord::update("w1");
        record.seek = Some("1:00".into());
        record.volume = Some(50);
        record.helper_chain = vec!["aecho=0.8:0.9:1000:0.3".into()];
        assert_eq!(
            controls(&record),
            vec![
                Control::Seek(Duration::from_secs(60)),
                Control::Volume(50),
                Control::Chain {
                    chain: vec!["aecho=0.8:0.9:1000:0.3".into()],
                    force: false
                },
            ]
        );

        let mut bad = CommandRecord::update("w1");
        bad.seek = Some("later".into());
        assert!(controls(&bad).is_empty());
        bad.seek = Some("1e300".into());
        bad.volume = Some(80);
        assert_eq!(controls(&bad), vec![Control::Volume(80)]);

        let mut reapply = CommandRecord::update("w1");
        reapply.force = true;
        assert_eq!(
            controls(&reapply),
            vec![Control::Chain {
                chain: vec![],
                force: true
            }]
        );
    }

    #[test]
    fn gain_scales_and_saturates() {
        let mut samples = Vec::new();
        for s in [1000i16, -1000, 30000, i16::MIN] {
            samples.extend_from_slice(&s.to_le_bytes());
        }
        apply_gain(&mut samples, 200);
        let out: Vec<i16> = samples
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(out, vec![2000, -2000, i16::MAX, i16::MIN]);

        apply_gain(&mut samples, 0);
        assert!(samples.iter().all(|&b| b == 0));
    }

    #[test]
    fn byte_positions_are_frame_aligned() {
        assert_eq!(duration_to_bytes(Duration::from_secs(1)), BYTES_PER_SECOND);
        assert_eq!(duration_to_bytes(Duration::from_micros(10)) % 4, 0);
    }
}
