use std::{path::PathBuf, time::Duration};

use which::which;

use crate::{fifo::DEFAULT_FIFO_MODE, spawn::WorkerProgram};

/// The environment variable through which a worker learns which media engine to run.
pub const ENGINE_ENV: &str = "AUDIO_WORKER_ENGINE";

/// The environment variable through which a worker learns where its audio FIFO is.
pub const FIFO_ENV: &str = "AUDIO_WORKER_FIFO";

/// The engine used when none is configured and none is found in `PATH`.
pub const DEFAULT_ENGINE: &str = "ffmpeg";

/// How long [`crate::supervisor::Supervisor::wait_ready`] callers wait by default.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound of a single inbound wait of a dispatcher.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// The directory worker FIFOs are created in. Must exist.
    pub fifo_dir: PathBuf,
    /// The access mode of worker FIFOs.
    pub fifo_mode: u32,
    /// The media engine executable handed to workers.
    pub engine: PathBuf,
    /// What to execute as a worker.
    pub worker_program: WorkerProgram,
    /// Upper bound of a single inbound wait of the parent-side dispatchers.
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            fifo_dir: std::env::temp_dir(),
            fifo_mode: DEFAULT_FIFO_MODE,
            engine: locate_engine(),
            worker_program: WorkerProgram::CurrentExe,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Resolves the default engine through `PATH`, falling back to the bare name.
pub fn locate_engine() -> PathBuf {
    which(DEFAULT_ENGINE).unwrap_or_else(|_| PathBuf::from(DEFAULT_ENGINE))
}
