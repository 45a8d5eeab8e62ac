//! The parent side. Spawns workers, talks to them and cleans up after them.
//!
//! Everything about a live worker is kept in the [`Registry`]. The supervisor only adds the
//! process machinery on top: the control pipes, the FIFO, the exit watcher and the per-worker
//! dispatcher task.

use std::{
    ffi::OsString,
    os::{fd::AsRawFd as _, unix::process::ExitStatusExt as _},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::unix::pipe,
    process::Child,
    sync::{mpsc, watch, Notify},
};
use tracing::{debug, info, warn};

use crate::{
    backtrace::{self, Debugger},
    channel::{self, ControlPipes},
    config::{SupervisorConfig, ENGINE_ENV, FIFO_ENV},
    dispatcher::{self, Handlers, Route, StopReason},
    error::{DescriptorError, Error, SpawnError},
    fifo,
    protocol::{CommandKind, CommandRecord},
    registry::{Descriptors, Link, Phase, Registry, WorkerState},
    spawn::{self, CHILD_READ_FD, CHILD_WRITE_FD},
};

/// The status a worker is marked ready with when its channel goes away before it reported.
pub const STATUS_CHANNEL_LOST: i32 = -1;

/// A notification about a worker, delivered in the order it happened for that worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEvent {
    pub id: String,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEventKind {
    /// The worker reported its readiness status. 0 means it is streaming.
    Ready(i32),
    /// The worker exited cleanly.
    Finished,
    /// The worker exited with an error or lost its channel.
    Failed(String),
}

type Events = mpsc::UnboundedSender<WorkerEvent>;

pub struct Supervisor {
    config: SupervisorConfig,
    registry: Arc<Registry>,
    events: Events,
}

impl Supervisor {
    /// Creates a supervisor over `registry`. The receiver gets the events of every worker.
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<Registry>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                registry,
                events,
            },
            rx,
        )
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// A worker id that is unlikely to collide with any other.
    pub fn fresh_id() -> String {
        format!("w-{}", hex::encode(rand::random::<[u8; 4]>()))
    }

    /// Spawns a worker for `record` and sends it the record.
    ///
    /// The record is sent as a create record. An empty id is replaced by [`Self::fresh_id`].
    /// Returns once the worker process exists; use [`Self::wait_ready`] to learn whether it
    /// started streaming. On failure nothing is left behind.
    pub async fn spawn(&self, mut record: CommandRecord) -> Result<WorkerState, SpawnError> {
        if record.id.is_empty() {
            record.id = Self::fresh_id();
        }
        record.command = Some(CommandKind::CreateProcessor);
        let id = record.id.clone();
        let fifo_path = fifo::fifo_path(&self.config.fifo_dir, &id);

        // Claim the id first, so a duplicate never touches the FIFO of a live worker.
        self.registry.register(WorkerState::spawning(
            &id,
            &record.guild_id,
            fifo_path.clone(),
        ))?;

        match self.spawn_registered(record, &fifo_path).await {
            Ok(state) => {
                info!(id, pid = ?state.pid, "worker spawned");
                Ok(state)
            }
            Err(e) => {
                self.registry.discard(&id);
                // The id was ours, so whatever sits at its FIFO path was created by this spawn.
                if let Err(e) = fifo::remove(&fifo_path) {
                    warn!(id, "failed to remove audio fifo: {e}");
                }
                Err(e)
            }
        }
    }

    async fn spawn_registered(
        &self,
        record: CommandRecord,
        fifo_path: &Path,
    ) -> Result<WorkerState, SpawnError> {
        let id = record.id.clone();
        let ControlPipes { parent, child } = ControlPipes::new().map_err(SpawnError::Pipe)?;
        fifo::create(fifo_path, self.config.fifo_mode).map_err(|source| SpawnError::Fifo {
            path: fifo_path.to_path_buf(),
            source,
        })?;

        let descriptors = Descriptors {
            parent_read: parent.read.as_raw_fd(),
            parent_write: parent.write.as_raw_fd(),
            child_read: CHILD_READ_FD,
            child_write: CHILD_WRITE_FD,
        };
        // Attach the parent ends before there is a process that could be orphaned.
        let rd_stream = channel::reader(parent.read).map_err(SpawnError::Channel)?;
        let wr_stream = channel::writer(parent.write).map_err(SpawnError::Channel)?;

        let envs = [
            (ENGINE_ENV, self.config.engine.clone().into_os_string()),
            (FIFO_ENV, OsString::from(fifo_path)),
        ];
        let process = spawn::spawn_worker(&self.config.worker_program, &envs, child)
            .map_err(SpawnError::Process)?;
        let pid = process.id();

        // The exit watcher owns the process from here on. A spawn that fails later must kill it.
        let kill = Arc::new(Notify::new());
        let (exit_tx, exit) = watch::channel(None);
        let exit_watcher = tokio::spawn(watch_exit(
            process,
            kill.clone(),
            exit_tx,
            self.events.clone(),
            id.clone(),
        ));

        let (dispatcher, dispatcher_task) = dispatcher::run(
            format!("parent:{id}"),
            rd_stream,
            wr_stream,
            self.handlers(&id),
            self.config.poll_interval,
        );
        // The create record is the first thing the worker reads.
        if let Err(e) = dispatcher.send(record) {
            kill.notify_one();
            return Err(SpawnError::Channel(std::io::Error::other(e)));
        }
        let dispatcher_task = tokio::spawn(supervise_channel(
            dispatcher_task,
            self.registry.clone(),
            self.events.clone(),
            id.clone(),
        ));

        let link = Link {
            dispatcher,
            dispatcher_task,
            kill: kill.clone(),
            exit,
            exit_watcher,
        };
        if let Err(e) = self.registry.attach(&id, pid, descriptors, link) {
            // Reaped while spawning. Nobody else will ever stop this process.
            warn!(id, "worker entry vanished during spawn: {e}");
            kill.notify_one();
            return Err(e.into());
        }
        Ok(self.registry.lookup(&id)?)
    }

    fn handlers(&self, id: &str) -> Handlers {
        let on_update = {
            let registry = self.registry.clone();
            let events = self.events.clone();
            let id = id.to_string();
            move |record: CommandRecord| {
                let Some(status) = record.ready else {
                    debug!(id, ?record, "ignoring worker update");
                    return;
                };
                match registry.mark_ready(&id, status) {
                    Ok(true) => {
                        let _ = events.send(WorkerEvent {
                            id: id.clone(),
                            kind: WorkerEventKind::Ready(status),
                        });
                    }
                    Ok(false) => debug!(id, status, "duplicate readiness report"),
                    Err(e) => debug!(id, "readiness for a reaped worker: {e}"),
                }
            }
        };
        let on_shutdown = {
            let registry = self.registry.clone();
            let id = id.to_string();
            move |_| {
                debug!(id, "worker announced shutdown");
                let _ = registry.set_phase(&id, Phase::ShuttingDown);
            }
        };
        Handlers::new()
            .on(Route::Update, on_update)
            .on(Route::Command(CommandKind::Shutdown), on_shutdown)
            .on(Route::Command(CommandKind::CreateProcessor), |record| {
                warn!(id = %record.id, "worker sent a create record, ignoring");
            })
    }

    /// Queues `record` for the worker `id`. An empty record id is filled in.
    pub fn send(&self, id: &str, mut record: CommandRecord) -> Result<(), Error> {
        if record.id.is_empty() {
            record.id = id.to_string();
        }
        self.registry.with_link(id, |link| link.dispatcher.send(record))??;
        Ok(())
    }

    /// Waits until `id` reports its readiness status, for at most `limit`.
    pub async fn wait_ready(&self, id: &str, limit: Duration) -> Result<i32, Error> {
        Ok(self.registry.wait_ready(id, limit).await?)
    }

    /// Records a readiness status on behalf of `id`. Only the first status counts.
    pub fn mark_ready(&self, id: &str, status: i32) -> Result<bool, Error> {
        Ok(self.registry.mark_ready(id, status)?)
    }

    /// Cuts the pending inbound wait on the channel of `id` short.
    pub fn wake(&self, id: &str) -> Result<(), Error> {
        Ok(self.registry.with_link(id, |link| link.dispatcher.wake())?)
    }

    /// Asks the worker to stop streaming and exit.
    pub fn shutdown(&self, id: &str) -> Result<(), Error> {
        let previous = self.registry.set_phase(id, Phase::ShuttingDown)?;
        debug!(id, ?previous, "shutting down worker");
        self.send(id, CommandRecord::shutdown(id))
    }

    /// Opens the consuming end of the audio FIFO of `id`.
    pub fn open_audio_stream(&self, id: &str) -> Result<pipe::Receiver, Error> {
        let state = self.registry.lookup(id)?;
        let stream = fifo::open_reader(&state.audio_stream_fifo_path)?;
        self.registry.transition(id, Phase::Ready, Phase::Running)?;
        Ok(stream)
    }

    /// Waits for the process of `id` to exit and returns its exit status.
    ///
    /// A process killed by a signal reports 128 plus the signal number.
    pub async fn wait_exit(&self, id: &str) -> Result<i32, Error> {
        let mut exit = self.registry.with_link(id, |link| link.exit.clone())?;
        let status = *exit
            .wait_for(|status| status.is_some())
            .await
            .map_err(|_| DescriptorError::Closed)?;
        // UNWRAP: the predicate above guarantees a value.
        Ok(status.unwrap())
    }

    /// Removes a worker whose process is gone. A live process is killed first.
    pub async fn reap(&self, id: &str) -> Result<WorkerState, Error> {
        Ok(self.registry.reap(id).await?)
    }

    /// Kills the worker `id` and reaps it.
    ///
    /// This returns only when the process is dead and the resources are cleaned up.
    pub async fn teardown(&self, id: &str) -> Result<WorkerState, Error> {
        let _ = self.registry.set_phase(id, Phase::ShuttingDown);
        if let Ok(kill) = self.registry.with_link(id, |link| link.kill.clone()) {
            kill.notify_one();
        }
        self.reap(id).await
    }

    /// Attaches a debugger to the worker `id` and writes a report of its stacks next to its FIFO.
    ///
    /// Returns the path of the report.
    pub async fn collect_backtrace(&self, id: &str) -> anyhow::Result<PathBuf> {
        let state = self.registry.lookup(id)?;
        let debugger =
            Debugger::locate().ok_or_else(|| anyhow::anyhow!("no gdb or lldb in PATH"))?;
        backtrace::collect(&state, &debugger).await
    }
}

/// Drives the dispatcher of one worker and records what its end means for the worker.
async fn supervise_channel(
    dispatcher_task: impl std::future::Future<Output = Result<StopReason, DescriptorError>>,
    registry: Arc<Registry>,
    events: Events,
    id: String,
) -> Result<StopReason, DescriptorError> {
    let result = dispatcher_task.await;
    let phase = registry.lookup(&id).map(|state| state.phase);
    match (&result, phase) {
        (_, Err(_)) => {
            // Reaped while the channel was still up.
        }
        (Ok(StopReason::PeerClosed), Ok(phase))
            if !matches!(phase, Phase::ShuttingDown | Phase::Failed) =>
        {
            // The exit watcher reports how it ended.
            debug!(id, ?phase, "worker closed its channel");
            let _ = registry.set_phase(&id, Phase::Failed);
        }
        (Err(e), Ok(phase)) if phase != Phase::ShuttingDown => {
            warn!(id, "control channel failed: {e}");
            let _ = registry.set_phase(&id, Phase::Failed);
            let _ = events.send(WorkerEvent {
                id: id.clone(),
                kind: WorkerEventKind::Failed(e.to_string()),
            });
        }
        _ => {}
    }
    // Nobody waiting for readiness should outlive the channel.
    let _ = registry.mark_ready(&id, STATUS_CHANNEL_LOST);
    result
}

/// Owns the worker process until it exits. Kills it when asked to.
async fn watch_exit(
    mut process: Child,
    kill: Arc<Notify>,
    exit_tx: watch::Sender<Option<i32>>,
    events: Events,
    id: String,
) {
    let mut killed = false;
    let status = tokio::select! {
        status = process.wait() => status,
        _ = kill.notified() => {
            killed = true;
            debug!(id, "killing worker");
            let _ = process.start_kill();
            process.wait().await
        }
    };
    let code = match status {
        Ok(status) => status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
        Err(e) => {
            warn!(id, "failed to wait for worker: {e}");
            STATUS_CHANNEL_LOST
        }
    };
    info!(id, code, "worker exited");
    let _ = exit_tx.send(Some(code));

    if killed {
        return;
    }
    let kind = if code == 0 {
        WorkerEventKind::Finished
    } else {
        WorkerEventKind::Failed(format!("worker exited with status {code}"))
    };
    let _ = events.send(WorkerEvent { id, kind });
}
