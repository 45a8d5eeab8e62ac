//! The worker registry. Maps worker ids to their live state so that commands can be routed to the
//! right worker and terminated workers can be reaped.
//!
//! The map is the only shared mutable structure of the subsystem. Every operation takes the lock
//! once and never holds it across an await point.

use std::{
    collections::HashMap,
    os::fd::RawFd,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    dispatcher::{DispatcherHandle, StopReason},
    error::{DescriptorError, RegistryError},
    fifo,
    util::alarm::Alarm,
};

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Spawning,
    AwaitingReady,
    Ready,
    Running,
    ShuttingDown,
    /// Did not become ready, reported a failure, or lost its channel.
    Failed,
    Reaped,
}

/// Descriptor numbers of a worker's control channel.
///
/// The parent ends are live in the parent. The child ends are the fixed numbers the ends occupy
/// inside the worker; in the parent they were closed right after spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptors {
    pub parent_read: RawFd,
    pub parent_write: RawFd,
    pub child_read: RawFd,
    pub child_write: RawFd,
}

/// A snapshot of a worker as known to the registry.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub id: String,
    pub guild_id: String,
    pub pid: Option<u32>,
    pub descriptors: Option<Descriptors>,
    pub audio_stream_fifo_path: PathBuf,
    pub phase: Phase,
    /// The status the worker reported, once it did.
    pub ready: Option<i32>,
}

impl WorkerState {
    /// The state of a worker that is about to be spawned.
    pub fn spawning(
        id: impl Into<String>,
        guild_id: impl Into<String>,
        audio_stream_fifo_path: PathBuf,
    ) -> Self {
        Self {
            id: id.into(),
            guild_id: guild_id.into(),
            pid: None,
            descriptors: None,
            audio_stream_fifo_path,
            phase: Phase::Spawning,
            ready: None,
        }
    }
}

/// The live resources of a spawned worker. Owned by the registry until reaped.
pub(crate) struct Link {
    pub dispatcher: DispatcherHandle,
    pub dispatcher_task: JoinHandle<Result<StopReason, DescriptorError>>,
    /// Asks the exit watcher to SIGKILL the process.
    pub kill: Arc<Notify>,
    /// The exit status, published by the exit watcher.
    pub exit: watch::Receiver<Option<i32>>,
    pub exit_watcher: JoinHandle<()>,
}

struct Entry {
    state: WorkerState,
    ready: Arc<Alarm<i32>>,
    link: Option<Link>,
}

#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a worker. Fails if its id is taken by a worker that has not been reaped yet.
    pub fn register(&self, state: WorkerState) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&state.id) {
            return Err(RegistryError::DuplicateId(state.id));
        }
        entries.insert(
            state.id.clone(),
            Entry {
                state,
                ready: Arc::new(Alarm::new()),
                link: None,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Result<WorkerState, RegistryError> {
        let entries = self.entries.lock();
        let entry = entries.get(id).ok_or_else(|| not_found(id))?;
        let mut state = entry.state.clone();
        state.ready = entry.ready.get();
        Ok(state)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Records the readiness status of `id`.
    ///
    /// Only the first call has an effect; later calls return `Ok(false)`.
    pub fn mark_ready(&self, id: &str, status: i32) -> Result<bool, RegistryError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id).ok_or_else(|| not_found(id))?;
        if !entry.ready.trigger(status) {
            return Ok(false);
        }
        if matches!(entry.state.phase, Phase::Spawning | Phase::AwaitingReady) {
            entry.state.phase = if status == 0 {
                Phase::Ready
            } else {
                Phase::Failed
            };
        }
        debug!(id, status, phase = ?entry.state.phase, "worker marked ready");
        Ok(true)
    }

    /// Waits until `id` is marked ready and returns its status.
    ///
    /// On timeout the worker is marked failed; tearing it down is up to the caller.
    pub async fn wait_ready(&self, id: &str, limit: Duration) -> Result<i32, RegistryError> {
        let ready = {
            let entries = self.entries.lock();
            entries.get(id).ok_or_else(|| not_found(id))?.ready.clone()
        };
        match timeout(limit, ready.triggered()).await {
            Ok(status) => Ok(status),
            Err(_) => {
                if let Some(entry) = self.entries.lock().get_mut(id) {
                    if entry.ready.get().is_none() {
                        entry.state.phase = Phase::Failed;
                    }
                }
                Err(RegistryError::ReadyTimeout {
                    id: id.to_string(),
                    timeout: limit,
                })
            }
        }
    }

    /// Moves `id` to `phase`. Returns the previous phase.
    pub fn set_phase(&self, id: &str, phase: Phase) -> Result<Phase, RegistryError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id).ok_or_else(|| not_found(id))?;
        Ok(std::mem::replace(&mut entry.state.phase, phase))
    }

    /// Moves `id` from `from` to `to`. Returns whether the transition happened.
    pub fn transition(&self, id: &str, from: Phase, to: Phase) -> Result<bool, RegistryError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id).ok_or_else(|| not_found(id))?;
        if entry.state.phase != from {
            return Ok(false);
        }
        entry.state.phase = to;
        Ok(true)
    }

    /// Removes the worker, closing its descriptors and unlinking its FIFO.
    ///
    /// Meant for workers whose process has exited, or never existed. A process that is still
    /// alive is killed first.
    pub async fn reap(&self, id: &str) -> Result<WorkerState, RegistryError> {
        let entry = self
            .entries
            .lock()
            .remove(id)
            .ok_or_else(|| not_found(id))?;
        let Entry {
            mut state,
            ready,
            link,
        } = entry;

        if let Some(link) = link {
            link.close(id).await;
        }
        if let Err(e) = fifo::remove(&state.audio_stream_fifo_path) {
            warn!(id, "failed to remove audio fifo: {e}");
        }

        state.ready = ready.get();
        state.phase = Phase::Reaped;
        debug!(id, "worker reaped");
        Ok(state)
    }

    /// Records what spawn produced. Called once per worker, during spawn.
    pub(crate) fn attach(
        &self,
        id: &str,
        pid: Option<u32>,
        descriptors: Descriptors,
        link: Link,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id).ok_or_else(|| not_found(id))?;
        entry.state.pid = pid;
        entry.state.descriptors = Some(descriptors);
        // The worker may have reported in before spawn got here.
        if entry.state.phase == Phase::Spawning {
            entry.state.phase = Phase::AwaitingReady;
        }
        entry.link = Some(link);
        Ok(())
    }

    /// Drops the entry of a worker whose spawn failed. Leaves the FIFO alone.
    pub(crate) fn discard(&self, id: &str) {
        self.entries.lock().remove(id);
    }

    pub(crate) fn with_link<R>(
        &self,
        id: &str,
        f: impl FnOnce(&Link) -> R,
    ) -> Result<R, RegistryError> {
        let entries = self.entries.lock();
        let entry = entries.get(id).ok_or_else(|| not_found(id))?;
        // A worker that is still spawning is not reachable yet.
        entry.link.as_ref().map(f).ok_or_else(|| not_found(id))
    }
}

impl Link {
    async fn close(self, id: &str) {
        self.dispatcher.stop();
        match self.dispatcher_task.await {
            Ok(Ok(reason)) => debug!(id, ?reason, "dispatcher joined"),
            Ok(Err(e)) => debug!(id, "dispatcher ended with error: {e}"),
            Err(join_err) if join_err.is_panic() => {
                let panic = crate::panic::panic_to_string(
                    "dispatcher panicked",
                    join_err.into_panic(),
                );
                warn!(id, "{panic}");
            }
            Err(_) => {}
        }

        let mut exit = self.exit;
        if exit.borrow().is_none() {
            warn!(id, "reaping a live worker, killing it");
            self.kill.notify_one();
        }
        let _ = exit.wait_for(|status| status.is_some()).await;
        let _ = self.exit_watcher.await;
    }
}

fn not_found(id: &str) -> RegistryError {
    RegistryError::NotFound(id.to_string())
}
