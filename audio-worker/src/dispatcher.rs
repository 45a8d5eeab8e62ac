//! The command dispatcher. Every endpoint (the parent for each worker, and the worker itself) runs
//! one.
//!
//! Outbound records from any number of producers are queued and written by a single writer, one
//! whole line at a time. Inbound records are read, decoded and handed to the handler registered
//! for their route, strictly one after the other.
//!
//! The inbound wait multiplexes two independent sources: the control pipe and a wake signal. The
//! wait on the pipe is bounded by the poll interval, so a stop request is observed even if the
//! wake is never sent.

use std::{
    collections::HashMap,
    future::Future,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::SinkExt as _;
use tokio::{
    sync::{mpsc, watch, Notify},
    time::timeout,
};
use tokio_stream::StreamExt as _;
use tokio_util::codec::LinesCodecError;
use tracing::{debug, trace, warn};

use crate::{
    channel::{RdStream, WrStream, MAX_RECORD_LEN},
    error::{DescriptorError, ProtocolParseError},
    protocol::{CommandKind, CommandRecord},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Waiting,
    Dispatching,
    Stopped,
}

/// Observable state of a dispatcher loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub phase: Phase,
    /// How many times the inbound wait was cut short by [`DispatcherHandle::wake`].
    pub wakeups: u64,
}

/// Why the inbound loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A shutdown record was handled.
    Shutdown,
    /// [`DispatcherHandle::stop`] was called.
    Requested,
    /// The peer closed its write end.
    PeerClosed,
}

/// Where an inbound record goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Command(CommandKind),
    /// Records without a command.
    Update,
}

impl Route {
    pub fn of(record: &CommandRecord) -> Self {
        match record.command {
            Some(kind) => Route::Command(kind),
            None => Route::Update,
        }
    }
}

type Handler = Box<dyn FnMut(CommandRecord) + Send>;

/// The handler table of a dispatcher.
///
/// Handlers run on the dispatcher loop and must return promptly. Anything long-running must be
/// handed off to another task.
#[derive(Default)]
pub struct Handlers {
    map: HashMap<Route, Handler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        mut self,
        route: Route,
        handler: impl FnMut(CommandRecord) + Send + 'static,
    ) -> Self {
        self.map.insert(route, Box::new(handler));
        self
    }
}

struct Shared {
    label: String,
    outbound: mpsc::UnboundedSender<CommandRecord>,
    wake: Notify,
    drain: Notify,
    stop: AtomicBool,
    status: watch::Sender<Status>,
}

impl Shared {
    fn set_phase(&self, phase: Phase) {
        self.status.send_if_modified(|status| {
            let changed = status.phase != phase;
            status.phase = phase;
            changed
        });
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

/// A means to talk to a running dispatcher. Cheaply cloneable.
#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<Shared>,
}

impl DispatcherHandle {
    /// Queues a record for writing. Records from the same producer are written in order.
    ///
    /// Fails once the writer has stopped.
    pub fn send(&self, record: CommandRecord) -> Result<(), DescriptorError> {
        self.shared
            .outbound
            .send(record)
            .map_err(|_| DescriptorError::Closed)
    }

    /// Cuts the current inbound wait short, even if no data arrived.
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }

    /// Asks the loop to stop. Queued outbound records are still written.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn status(&self) -> watch::Receiver<Status> {
        self.shared.status.subscribe()
    }

    pub fn phase(&self) -> Phase {
        self.shared.status.borrow().phase
    }
}

/// Runs a dispatcher over the given channel ends.
///
/// The returned future must be polled for anything to happen. It resolves once the inbound loop
/// stopped and every queued outbound record was written, or with the first descriptor error.
pub fn run(
    label: impl Into<String>,
    rd_stream: RdStream,
    wr_stream: WrStream,
    handlers: Handlers,
    poll_interval: Duration,
) -> (
    DispatcherHandle,
    impl Future<Output = Result<StopReason, DescriptorError>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (status, _) = watch::channel(Status {
        phase: Phase::Idle,
        wakeups: 0,
    });
    let shared = Arc::new(Shared {
        label: label.into(),
        outbound: tx,
        wake: Notify::new(),
        drain: Notify::new(),
        stop: AtomicBool::new(false),
        status,
    });
    let handle = DispatcherHandle {
        shared: shared.clone(),
    };

    let task = async move {
        let inbound = async {
            let result = handle_inbound(&shared, rd_stream, handlers, poll_interval).await;
            shared.drain.notify_one();
            result
        };
        let outbound = handle_outbound(&shared, wr_stream, rx);
        let (inbound, outbound) = tokio::join!(inbound, outbound);
        shared.set_phase(Phase::Stopped);

        let reason = match (inbound, outbound) {
            (Err(e), _) | (Ok(_), Err(e)) => {
                debug!(label = %shared.label, "dispatcher failed: {e}");
                return Err(e);
            }
            (Ok(reason), Ok(())) => reason,
        };
        debug!(label = %shared.label, ?reason, "dispatcher stopped");
        Ok(reason)
    };

    (handle, task)
}

async fn handle_inbound(
    shared: &Shared,
    mut rd_stream: RdStream,
    mut handlers: Handlers,
    poll_interval: Duration,
) -> Result<StopReason, DescriptorError> {
    loop {
        if shared.stop.load(Ordering::Acquire) {
            return Ok(StopReason::Requested);
        }

        shared.set_phase(Phase::Waiting);
        let next = tokio::select! {
            _ = shared.wake.notified() => {
                shared.status.send_modify(|status| status.wakeups += 1);
                trace!(label = %shared.label, "woken");
                continue;
            }
            next = timeout(poll_interval, rd_stream.next()) => next,
        };

        let line = match next {
            Err(_elapsed) => continue,
            Ok(None) => return Ok(StopReason::PeerClosed),
            Ok(Some(Ok(line))) => line,
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                let err = ProtocolParseError::TooLong(MAX_RECORD_LEN);
                warn!(label = %shared.label, "dropping inbound record: {err}");
                continue;
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => return Err(DescriptorError::Read(e)),
        };

        let record = match CommandRecord::decode(&line) {
            Ok(record) => record,
            Err(err) => {
                warn!(label = %shared.label, "dropping malformed record: {err}");
                continue;
            }
        };

        shared.set_phase(Phase::Dispatching);
        let route = Route::of(&record);
        trace!(label = %shared.label, ?route, id = %record.id, "dispatching");
        match handlers.map.get_mut(&route) {
            Some(handler) => handler(record),
            None => warn!(label = %shared.label, ?route, "no handler, dropping record"),
        }

        if route == Route::Command(CommandKind::Shutdown) {
            return Ok(StopReason::Shutdown);
        }
    }
}

async fn handle_outbound(
    shared: &Shared,
    mut wr_stream: WrStream,
    mut rx: mpsc::UnboundedReceiver<CommandRecord>,
) -> Result<(), DescriptorError> {
    let mut draining = false;
    loop {
        let record = if draining {
            rx.recv().await
        } else {
            tokio::select! {
                record = rx.recv() => record,
                _ = shared.drain.notified() => {
                    // Refuse new records, then flush what is queued.
                    draining = true;
                    rx.close();
                    continue;
                }
            }
        };
        let Some(record) = record else {
            return Ok(());
        };
        if let Err(e) = wr_stream.send(record.encode()).await {
            shared.request_stop();
            return Err(DescriptorError::Write(codec_to_io(e)));
        }
    }
}

fn codec_to_io(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => io::Error::other("record too long"),
    }
}
