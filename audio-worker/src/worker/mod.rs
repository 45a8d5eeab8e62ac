//! The worker side. Runs in the re-executed child process.

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context as _, Result};
use tokio::{
    sync::mpsc,
    time::{error::Elapsed, timeout},
};
use tokio_stream::StreamExt as _;
use tracing::{debug, error, info, warn};

use crate::{
    channel::{self, ChildEnds, RdStream},
    config::{self, DEFAULT_POLL_INTERVAL},
    dispatcher::{self, Handlers, Route},
    fifo,
    protocol::{CommandKind, CommandRecord},
};

pub mod pipeline;

use pipeline::{Control, Outcome, Pipeline, Settings};

/// Reported when the audio FIFO cannot be opened.
pub const STATUS_FIFO_UNAVAILABLE: i32 = 2;
/// Reported when the media engine cannot be started.
pub const STATUS_ENGINE_UNAVAILABLE: i32 = 3;
/// Exit status after the pipeline failed mid-stream.
pub const STATUS_PIPELINE_FAILED: i32 = 4;

/// The entrypoint for the worker. Returns the exit status of the process.
///
/// `ends` are the worker's ends of the control channel.
pub async fn run(ends: ChildEnds) -> Result<i32> {
    // We expect this process to be killed on a stall, so we don't want to leave core dumps behind.
    #[cfg(target_os = "linux")]
    nix::sys::prctl::set_dumpable(false)?;

    let mut rd_stream = channel::reader(ends.read)?;
    let wr_stream = channel::writer(ends.write)?;
    let init = recv_init(&mut rd_stream).await?;

    crate::logging::init_worker(&init.id, init.debug);
    info!(file = %init.file_path, guild = %init.guild_id, "worker started");

    let fifo_path = std::env::var_os(config::FIFO_ENV)
        .map(PathBuf::from)
        .with_context(|| format!("{} is not set", config::FIFO_ENV))?;
    let engine = std::env::var_os(config::ENGINE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(config::locate_engine);

    let id = init.id.clone();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let handlers = handlers(control_tx);
    let (dispatcher, dispatcher_task) = dispatcher::run(
        format!("worker:{id}"),
        rd_stream,
        wr_stream,
        handlers,
        DEFAULT_POLL_INTERVAL,
    );
    let dispatcher_task = tokio::spawn(dispatcher_task);

    let pipeline = match start_pipeline(engine, &fifo_path, &init) {
        Ok(pipeline) => pipeline,
        Err(status) => {
            dispatcher.send(CommandRecord::ready(&id, status))?;
            dispatcher.stop();
            let _ = dispatcher_task.await;
            return Ok(status);
        }
    };
    dispatcher.send(CommandRecord::ready(&id, 0))?;
    debug!("reported ready");

    let status = match pipeline.run(control_rx).await {
        Ok(Outcome::Finished(code)) => {
            info!(code, "end of input");
            // Let the parent know we are done on our own.
            dispatcher.send(CommandRecord::shutdown(&id))?;
            code
        }
        Ok(Outcome::Stopped) => {
            info!("stopped");
            0
        }
        Err(e) => {
            error!("pipeline failed: {e}");
            STATUS_PIPELINE_FAILED
        }
    };

    dispatcher.stop();
    match dispatcher_task.await? {
        Ok(reason) => debug!(?reason, "dispatcher done"),
        Err(e) => warn!("dispatcher failed: {e}"),
    }
    Ok(status)
}

/// Receives the create record, which the parent sends first.
///
/// # Errors
///
/// Returns an error if the record is not a create record or if it is not received within a
/// certain time limit.
async fn recv_init(rd_stream: &mut RdStream) -> Result<CommandRecord> {
    const DEADLINE: Duration = Duration::from_secs(5);
    let line = match timeout(DEADLINE, rd_stream.next()).await {
        Ok(Some(line)) => line?,
        Ok(None) => bail!("Control channel closed before the create record"),
        Err(Elapsed { .. }) => bail!("Timed out waiting for the create record"),
    };
    let record = CommandRecord::decode(&line)?;
    if record.command != Some(CommandKind::CreateProcessor) {
        bail!("Expected a create record, got {:?}", record.command);
    }
    if record.id.is_empty() {
        bail!("Create record without an id");
    }
    Ok(record)
}

fn handlers(control_tx: mpsc::UnboundedSender<Control>) -> Handlers {
    // The pipeline sees the queue close once the dispatcher and with it these handlers are gone.
    let stop_tx = control_tx.clone();
    Handlers::new()
        .on(Route::Command(CommandKind::Shutdown), move |_| {
            let _ = stop_tx.send(Control::Stop);
        })
        .on(Route::Update, move |record| {
            for control in pipeline::controls(&record) {
                let _ = control_tx.send(control);
            }
        })
        .on(Route::Command(CommandKind::CreateProcessor), |record| {
            warn!(file = %record.file_path, "processor already created, ignoring");
        })
}

fn start_pipeline(
    engine: PathBuf,
    fifo_path: &std::path::Path,
    init: &CommandRecord,
) -> Result<Pipeline, i32> {
    let out = fifo::open_writer(fifo_path).map_err(|e| {
        error!(path = %fifo_path.display(), "cannot open audio fifo: {e}");
        STATUS_FIFO_UNAVAILABLE
    })?;
    let settings = Settings::from_record(engine, init);
    Pipeline::start(settings, out).map_err(|e| {
        error!("cannot start media engine: {e}");
        STATUS_ENGINE_UNAVAILABLE
    })
}
