//! The parent part of the binary. Spawns one worker, streams its audio and forwards runtime
//! commands to it.

use std::{process::exit, sync::Arc};

use anyhow::{bail, Context as _, Result};
use audio_worker::{
    logging,
    registry::Registry,
    supervisor::{Supervisor, WorkerEvent, WorkerEventKind},
};
use clap::Parser;
use tokio::{
    io::AsyncWrite,
    signal::unix::{signal, SignalKind},
    sync::mpsc,
    task::{self, JoinHandle},
};
use tokio_stream::StreamExt as _;
use tokio_util::{
    codec::{FramedRead, LinesCodec},
    sync::CancellationToken,
};
use tracing::{error, info, warn};

use cli::{Cli, Commands, PlayParams};
use console::ConsoleCommand;

mod cli;
mod console;

/// The entrypoint for the parent part of the program.
pub async fn run() -> Result<()> {
    logging::init_parent();

    let ct = CancellationToken::new();
    let Commands::Play(params) = Cli::parse().command;

    let play_jh = task::spawn(play(ct.clone(), params));
    match join_interruptable(play_jh, ct).await {
        ExitReason::Finished => exit(0),
        ExitReason::Error(error) => {
            error!("{:#}", error);
            exit(1);
        }
        ExitReason::Panic(panic_box) => {
            let panic_string =
                audio_worker::panic::panic_to_string("Playback panicked", panic_box);
            error!("{}", panic_string);
            exit(2);
        }
        // 128 + SIGINT, as shells report it.
        ExitReason::Interrupted => exit(130),
    }
}

enum ExitReason {
    Finished,
    Error(anyhow::Error),
    Panic(Box<dyn std::any::Any + Send + 'static>),
    Interrupted,
}

/// Waits for playback to finish or for the user to interrupt it.
///
/// The first ^C cancels `ct`, which stops the worker gracefully. The second ^C aborts.
async fn join_interruptable(
    mut play_jh: JoinHandle<Result<()>>,
    ct: CancellationToken,
) -> ExitReason {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sigint) => sigint,
        Err(e) => return ExitReason::Error(e.into()),
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received ^C, stopping playback");
            ct.cancel();
        }
        res = &mut play_jh => return exit_reason(res),
    }

    tokio::select! {
        _ = sigint.recv() => {
            play_jh.abort();
            ExitReason::Interrupted
        }
        res = &mut play_jh => match exit_reason(res) {
            ExitReason::Finished => ExitReason::Interrupted,
            other => other,
        },
    }
}

fn exit_reason(res: Result<Result<()>, task::JoinError>) -> ExitReason {
    match res {
        Ok(Ok(())) => ExitReason::Finished,
        Ok(Err(e)) => ExitReason::Error(e),
        Err(join_err) => match join_err.try_into_panic() {
            Ok(panic_box) => ExitReason::Panic(panic_box),
            Err(join_err) => ExitReason::Error(join_err.into()),
        },
    }
}

/// Plays `params.file` until it ends, the user stops it or `ct` is cancelled.
async fn play(ct: CancellationToken, params: PlayParams) -> Result<()> {
    let config = params.config();
    let ready_timeout = config.ready_timeout;
    let (supervisor, events) = Supervisor::new(config, Arc::new(Registry::new()));

    let state = supervisor
        .spawn(params.record())
        .await
        .context("could not start playback")?;
    let id = state.id;

    let result = stream(&ct, &supervisor, &id, &params, ready_timeout, events).await;
    // A worker that is not done by now is not going to be.
    let cleanup = match result {
        Ok(()) => supervisor.reap(&id).await,
        Err(_) => supervisor.teardown(&id).await,
    };
    match cleanup {
        Ok(state) => info!(id, ready = ?state.ready, "worker reaped"),
        Err(e) => warn!(id, "failed to reap worker: {e}"),
    }
    result
}

async fn stream(
    ct: &CancellationToken,
    supervisor: &Supervisor,
    id: &str,
    params: &PlayParams,
    ready_timeout: std::time::Duration,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) -> Result<()> {
    match supervisor.wait_ready(id, ready_timeout).await {
        Ok(0) => info!(id, "worker ready"),
        Ok(status) => {
            bail!("worker failed to initialize: status {status}");
        }
        Err(e) => {
            if params.backtrace_on_timeout {
                match supervisor.collect_backtrace(id).await {
                    Ok(path) => info!("backtrace written to {}", path.display()),
                    Err(e) => warn!("failed to collect backtrace: {e}"),
                }
            }
            return Err(e).context("worker failed to initialize");
        }
    }

    let mut audio = supervisor.open_audio_stream(id)?;
    let mut output: Box<dyn AsyncWrite + Send + Unpin> = match params.output {
        Some(ref path) => Box::new(tokio::fs::File::create(path).await?),
        None => Box::new(tokio::io::stdout()),
    };
    let copy = task::spawn(async move { tokio::io::copy(&mut audio, &mut output).await });

    let mut stdin = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    let mut stdin_open = true;
    let mut stopping = false;
    loop {
        tokio::select! {
            _ = ct.cancelled(), if !stopping => {
                stopping = true;
                supervisor.shutdown(id)?;
            }
            line = stdin.next(), if stdin_open => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        warn!("ignoring console input: {e}");
                        continue;
                    }
                    None => {
                        stdin_open = false;
                        continue;
                    }
                };
                match ConsoleCommand::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Help)) => eprintln!("{}", console::HELP),
                    Ok(Some(ConsoleCommand::Stop)) if !stopping => {
                        stopping = true;
                        supervisor.shutdown(id)?;
                    }
                    Ok(Some(command)) => {
                        if let Some(update) = command.to_update(id) {
                            supervisor.send(id, update)?;
                        }
                    }
                    Err(e) => eprintln!("{e}; type `help` for the list of commands"),
                }
            }
            event = events.recv() => match event.map(|event| event.kind) {
                Some(WorkerEventKind::Ready(_)) => {}
                Some(WorkerEventKind::Finished) | None => break,
                Some(WorkerEventKind::Failed(reason)) => {
                    copy.abort();
                    bail!("playback stopped unexpectedly: {reason}");
                }
            },
        }
    }

    let copied = copy.await??;
    info!(id, bytes = copied, "playback finished");
    Ok(())
}
