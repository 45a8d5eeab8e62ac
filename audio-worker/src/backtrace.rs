//! Post-mortem reports for workers that never came up.
//!
//! A worker that does not report readiness is usually stuck inside its media engine or blocked on
//! the FIFO. Before it is torn down, a debugger is attached and a report with the worker's
//! registry state and every thread's stack is written next to its FIFO.

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{bail, Context as _};
use tokio::{fs, process::Command};
use which::which;

use crate::registry::WorkerState;

/// A debugger that can dump the stacks of a live process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Debugger {
    Gdb(PathBuf),
    Lldb(PathBuf),
}

impl Debugger {
    /// Finds a debugger in `PATH`, preferring gdb.
    pub fn locate() -> Option<Self> {
        which("gdb")
            .map(Debugger::Gdb)
            .or_else(|_| which("lldb").map(Debugger::Lldb))
            .ok()
    }

    fn program(&self) -> &Path {
        match self {
            Debugger::Gdb(path) | Debugger::Lldb(path) => path,
        }
    }

    /// Arguments that attach to `pid`, print all stacks and detach without killing it.
    fn args(&self, pid: u32) -> Vec<String> {
        let (attach, run, commands) = match self {
            Debugger::Gdb(_) => (
                vec!["-p".to_string(), pid.to_string(), "-batch".to_string()],
                "-ex",
                ["thread apply all bt", "detach", "quit"],
            ),
            Debugger::Lldb(_) => (
                vec!["-p".to_string(), pid.to_string()],
                "-o",
                ["thread backtrace all", "detach", "quit"],
            ),
        };
        let mut args = attach;
        for command in commands {
            args.push(run.to_string());
            args.push(command.to_string());
        }
        args
    }
}

/// Where the report of the worker with this state is written.
pub fn report_path(state: &WorkerState) -> PathBuf {
    state.audio_stream_fifo_path.with_extension("backtrace")
}

/// Attaches `debugger` to the worker and writes the report. Returns the report's path.
pub async fn collect(state: &WorkerState, debugger: &Debugger) -> anyhow::Result<PathBuf> {
    let Some(pid) = state.pid else {
        bail!("worker {} has no process", state.id);
    };

    let output = Command::new(debugger.program())
        .args(debugger.args(pid))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("could not run {}", debugger.program().display()))?;
    if !output.status.success() {
        bail!(
            "{} exited with {} while attached to worker {}: {}",
            debugger.program().display(),
            output.status,
            state.id,
            String::from_utf8_lossy(&output.stderr).trim(),
        );
    }

    let mut report = header(state, debugger);
    report.push_str(&String::from_utf8_lossy(&output.stdout));
    let path = report_path(state);
    fs::write(&path, report)
        .await
        .with_context(|| format!("could not write {}", path.display()))?;
    Ok(path)
}

fn header(state: &WorkerState, debugger: &Debugger) -> String {
    let mut header = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(header, "worker: {}", state.id);
    if !state.guild_id.is_empty() {
        let _ = writeln!(header, "guild: {}", state.guild_id);
    }
    if let Some(pid) = state.pid {
        let _ = writeln!(header, "pid: {pid}");
    }
    let _ = writeln!(header, "phase: {:?}", state.phase);
    match state.ready {
        Some(status) => {
            let _ = writeln!(header, "ready: {status}");
        }
        None => header.push_str("ready: never reported\n"),
    }
    let _ = writeln!(header, "fifo: {}", state.audio_stream_fifo_path.display());
    let _ = writeln!(header, "debugger: {}", debugger.program().display());
    header.push('\n');
    header
}
