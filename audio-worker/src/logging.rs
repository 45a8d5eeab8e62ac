use std::io::{self, IsTerminal as _};

use tracing::level_filters::LevelFilter;
use tracing::{span, Level};
use tracing_subscriber::{fmt, EnvFilter};

const ENV_NAME_COMMON: &str = "AUDIO_WORKER_ALL_LOG";
const ENV_NAME_WORKER: &str = "AUDIO_WORKER_CHILD_LOG";
const ENV_NAME_PARENT: &str = "AUDIO_WORKER_PARENT_LOG";

enum Kind {
    Worker,
    Parent,
}

fn istty() -> bool {
    io::stderr().is_terminal()
}

/// Creates env filter for the worker or the parent.
///
/// This function tries to read the most specific environment variable first, then falls back to
/// the common one ([`ENV_NAME_COMMON`]), then to `default_level`.
fn env_filter(kind: Kind, default_level: LevelFilter) -> EnvFilter {
    let specific_env_name = match kind {
        Kind::Worker => ENV_NAME_WORKER,
        Kind::Parent => ENV_NAME_PARENT,
    };

    return try_parse_env(specific_env_name, default_level).unwrap_or_else(|| {
        try_parse_env(ENV_NAME_COMMON, default_level).unwrap_or_else(|| {
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .parse_lossy("")
        })
    });

    fn try_parse_env(var_name: &str, default_level: LevelFilter) -> Option<EnvFilter> {
        let env = match std::env::var(var_name) {
            Ok(env) => env,
            Err(std::env::VarError::NotPresent) => return None,
            Err(std::env::VarError::NotUnicode(_)) => {
                eprintln!("Environment variable {} is not unicode, ignoring", var_name);
                return None;
            }
        };
        match EnvFilter::builder()
            .with_default_directive(default_level.into())
            .parse(&env)
        {
            Ok(filter) => Some(filter),
            Err(e) => {
                eprintln!("Invalid {}={:?}: {}", var_name, env, e);
                None
            }
        }
    }
}

fn install(kind: Kind, default_level: LevelFilter) {
    let format = fmt::format()
        .with_level(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_timer(fmt::time::SystemTime);
    // Stdout may be carrying audio, so everything goes to stderr.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter(kind, default_level))
        .with_writer(io::stderr)
        .with_ansi(istty())
        .event_format(format)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set the log subscriber: {}", e);
    }
}

pub fn init_parent() {
    install(Kind::Parent, LevelFilter::INFO);
}

/// Sets up logging of a worker process. `debug` comes from the worker's create record.
pub fn init_worker(worker_id: &str, debug: bool) {
    let default_level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    install(Kind::Worker, default_level);

    let pid = std::process::id();
    let span = span!(Level::INFO, "worker", worker_id, pid);
    // The span stays entered for the lifetime of the worker process.
    std::mem::forget(span.entered());
}
