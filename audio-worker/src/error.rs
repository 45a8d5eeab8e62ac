//! Error types surfaced by the worker subsystem.
//!
//! Every channel and registry operation reports its outcome through one of these. The binary and
//! the worker runtime wrap them into `anyhow` at the outermost layer.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Failure to bring up a worker. Nothing is left behind except what the variant documents.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to allocate control pipes: {0}")]
    Pipe(#[source] nix::Error),

    #[error("failed to create audio fifo at {}: {source}", path.display())]
    Fifo {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// The process could not be created. The FIFO is still on disk.
    #[error("failed to start worker process: {0}")]
    Process(#[source] io::Error),

    #[error("failed to attach control channel: {0}")]
    Channel(#[source] io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A wire record that could not be decoded. Only the record itself is lost.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolParseError {
    #[error("escape character at end of input")]
    UnterminatedEscape,

    #[error("unknown escape sequence `\\{0}`")]
    InvalidEscape(char),

    #[error("field `{0}` has no key/value separator")]
    MissingSeparator(String),

    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("invalid value `{value}` for key `{key}`")]
    InvalidValue { key: &'static str, value: String },

    #[error("malformed effect chain: {0}")]
    MalformedChain(&'static str),

    #[error("record exceeds {0} bytes")]
    TooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("worker `{0}` is already registered")]
    DuplicateId(String),

    #[error("worker `{0}` is not registered")]
    NotFound(String),

    #[error("worker `{id}` did not become ready within {timeout:?}")]
    ReadyTimeout { id: String, timeout: Duration },
}

/// A read or write failed on an established channel. The worker is considered dead.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("control channel read failed: {0}")]
    Read(#[source] io::Error),

    #[error("control channel write failed: {0}")]
    Write(#[source] io::Error),

    #[error("control channel closed by peer")]
    Closed,
}

/// Umbrella error of the [`crate::supervisor::Supervisor`] facade.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("audio stream error: {0}")]
    Io(#[from] io::Error),
}
