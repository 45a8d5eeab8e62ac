//! The control channel. A pair of unidirectional pipes between the parent and one worker, carrying
//! newline-framed [`CommandRecord`](crate::protocol::CommandRecord)s.
//!
//! Both pipes are created with close-on-exec set on every end. The ends destined for the worker
//! are moved to fixed descriptors by [`crate::spawn`] right before exec, so nothing else leaks into
//! the worker.

use std::{io, os::fd::OwnedFd};

use nix::{fcntl::OFlag, unistd::pipe2};
use tokio::net::unix::pipe;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// The maximum length of a single serialized record.
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// The type definition of a stream which is built:
///
/// - pipe (read end).
/// - newline codec, bounded by [`MAX_RECORD_LEN`].
pub type RdStream = FramedRead<pipe::Receiver, LinesCodec>;

/// The type definition of a sink which is built:
///
/// - pipe (write end).
/// - newline codec.
pub type WrStream = FramedWrite<pipe::Sender, LinesCodec>;

/// The ends that stay in the parent.
#[derive(Debug)]
pub struct ParentEnds {
    /// Receives records from the worker.
    pub read: OwnedFd,
    /// Sends records to the worker.
    pub write: OwnedFd,
}

/// The ends that are handed to the worker.
#[derive(Debug)]
pub struct ChildEnds {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

#[derive(Debug)]
pub struct ControlPipes {
    pub parent: ParentEnds,
    pub child: ChildEnds,
}

impl ControlPipes {
    /// Allocates both pipes. On failure every descriptor created so far is closed.
    pub fn new() -> nix::Result<Self> {
        // worker -> parent
        let (parent_read, child_write) = pipe2(OFlag::O_CLOEXEC)?;
        // parent -> worker
        let (child_read, parent_write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self {
            parent: ParentEnds {
                read: parent_read,
                write: parent_write,
            },
            child: ChildEnds {
                read: child_read,
                write: child_write,
            },
        })
    }
}

/// Wraps the read end of a pipe into a record stream. Must be called within a tokio runtime.
pub fn reader(fd: OwnedFd) -> io::Result<RdStream> {
    let rx = pipe::Receiver::from_owned_fd(fd)?;
    Ok(FramedRead::new(
        rx,
        LinesCodec::new_with_max_length(MAX_RECORD_LEN),
    ))
}

/// Wraps the write end of a pipe into a record sink. Must be called within a tokio runtime.
pub fn writer(fd: OwnedFd) -> io::Result<WrStream> {
    let tx = pipe::Sender::from_owned_fd(fd)?;
    Ok(FramedWrite::new(tx, LinesCodec::new()))
}
