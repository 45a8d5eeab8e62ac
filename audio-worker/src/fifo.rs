//! The bulk channel. Every worker writes its audio into a named FIFO whose path is derived from
//! the worker id, so the audio never shares a descriptor with control records.

use std::{
    io,
    path::{Path, PathBuf},
};

use nix::{errno::Errno, sys::stat::Mode, unistd};
use tokio::net::unix::pipe;

/// The access mode FIFOs are created with (before umask).
pub const DEFAULT_FIFO_MODE: u32 = 0o600;

/// Returns the FIFO path of the worker `id` inside `dir`.
///
/// Characters outside `[A-Za-z0-9._-]` are percent-encoded, so distinct ids never share a path.
pub fn fifo_path(dir: &Path, id: &str) -> PathBuf {
    let mut name = String::from("audio-worker-");
    for b in id.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => name.push(b as char),
            _ => name.push_str(&format!("%{:02x}", b)),
        }
    }
    name.push_str(".fifo");
    dir.join(name)
}

/// Creates the FIFO at `path`, unlinking whatever was there before.
pub fn create(path: &Path, mode: u32) -> nix::Result<()> {
    remove(path)?;
    unistd::mkfifo(path, Mode::from_bits_truncate(mode as _))
}

/// Unlinks the FIFO. A missing file is not an error.
pub fn remove(path: &Path) -> nix::Result<()> {
    match unistd::unlink(path) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Opens the consuming end. Does not wait for the worker to open its end.
pub fn open_reader(path: &Path) -> io::Result<pipe::Receiver> {
    pipe::OpenOptions::new().open_receiver(path)
}

/// Opens the producing end.
///
/// On Linux the FIFO is opened read-write, so opening succeeds before any consumer shows up and
/// the stream survives a consumer reopening it.
pub fn open_writer(path: &Path) -> io::Result<pipe::Sender> {
    let mut options = pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    options.read_write(true);
    options.open_sender(path)
}
