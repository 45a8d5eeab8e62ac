// A low-level module for spawning a worker process and figuring out if we are the parent or the
// worker using the same binary.
//
// The parent creates the control pipes and re-executes the program. Right before exec the worker's
// two pipe ends are moved to predefined file descriptors, [`CHILD_READ_FD`] and [`CHILD_WRITE_FD`].
// All other pipe ends are close-on-exec, so the worker never sees the parent's ends.
//
// For a process launched using the common binary, it can check if it is a worker by checking if
// both descriptors are valid FIFOs.
//
// The main goal of this module is to tuck away the low-level machinery like working with libc and
// nix into a single place.

use cfg_if::cfg_if;
use std::{
    ffi::OsString,
    io,
    os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd},
    path::PathBuf,
    process::Stdio,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::process::{Child, Command};
use tracing::trace;

use crate::channel::ChildEnds;

/// The descriptor the worker reads commands from.
///
/// We pick high numbers to avoid conflicts with other file descriptors.
pub const CHILD_READ_FD: RawFd = 1000;
/// The descriptor the worker writes status records to.
pub const CHILD_WRITE_FD: RawFd = 1001;

/// Checks for evidence that this process is a worker spawned by a parent.
///
/// Returns the worker's control ends if so, otherwise returns None.
pub fn am_spawned() -> Option<ChildEnds> {
    static CALLED: AtomicBool = AtomicBool::new(false);

    // Only take ownership of the fds if we haven't already
    if CALLED.swap(true, Ordering::SeqCst) {
        return None;
    }

    if !is_open_fifo(CHILD_READ_FD) || !is_open_fifo(CHILD_WRITE_FD) {
        return None;
    }

    // The ends must not leak into the media engine: an engine that outlives the worker would keep
    // the parent from seeing EOF.
    for fd in [CHILD_READ_FD, CHILD_WRITE_FD] {
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }

    // SAFETY:
    // - Both file descriptors are valid (checked above with fcntl) and are pipes.
    // - This code can only run once due to the CALLED atomic bool, ensuring we have exclusive
    //   ownership, passing it down into the OwnedFd instances.
    let (read, write) = unsafe {
        (
            OwnedFd::from_raw_fd(CHILD_READ_FD),
            OwnedFd::from_raw_fd(CHILD_WRITE_FD),
        )
    };
    Some(ChildEnds { read, write })
}

fn is_open_fifo(fd: RawFd) -> bool {
    let is_valid_fd = unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 };
    if !is_valid_fd {
        return false;
    }
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let ok = unsafe { libc::fstat(fd, &mut stat) == 0 };
    ok && (stat.st_mode & libc::S_IFMT) == libc::S_IFIFO
}

/// What to execute as the worker.
#[derive(Clone, Debug, Default)]
pub enum WorkerProgram {
    /// Re-execute the running binary.
    #[default]
    CurrentExe,
    /// Execute another binary that calls [`am_spawned`] on start.
    Path(PathBuf),
}

impl WorkerProgram {
    fn resolve(&self) -> io::Result<OsString> {
        match self {
            WorkerProgram::Path(path) => Ok(path.clone().into_os_string()),
            WorkerProgram::CurrentExe => {
                cfg_if! {
                    if #[cfg(target_os = "linux")] {
                        // Nothing beats the simplicity of /proc/self/exe on Linux.
                        Ok(OsString::from("/proc/self/exe"))
                    } else {
                        Ok(std::env::current_exe()?.into_os_string())
                    }
                }
            }
        }
    }
}

/// Spawns the worker process, handing it `ends`.
///
/// `ends` are consumed: after this returns the parent holds no worker-side descriptor, whether
/// the spawn succeeded or not.
pub fn spawn_worker(
    program: &WorkerProgram,
    envs: &[(&str, OsString)],
    ends: ChildEnds,
) -> io::Result<Child> {
    let read_fd = ends.read.as_raw_fd();
    let write_fd = ends.write.as_raw_fd();
    trace!(?read_fd, ?write_fd, "Spawning worker process");

    let mut cmd = Command::new(program.resolve()?);
    cmd.envs(envs.iter().map(|(k, v)| (k, v)))
        // The worker talks over its pipes only. Stdin stays with the parent's console.
        .stdin(Stdio::null());
    unsafe {
        cmd.pre_exec(move || {
            let mut write_fd = write_fd;
            // Moving the read end first would clobber the write end if it already sits there.
            if write_fd == CHILD_READ_FD {
                write_fd = libc::fcntl(write_fd, libc::F_DUPFD, CHILD_WRITE_FD + 1);
                if write_fd < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            move_fd(read_fd, CHILD_READ_FD)?;
            move_fd(write_fd, CHILD_WRITE_FD)?;
            Ok(())
        });
    }
    let child = cmd.spawn();
    // Close the worker's ends in the parent.
    drop(ends);
    let child = child?;

    trace!("spawned worker process, pid={:?}", child.id());
    Ok(child)
}

/// Places `fd` at `target` and makes it survive exec.
///
/// Only async-signal-safe calls: this runs between fork and exec.
fn move_fd(fd: RawFd, target: RawFd) -> io::Result<()> {
    if fd != target && unsafe { libc::dup2(fd, target) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // dup2 clears FD_CLOEXEC on the copy, but not when fd == target.
    if unsafe { libc::fcntl(target, libc::F_SETFD, 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ControlPipes;

    #[test]
    fn a_test_process_is_not_a_worker() {
        assert!(am_spawned().is_none());
        // Later calls never take the descriptors either.
        assert!(am_spawned().is_none());
    }

    #[test]
    fn moved_descriptor_survives_exec() {
        const TARGET: RawFd = 1900;
        let pipes = ControlPipes::new().unwrap();
        move_fd(pipes.child.read.as_raw_fd(), TARGET).unwrap();

        let flags = unsafe { libc::fcntl(TARGET, libc::F_GETFD) };
        assert_ne!(flags, -1);
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
        assert!(is_open_fifo(TARGET));

        // SAFETY: TARGET was created above and nothing else owns it.
        drop(unsafe { OwnedFd::from_raw_fd(TARGET) });
        assert!(!is_open_fifo(TARGET));
    }
}
