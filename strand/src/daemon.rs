//! Detaching from the controlling terminal.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::error::DaemonError;

/// Which process returned from [`detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// Not the daemon. The process should exit with this status.
    Parent(u8),
    /// The background process, with its standard streams redirected.
    Daemon,
}

enum Fork {
    Parent(libc::pid_t),
    Child,
}

/// Double-forks into the background.
///
/// The calling process waits for the intermediate child and reports its
/// status; the intermediate prints the daemon's pid and exits. The daemon
/// runs in `/` in a new session, with stdout and stderr written to `log`
/// and stdin read from `/dev/null`.
///
/// `log` is truncated, so each daemon starts with a fresh log.
///
/// Must be called before any thread is started.
pub fn detach(log: &Path) -> Result<Detached, DaemonError> {
    let log = open_log(log)?;
    let null = open(Path::new("/dev/null"), OpenOptions::new().read(true))?;
    let _ = io::stdout().flush();

    if let Fork::Parent(pid) = fork()? {
        return wait(pid).map(Detached::Parent);
    }

    std::env::set_current_dir("/").map_err(DaemonError::Detach)?;
    if unsafe { libc::setsid() } < 0 {
        return Err(DaemonError::Detach(io::Error::last_os_error()));
    }
    unsafe { libc::umask(0) };

    if let Fork::Parent(pid) = fork()? {
        println!("{pid}");
        let _ = io::stdout().flush();
        return Ok(Detached::Parent(0));
    }

    redirect(&log, libc::STDOUT_FILENO)?;
    redirect(&log, libc::STDERR_FILENO)?;
    redirect(&null, libc::STDIN_FILENO)?;
    Ok(Detached::Daemon)
}

fn open_log(path: &Path) -> Result<File, DaemonError> {
    open(path, OpenOptions::new().create(true).write(true).truncate(true))
}

fn open(path: &Path, options: &OpenOptions) -> Result<File, DaemonError> {
    options.open(path).map_err(|source| DaemonError::Open {
        path: path.to_owned(),
        source,
    })
}

fn fork() -> Result<Fork, DaemonError> {
    match unsafe { libc::fork() } {
        -1 => Err(DaemonError::Fork(io::Error::last_os_error())),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(pid)),
    }
}

fn wait(pid: libc::pid_t) -> Result<u8, DaemonError> {
    let mut status = 0;
    loop {
        if unsafe { libc::waitpid(pid, &mut status, 0) } >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(DaemonError::Fork(err));
        }
    }
    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status) as u8)
    } else {
        Ok(1)
    }
}

fn redirect(file: &File, target: libc::c_int) -> Result<(), DaemonError> {
    if unsafe { libc::dup2(file.as_raw_fd(), target) } < 0 {
        return Err(DaemonError::Detach(io::Error::last_os_error()));
    }
    Ok(())
}
