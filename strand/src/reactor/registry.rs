use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

use mio::unix::SourceFd;
use mio::{Registry, Token};

use super::interest::Interest;
use crate::wait::Readiness;

/// Descriptors currently registered with the poller, and for what.
///
/// mio registrations are edge-triggered, so a descriptor whose fiber was
/// stepped is re-armed even when its interest did not change.
#[derive(Debug, Default)]
pub(crate) struct Armed {
    table: HashMap<RawFd, Readiness>,
}

impl Armed {
    /// Brings the poller's registrations in line with this tick's interest.
    pub(crate) fn sync(&mut self, registry: &Registry, interest: &Interest) {
        self.table.retain(|&fd, _| {
            if interest.lookup(fd).is_some() {
                return true;
            }
            // the handler may already have closed the socket
            if let Err(err) = registry.deregister(&mut SourceFd(&fd)) {
                if !is_stale(&err) {
                    tracing::warn!(fd, error = %err, "deregister failed");
                }
            }
            false
        });

        for (fd, readiness) in interest.wanted() {
            let armed = match self.table.get(&fd) {
                Some(&current) if current == readiness && !interest.wants_rearm(fd) => continue,
                Some(_) => rearm(registry, fd, readiness),
                None => arm(registry, fd, readiness),
            };
            match armed {
                Ok(()) => {
                    self.table.insert(fd, readiness);
                }
                Err(err) => {
                    tracing::warn!(fd, error = %err, "failed to register descriptor");
                    self.table.remove(&fd);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, fd: RawFd) -> Option<Readiness> {
        self.table.get(&fd).copied()
    }
}

fn token(fd: RawFd) -> Token {
    Token(fd as usize)
}

fn mio_interest(readiness: Readiness) -> mio::Interest {
    match readiness {
        Readiness::Readable => mio::Interest::READABLE,
        Readiness::Writable => mio::Interest::WRITABLE,
    }
}

fn arm(registry: &Registry, fd: RawFd, readiness: Readiness) -> io::Result<()> {
    let source = &mut SourceFd(&fd);
    match registry.register(source, token(fd), mio_interest(readiness)) {
        // a recycled descriptor number that was never deregistered
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            registry.reregister(source, token(fd), mio_interest(readiness))
        }
        other => other,
    }
}

fn rearm(registry: &Registry, fd: RawFd, readiness: Readiness) -> io::Result<()> {
    let source = &mut SourceFd(&fd);
    match registry.reregister(source, token(fd), mio_interest(readiness)) {
        // closed and reopened under the same number since the last tick
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            registry.register(source, token(fd), mio_interest(readiness))
        }
        other => other,
    }
}

fn is_stale(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(libc::EBADF)
}
