//! Error types.
//!
//! Failures are split along the boundary that matters to the scheduler:
//!
//! | Type | Raised by | Effect |
//! |------|-----------|--------|
//! | [`HandlerError`] | handler code | fiber terminated, logged |
//! | [`Violation`] | a misbehaving handler | fiber terminated, logged in full |
//! | [`Failure`] | the fiber, summarising either of the above or a panic | journal entry |
//! | [`RuntimeError`] | scheduler construction or the tick loop | process exits with status 1 |

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::wait::WaitState;

/// Result returned by handler futures.
pub type HandlerResult = Result<(), HandlerError>;

/// An error a handler returns to end its connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The peer sent something the handler refuses to process.
    #[error("{0}")]
    Invalid(String),

    /// Connection-level I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A cancellation injected at the suspension point, usually a timeout.
    #[error("{0}")]
    Cancelled(String),

    /// Anything else. Reported with full detail.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        HandlerError::Invalid(message.into())
    }

    /// Soft errors are expected network conditions and are logged concisely.
    pub fn is_soft(&self) -> bool {
        !matches!(self, HandlerError::Other(_))
    }
}

/// A handler broke the one-wait-state-per-resume contract.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Violation {
    #[error("handler suspended without yielding a wait state")]
    Unannounced,

    #[error("handler yielded {first} and {second} in a single resume")]
    Overlapping { first: WaitState, second: WaitState },
}

/// Why a fiber stopped before its handler completed.
#[derive(Debug, Error)]
pub enum Failure {
    #[error(transparent)]
    Error(#[from] HandlerError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] Violation),

    #[error("handler panicked: {0}")]
    Panic(String),
}

impl Failure {
    pub fn is_soft(&self) -> bool {
        matches!(self, Failure::Error(err) if err.is_soft())
    }

    /// Metric label for this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Failure::Error(err) if err.is_soft() => "soft",
            Failure::Error(_) | Failure::Panic(_) => "unexpected",
            Failure::Protocol(_) => "protocol",
        }
    }
}

/// Failures that take the whole scheduler down.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to create socket: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to register with the poller: {0}")]
    Register(#[source] io::Error),

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("failed to start metrics exporter: {0}")]
    Metrics(String),
}

/// Errors raised while detaching into the background.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to fork process: {0}")]
    Fork(#[source] io::Error),

    #[error("failed to detach: {0}")]
    Detach(#[source] io::Error),
}
