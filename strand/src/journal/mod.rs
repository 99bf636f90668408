//! Output policies for fibers.
//!
//! A handler never writes to the process output directly. Everything it
//! prints goes through its fiber's [`Journal`], which decides when the text
//! reaches the [`Console`]:
//!
//! - [`GatherJournal`] buffers a whole connection and flushes it once, at
//!   teardown, so connections never interleave in the log.
//! - [`TraceJournal`] tags every line with a short fiber id and flushes it
//!   immediately, and traces every state transition.

mod gather;
mod trace;

pub use gather::GatherJournal;
pub use trace::{FiberTag, TagAllocator, TraceJournal};

use std::cell::RefCell;
use std::error::Error as _;
use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::rc::Rc;

use chrono::Local;

use crate::error::{Failure, HandlerError};

/// How fibers report their output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Mode {
    /// Buffer each connection and flush it when the fiber is dropped.
    #[default]
    Buffering,
    /// Prefix every line with the fiber's tag and flush immediately.
    Tagging,
}

/// Output sink of a single fiber.
pub trait Journal {
    /// Appends handler or driver output.
    fn write(&mut self, text: &str);

    /// Called after every step that left the fiber suspended.
    /// `fiber` is rendered only by journals that trace steps.
    fn stepped(&mut self, _fiber: &dyn fmt::Display) {}

    /// Records why the fiber stopped.
    fn failed(&mut self, failure: &Failure, fiber: &str) {
        if failure.is_soft() {
            self.write(&format!("Error: {failure}\n"));
        } else {
            self.write(&report(failure, fiber));
        }
    }

    /// Called exactly once when the fiber is dropped.
    fn close(&mut self) {}
}

/// Builds the journal for a new fiber.
pub fn open(mode: Mode, console: &Console, tags: &mut TagAllocator) -> Box<dyn Journal> {
    match mode {
        Mode::Buffering => Box::new(GatherJournal::new(console.clone())),
        Mode::Tagging => Box::new(TraceJournal::new(console.clone(), tags.allocate())),
    }
}

/// Full diagnostic detail of a failure, including where the fiber stood.
pub(crate) fn report(failure: &Failure, fiber: &str) -> String {
    let mut out = format!("Traceback (fiber at {fiber}):\n");
    match failure {
        Failure::Error(HandlerError::Other(err)) => {
            let _ = writeln!(out, "  {err:?}");
        }
        failure => {
            let _ = writeln!(out, "  {failure}");
            let mut source = failure.source();
            while let Some(cause) = source {
                let _ = writeln!(out, "  caused by: {cause}");
                source = cause.source();
            }
        }
    }
    out
}

/// `ctime(3)`-style local timestamp.
pub(crate) fn ctime() -> String {
    Local::now().format("%a %b %e %H:%M:%S %Y").to_string()
}

/// Handle to the process-wide output stream.
///
/// Cloning shares the stream. Writes are best effort: a failed write to the
/// log is dropped rather than taking the server down.
#[derive(Clone)]
pub struct Console {
    out: Rc<RefCell<Box<dyn Write>>>,
}

impl Console {
    pub fn new(out: impl Write + 'static) -> Self {
        Self {
            out: Rc::new(RefCell::new(Box::new(out))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// A console writing into memory, and the handle to read it back.
    pub fn capture() -> (Self, Capture) {
        let capture = Capture::default();
        (Self::new(capture.clone()), capture)
    }

    pub fn write_str(&self, text: &str) {
        let _ = self.out.borrow_mut().write_all(text.as_bytes());
    }

    pub fn flush(&self) {
        let _ = self.out.borrow_mut().flush();
    }

    /// Writes one line and flushes.
    pub fn line(&self, text: impl fmt::Display) {
        self.write_str(&format!("{text}\n"));
        self.flush();
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}

/// In-memory console target.
#[derive(Debug, Clone, Default)]
pub struct Capture {
    buf: Rc<RefCell<Vec<u8>>>,
    flushes: Rc<RefCell<usize>>,
}

impl Capture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.borrow()).into_owned()
    }

    /// Number of times the console was flushed.
    pub fn flushes(&self) -> usize {
        *self.flushes.borrow()
    }
}

impl Write for Capture {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.borrow_mut().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        *self.flushes.borrow_mut() += 1;
        Ok(())
    }
}
