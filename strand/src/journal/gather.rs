use std::time::Instant;

use super::{Console, Journal, ctime};

/// Buffers everything a fiber writes and flushes it in one piece on close.
///
/// Each line starts with the seconds elapsed since the fiber was created, so
/// the buffer still shows the connection's timing once it lands in the log.
pub struct GatherJournal {
    console: Console,
    chunks: Vec<String>,
    newline: bool,
    start: Instant,
    closed: bool,
}

impl GatherJournal {
    pub fn new(console: Console) -> Self {
        Self {
            console,
            chunks: vec![format!("[ 0.00 ] {}\n", ctime())],
            newline: true,
            start: Instant::now(),
            closed: false,
        }
    }
}

impl Journal for GatherJournal {
    fn write(&mut self, text: &str) {
        for line in text.split_inclusive('\n') {
            if self.newline {
                let elapsed = self.start.elapsed().as_secs_f64();
                self.chunks.push(format!("{elapsed:6.2}   "));
            }
            self.chunks.push(line.to_owned());
            self.newline = line.ends_with('\n');
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for chunk in self.chunks.drain(..) {
            self.console.write_str(&chunk);
        }
        if !self.newline {
            self.console.write_str("\n");
        }
        self.console.flush();
    }
}
