use std::fmt;

use super::{Console, Journal, ctime, report};
use crate::error::Failure;

/// Short identifier printed in front of every line of a traced fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberTag(pub u16);

impl fmt::Display for FiberTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// Hands out tags in creation order. Wraps after 65536 fibers.
#[derive(Debug, Default)]
pub struct TagAllocator {
    next: u16,
}

impl TagAllocator {
    pub fn allocate(&mut self) -> FiberTag {
        let tag = FiberTag(self.next);
        self.next = self.next.wrapping_add(1);
        tag
    }
}

/// Writes through immediately, tagging each line with the fiber's id.
pub struct TraceJournal {
    console: Console,
    prefix: String,
    newline: bool,
}

impl TraceJournal {
    pub fn new(console: Console, tag: FiberTag) -> Self {
        console.line(format_args!("[ {tag} ] {}", ctime()));
        Self {
            console,
            prefix: format!("  {tag}   "),
            newline: true,
        }
    }
}

impl Journal for TraceJournal {
    fn write(&mut self, text: &str) {
        for line in text.split_inclusive('\n') {
            if self.newline {
                self.console.write_str(&self.prefix);
            }
            self.console.write_str(line);
            self.newline = line.ends_with('\n');
        }
        self.console.flush();
    }

    fn stepped(&mut self, fiber: &dyn fmt::Display) {
        self.write(&format!("Waiting at {fiber}\n"));
    }

    fn failed(&mut self, failure: &Failure, fiber: &str) {
        self.write(&report(failure, fiber));
    }

    fn close(&mut self) {
        if !self.newline {
            self.console.write_str("\n");
            self.newline = true;
        }
        self.console.flush();
    }
}
