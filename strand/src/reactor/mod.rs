//! The tick loop.
//!
//! One [`Scheduler`] owns the listening socket and every live fiber. Each
//! tick it expires overdue fibers, tells the poller which descriptors the
//! remaining ones wait on, blocks in a single poll call until the earliest
//! deadline, and resumes exactly the fibers that became ready.

mod interest;
mod registry;
mod scheduler;

pub use interest::tick_timeout;
pub use scheduler::{Scheduler, Settings, Tick};
