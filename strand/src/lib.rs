//! A single-threaded cooperative connection server.
//!
//! Every accepted connection is served by a handler: an `async` function
//! that receives the [`Connection`] and a [`FiberCx`]. A handler never
//! blocks. Whenever it has to wait for the socket or the clock it yields one
//! [`WaitState`], and the [`Scheduler`] resumes it once that state is ready
//! or has expired. One thread drives every connection.
//!
//! - [`wait`]: the wait-state protocol between handlers and the scheduler
//! - [`context`]: the capability each handler runs with
//! - [`fiber`]: drives one handler and contains its failures
//! - [`journal`]: per-connection output policies
//! - [`reactor`]: the tick loop
//! - [`runtime`]: process bootstrap
//!
//! ```ignore
//! #[strand::main]
//! async fn main(mut conn: Connection, cx: FiberCx) -> HandlerResult {
//!     let mut buf = [0; 1024];
//!     let n = conn.read(&mut buf).await?;
//!     cx.line(format_args!("{} sent {n} bytes", conn.peer_addr()));
//!     conn.write_all(&buf[..n]).await
//! }
//! ```

pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod fiber;
pub mod handler;
pub mod journal;
pub mod net;
pub mod reactor;
pub mod runtime;
mod task;
pub mod wait;
mod waker;

pub use config::Options;
pub use context::{FiberCx, Suspend};
pub use error::{Failure, HandlerError, HandlerResult, RuntimeError};
pub use fiber::{Fiber, FiberId};
pub use handler::{FnFactory, HandlerFactory, factory};
pub use journal::{Console, Mode};
pub use net::Connection;
pub use reactor::{Scheduler, Settings, Tick};
pub use runtime::launch;
pub use task::HandlerFuture;
pub use wait::WaitState;

pub use strand_macros::main;
