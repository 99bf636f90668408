//! How connections become handlers.

use std::future::Future;

use crate::context::FiberCx;
use crate::error::HandlerResult;
use crate::net::Connection;
use crate::task::HandlerFuture;

/// Builds one handler future per accepted connection.
pub trait HandlerFactory {
    fn build(&mut self, conn: Connection, cx: FiberCx) -> HandlerFuture;
}

/// A [`HandlerFactory`] backed by a closure or `async fn`.
#[derive(Debug, Clone)]
pub struct FnFactory<F>(F);

/// Wraps `f` as a handler factory.
///
/// ```ignore
/// async fn echo(mut conn: Connection, cx: FiberCx) -> HandlerResult { /* ... */ }
/// let scheduler = Scheduler::bind(addr, strand::factory(echo), Settings::default())?;
/// ```
pub fn factory<F, Fut>(f: F) -> FnFactory<F>
where
    F: FnMut(Connection, FiberCx) -> Fut,
    Fut: Future<Output = HandlerResult> + 'static,
{
    FnFactory(f)
}

impl<F, Fut> HandlerFactory for FnFactory<F>
where
    F: FnMut(Connection, FiberCx) -> Fut,
    Fut: Future<Output = HandlerResult> + 'static,
{
    fn build(&mut self, conn: Connection, cx: FiberCx) -> HandlerFuture {
        Box::pin((self.0)(conn, cx))
    }
}
