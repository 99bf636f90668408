//! Process bootstrap: logging, metrics, daemonisation and the main loop.
//!
//! [`launch`] is what `#[strand::main]` expands to. It owns every decision
//! about process exit status: 0 after an interrupt or a successful detach, 1
//! on any startup or loop failure.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Options;
use crate::daemon::{self, Detached};
use crate::error::RuntimeError;
use crate::handler::HandlerFactory;
use crate::journal::Console;
use crate::reactor::Scheduler;
use crate::task::panic_message;

const NAME: &str = "strand";

/// Installs the global `tracing` subscriber. Reads its filter from
/// `STRAND_LOG`, defaulting to `info`. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("STRAND_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

/// Serves Prometheus metrics on `127.0.0.1:port`. Starts a helper thread.
pub fn install_metrics(port: u16) -> Result<(), RuntimeError> {
    PrometheusBuilder::new()
        .with_http_listener(([127, 0, 0, 1], port))
        .install()
        .map_err(|e| RuntimeError::Metrics(e.to_string()))?;
    info!("metrics enabled at http://127.0.0.1:{port}/metrics");
    Ok(())
}

/// Runs a server until it is interrupted.
pub fn launch<F: HandlerFactory>(options: Options, factory: F) -> ExitCode {
    init_tracing();

    let addr = options.addr();
    let mut scheduler = match Scheduler::bind(addr, factory, options.settings()) {
        Ok(scheduler) => scheduler,
        Err(err) => return fatal(&err),
    };

    // forking must happen before the exporter starts its thread
    if let Some(log) = &options.log {
        match daemon::detach(log) {
            Ok(Detached::Parent(status)) => return ExitCode::from(status),
            Ok(Detached::Daemon) => {}
            Err(err) => return fatal(&err.into()),
        }
    }
    if let Some(port) = options.metrics {
        if let Err(err) = install_metrics(port) {
            return fatal(&err);
        }
    }
    if let Err(err) = scheduler.handle_signals() {
        return fatal(&err);
    }

    scheduler
        .console()
        .line(format_args!("  ....   {NAME} started"));
    info!(%addr, mode = ?options.mode(), "listening");
    drive(scheduler)
}

/// Runs the loop to its end and reports how it ended. A panic escaping the
/// loop is a crash like any other loop failure.
fn drive<F: HandlerFactory>(mut scheduler: Scheduler<F>) -> ExitCode {
    let console = scheduler.console().clone();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| scheduler.run()));
    // flush whatever the remaining fibers buffered before the closing banner
    drop(scheduler);

    let detail = match outcome {
        Ok(Ok(())) => {
            console.line(format_args!("  ....   {NAME} terminated"));
            return ExitCode::SUCCESS;
        }
        Ok(Err(err)) => err.to_string(),
        Err(payload) => format!("panic: {}", panic_message(payload)),
    };
    console.line(format_args!("  ....   {NAME} crashed"));
    console.line(&detail);
    error!(error = %detail, "scheduler stopped");
    ExitCode::FAILURE
}

fn fatal(err: &RuntimeError) -> ExitCode {
    Console::stdout().line(format_args!("error: {err}"));
    error!(error = %err, "startup failed");
    ExitCode::FAILURE
}
