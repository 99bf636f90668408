//! Command-line and environment configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::journal::{Console, Mode};
use crate::reactor::Settings;

/// Options every strand server accepts.
#[derive(Debug, Clone, Parser)]
#[command(version, about = "Single-threaded cooperative connection server")]
pub struct Options {
    /// Port to listen on
    #[arg(short, long, env = "STRAND_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Address to bind
    #[arg(short, long, env = "STRAND_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// How connection output is written
    #[arg(long, value_enum, env = "STRAND_MODE", default_value_t = Mode::Buffering)]
    pub mode: Mode,

    /// Shorthand for `--mode tagging`
    #[arg(short, long)]
    pub debug: bool,

    /// Run in the background, appending all output to PATH
    #[arg(short, long, env = "STRAND_LOG_FILE", value_name = "PATH")]
    pub log: Option<PathBuf>,

    /// Seconds a connection may wait for readiness before it is timed out
    #[arg(long, env = "STRAND_IO_TIMEOUT", value_name = "SECS", default_value_t = 30)]
    pub io_timeout: u64,

    /// Serve Prometheus metrics on 127.0.0.1:PORT
    #[arg(long, env = "STRAND_METRICS_PORT", value_name = "PORT")]
    pub metrics: Option<u16>,
}

impl Options {
    /// Parses the process arguments; exits with usage on error.
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn mode(&self) -> Mode {
        if self.debug { Mode::Tagging } else { self.mode }
    }

    pub fn settings(&self) -> Settings {
        Settings {
            mode: self.mode(),
            io_timeout: Duration::from_secs(self.io_timeout),
            console: Console::stdout(),
        }
    }
}
