//! Runtime configuration
//!
//! [`Cli`] is what the server binary parses (flags or `TURNSTILE_*`
//! environment variables); [`ServerConfig`] is the validated form the
//! service runs on.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::core::MIN_JOURNAL_CAPACITY;
use crate::network::SessionConfig;
use crate::protocol::{Framing, DEFAULT_TERMINATOR};
use crate::worker::WorkerMode;

pub const DEFAULT_PORT: u16 = 2015;
pub const DEFAULT_MAX_WORKERS: usize = 3;
pub const DEFAULT_LOG_CAPACITY: usize = 128;
pub const DEFAULT_SEMAPHORE_NAME: &str = "/turnstile_connections";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max workers must be at least 1")]
    ZeroWorkers,
    #[error("log buffer capacity must be at least 1")]
    ZeroLogCapacity,
    #[error("terminator token must not be empty")]
    EmptyTerminator,
    #[error("terminator token must not contain line breaks")]
    TerminatorLineBreak,
    #[error("max frame ({max_frame}) is shorter than the terminator line ({needed} bytes)")]
    FrameTooSmall { max_frame: usize, needed: usize },
    #[error("invalid semaphore name {0:?}: must start with '/' and contain no other '/'")]
    InvalidSemaphoreName(String),
    #[error("journal size {size} is below the minimum of {min} bytes")]
    JournalTooSmall { size: usize, min: usize },
    #[error("invalid listen address {0:?}")]
    InvalidHost(String),
    #[error("process workers need Linux (POSIX timed semaphore waits)")]
    ProcessModeUnsupported,
}

/// Where durable log records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SinkKind {
    /// Plain file, opened in append mode.
    #[default]
    File,
    /// Fixed-size memory-mapped journal.
    Journal,
    /// No durable log.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub sink: SinkKind,
    pub path: PathBuf,
    pub capacity: usize,
    pub journal_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::File,
            path: PathBuf::from("turnstile.log"),
            capacity: DEFAULT_LOG_CAPACITY,
            journal_size: 1024 * 1024,
        }
    }
}

/// Validated service configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_workers: usize,
    pub mode: WorkerMode,
    pub session: SessionConfig,
    pub log: LogConfig,
    pub semaphore_name: String,
    /// How long teardown waits for in-flight workers.
    pub grace: Duration,
    /// Load report period; `None` disables the monitor.
    pub monitor_interval: Option<Duration>,
    /// Dispatcher maintenance tick (reaping, stop checks).
    pub tick: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_workers: DEFAULT_MAX_WORKERS,
            mode: WorkerMode::Thread,
            session: SessionConfig::default(),
            log: LogConfig::default(),
            semaphore_name: DEFAULT_SEMAPHORE_NAME.to_string(),
            grace: Duration::from_secs(5),
            monitor_interval: None,
            tick: Duration::from_millis(100),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.log.capacity == 0 {
            return Err(ConfigError::ZeroLogCapacity);
        }

        let token = &self.session.terminator;
        if token.is_empty() {
            return Err(ConfigError::EmptyTerminator);
        }
        if token.contains(['\n', '\r']) {
            return Err(ConfigError::TerminatorLineBreak);
        }
        // Room for the token plus "\r\n" in line mode.
        let needed = match self.session.framing {
            Framing::Line => token.len() + 2,
            Framing::Raw => token.len(),
        };
        if self.session.max_frame < needed {
            return Err(ConfigError::FrameTooSmall {
                max_frame: self.session.max_frame,
                needed,
            });
        }

        if self.mode == WorkerMode::Process {
            if !cfg!(target_os = "linux") {
                return Err(ConfigError::ProcessModeUnsupported);
            }
            validate_semaphore_name(&self.semaphore_name)?;
        }

        if self.log.sink == SinkKind::Journal && self.log.journal_size < MIN_JOURNAL_CAPACITY {
            return Err(ConfigError::JournalTooSmall {
                size: self.log.journal_size,
                min: MIN_JOURNAL_CAPACITY,
            });
        }
        Ok(())
    }
}

fn validate_semaphore_name(name: &str) -> Result<(), ConfigError> {
    let valid = name.len() > 1 && name.starts_with('/') && !name[1..].contains('/');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidSemaphoreName(name.to_string()))
    }
}

/// Command line of the `turnstile` server.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "turnstile",
    version,
    about = "Echo server admitting at most N concurrent workers, with an asynchronous event log"
)]
pub struct Cli {
    /// Address to listen on.
    #[arg(long, env = "TURNSTILE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// TCP port to listen on.
    #[arg(short, long, env = "TURNSTILE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Maximum number of concurrent workers (N).
    #[arg(short = 'n', long, env = "TURNSTILE_MAX_WORKERS", default_value_t = DEFAULT_MAX_WORKERS)]
    pub max_workers: usize,

    /// Run each session on a thread or in a forked process.
    #[arg(long, env = "TURNSTILE_MODE", default_value_t = WorkerMode::Thread)]
    pub mode: WorkerMode,

    /// Token that ends a session.
    #[arg(long, env = "TURNSTILE_TERMINATOR", default_value = DEFAULT_TERMINATOR)]
    pub terminator: String,

    /// Message framing: `line` or `raw` (one message per read).
    #[arg(long, env = "TURNSTILE_FRAMING", default_value_t = Framing::Line)]
    pub framing: Framing,

    /// Longest accepted message, in bytes.
    #[arg(long, env = "TURNSTILE_MAX_FRAME", default_value_t = 1024)]
    pub max_frame: usize,

    /// Log one record per echoed message.
    #[arg(long, env = "TURNSTILE_LOG_MESSAGES", default_value_t = false)]
    pub log_messages: bool,

    /// Durable log sink.
    #[arg(long, env = "TURNSTILE_LOG_SINK", value_enum, default_value_t = SinkKind::File)]
    pub log_sink: SinkKind,

    /// Path of the log file or journal.
    #[arg(long, env = "TURNSTILE_LOG_FILE", default_value = "turnstile.log")]
    pub log_file: PathBuf,

    /// Capacity of the log buffer, in records (C).
    #[arg(long, env = "TURNSTILE_LOG_CAPACITY", default_value_t = DEFAULT_LOG_CAPACITY)]
    pub log_capacity: usize,

    /// Size of the memory-mapped journal, in bytes.
    #[arg(long, env = "TURNSTILE_JOURNAL_SIZE", default_value_t = 1024 * 1024)]
    pub journal_size: usize,

    /// Name of the POSIX semaphore used in process mode.
    #[arg(long, env = "TURNSTILE_SEMAPHORE", default_value = DEFAULT_SEMAPHORE_NAME)]
    pub semaphore_name: String,

    /// Seconds to wait for in-flight sessions on shutdown.
    #[arg(long, env = "TURNSTILE_GRACE_SECS", default_value_t = 5)]
    pub grace_secs: u64,

    /// Report admission load every this many milliseconds (0 = off).
    #[arg(long, env = "TURNSTILE_MONITOR_MS", default_value_t = 0)]
    pub monitor_interval_ms: u64,

    /// Debug-level diagnostics.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let ip: IpAddr = cli
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(cli.host.clone()))?;

        let config = ServerConfig {
            bind_addr: SocketAddr::new(ip, cli.port),
            max_workers: cli.max_workers,
            mode: cli.mode,
            session: SessionConfig {
                terminator: cli.terminator,
                framing: cli.framing,
                max_frame: cli.max_frame,
                log_messages: cli.log_messages,
            },
            log: LogConfig {
                sink: cli.log_sink,
                path: cli.log_file,
                capacity: cli.log_capacity,
                journal_size: cli.journal_size,
            },
            semaphore_name: cli.semaphore_name,
            grace: Duration::from_secs(cli.grace_secs),
            monitor_interval: (cli.monitor_interval_ms > 0)
                .then(|| Duration::from_millis(cli.monitor_interval_ms)),
            ..ServerConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}
