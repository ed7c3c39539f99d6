//! turnstile: an echo service that admits at most N concurrent workers
//!
//! - `core`: bounded buffer, admission control (in-process and named
//!   semaphore), memory-mapped journal
//! - `logging`: records from many producers, one writer thread
//! - `protocol` / `network`: framing, echo sessions, accept loop
//! - `worker`: sessions on threads or forked processes
//! - `shutdown` / `signals`: cooperative stop and ordered teardown
//!
//! Unix only: sockets are handed between `mio` and std through raw
//! descriptors, signals are consumed with `sigwait`, and process workers
//! use `fork`. Process workers additionally need Linux (`sem_timedwait`).

#[cfg(not(unix))]
compile_error!("turnstile supports unix targets only");

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod network;
pub mod protocol;
pub mod service;
pub mod shutdown;
pub mod signals;
pub mod stats;
pub mod telemetry;
pub mod worker;

pub use config::{Cli, ServerConfig};
pub use error::ServerError;
pub use service::Service;
pub use shutdown::{Shutdown, ShutdownReport, StopReason};
