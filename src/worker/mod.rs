//! Worker layer: one session per worker, thread or forked process
//!
//! The dispatcher acquires a [`Permit`] first, then hands the connection
//! and the permit to a [`Spawner`]. Whatever the variant, the permit is
//! released exactly once, when the session is over: by the thread itself,
//! or by the parent when it reaps a child, however the child died.

mod registry;
mod thread;
mod process;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::core::Permit;
use crate::logging::Logger;
use crate::network::{Connection, SessionConfig};
use crate::stats::ServiceStats;

pub use process::ProcessSpawner;
pub use registry::{DrainReport, WorkerRegistry};
pub use thread::ThreadSpawner;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("cannot start worker thread")]
    Thread(#[source] io::Error),
    #[error("fork failed")]
    Fork(#[source] io::Error),
    #[error("cannot set up the log relay for a process worker")]
    Relay(#[source] io::Error),
    #[error("process workers need a process-shared admission controller")]
    AdmissionNotShared,
    #[error("waiting for worker {id} failed")]
    Wait {
        id: u64,
        #[source]
        source: io::Error,
    },
    #[error("cannot signal worker {id}")]
    Signal {
        id: u64,
        #[source]
        source: io::Error,
    },
}

/// Execution variant for workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerMode {
    #[default]
    Thread,
    Process,
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerMode::Thread => "thread",
            WorkerMode::Process => "process",
        })
    }
}

impl FromStr for WorkerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thread" => Ok(WorkerMode::Thread),
            "process" => Ok(WorkerMode::Process),
            other => Err(format!("unknown worker mode '{other}' (expected 'thread' or 'process')")),
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Session reached `Closed`.
    Completed,
    /// Session ended with a peer-level error.
    Failed,
    /// Session panicked; the slot was still released.
    Panicked,
    /// Killed by a signal (process workers only).
    Signaled(i32),
}

impl WorkerExit {
    /// Exit status a process worker reports for this outcome.
    pub(crate) fn exit_code(self) -> i32 {
        match self {
            WorkerExit::Completed => 0,
            WorkerExit::Failed => 1,
            WorkerExit::Panicked | WorkerExit::Signaled(_) => 2,
        }
    }

    pub(crate) fn from_exit_code(code: i32) -> Self {
        match code {
            0 => WorkerExit::Completed,
            1 => WorkerExit::Failed,
            _ => WorkerExit::Panicked,
        }
    }
}

/// Everything a worker needs besides its connection and permit.
#[derive(Clone)]
pub struct WorkerContext {
    pub session: Arc<SessionConfig>,
    /// Producer handle into the log pipeline. Process workers reach it
    /// through a relay.
    pub logger: Logger,
    pub stats: Arc<ServiceStats>,
}

/// Starts a worker for one accepted connection.
pub trait Spawner: Send + Sync {
    fn spawn(
        &self,
        conn: Connection,
        permit: Permit,
        ctx: &WorkerContext,
    ) -> Result<WorkerHandle, SpawnError>;

    fn mode(&self) -> WorkerMode;
}

/// Handle on a running worker.
pub struct WorkerHandle {
    id: u64,
    peer: SocketAddr,
    kind: HandleKind,
}

enum HandleKind {
    Thread(thread::ThreadWorker),
    Process(process::ChildProcess),
}

impl WorkerHandle {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// OS process id, for process workers.
    pub fn pid(&self) -> Option<i32> {
        match &self.kind {
            HandleKind::Thread(_) => None,
                    HandleKind::Process(child) => Some(child.pid()),
        }
    }

    /// Collect the exit if the worker has finished; never blocks.
    pub fn try_join(&mut self) -> Result<Option<WorkerExit>, SpawnError> {
        match &mut self.kind {
            HandleKind::Thread(worker) => Ok(worker.try_join()),
                    HandleKind::Process(child) => child.try_wait(self.id),
        }
    }

    /// Block until the worker has finished.
    pub fn join(&mut self) -> Result<WorkerExit, SpawnError> {
        match &mut self.kind {
            HandleKind::Thread(worker) => Ok(worker.join()),
                    HandleKind::Process(child) => child.wait(self.id),
        }
    }

    /// Ask the worker to stop now: `SIGTERM` for a process, nothing for a
    /// thread (blocking I/O in a thread cannot be interrupted).
    pub fn terminate(&self) -> Result<(), SpawnError> {
        match &self.kind {
            HandleKind::Thread(_) => Ok(()),
                    HandleKind::Process(child) => child.terminate(self.id),
        }
    }

    pub fn is_process(&self) -> bool {
        !matches!(self.kind, HandleKind::Thread(_))
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("pid", &self.pid())
            .finish()
    }
}
