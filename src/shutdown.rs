//! Cooperative shutdown
//!
//! A stop request is a flag plus a wake-up: [`Shutdown::trigger`] records
//! the first reason, wakes every [`StopToken`] waiter and the dispatcher's
//! `mio::Waker`. [`Shutdown::teardown`] then releases resources in order,
//! exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::Waker;
use parking_lot::{Condvar, Mutex};

use crate::core::Admission;
use crate::logging::{LogPipeline, Logger};
use crate::worker::{DrainReport, WorkerRegistry};

/// Why the service stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Termination signal, by number.
    Signal(i32),
    /// Programmatic request.
    Requested,
    /// Unrecoverable error.
    Fatal(String),
}

impl StopReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StopReason::Fatal(_))
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Signal(sig) => write!(f, "signal {sig}"),
            StopReason::Requested => f.write_str("requested"),
            StopReason::Fatal(msg) => write!(f, "fatal error: {msg}"),
        }
    }
}

/// Outcome of a teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub reason: StopReason,
    pub workers: DrainReport,
    /// Records the log writer committed, if a pipeline was running.
    pub records_written: Option<u64>,
    /// Non-fatal problems met while tearing down.
    pub errors: Vec<String>,
}

impl ShutdownReport {
    /// Whether the process should exit with success.
    pub fn is_success(&self) -> bool {
        !self.reason.is_fatal() && self.errors.is_empty()
    }
}

/// What teardown has to release.
pub struct Teardown<'a> {
    pub admission: &'a dyn Admission,
    pub workers: &'a mut WorkerRegistry,
    pub pipeline: Option<&'a LogPipeline>,
    pub logger: &'a Logger,
    pub grace: Duration,
}

struct StopState {
    stopped: AtomicBool,
    reason: Mutex<Option<StopReason>>,
    changed: Condvar,
    waker: Mutex<Option<Arc<Waker>>>,
    report: Mutex<Option<ShutdownReport>>,
}

/// Shared stop switch. Cheap to clone.
#[derive(Clone)]
pub struct Shutdown {
    state: Arc<StopState>,
}

/// Read-only view of a [`Shutdown`].
#[derive(Clone)]
pub struct StopToken {
    state: Arc<StopState>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StopState {
                stopped: AtomicBool::new(false),
                reason: Mutex::new(None),
                changed: Condvar::new(),
                waker: Mutex::new(None),
                report: Mutex::new(None),
            }),
        }
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            state: Arc::clone(&self.state),
        }
    }

    /// Wake `waker` on trigger. Wakes immediately if already triggered.
    pub fn register_waker(&self, waker: Arc<Waker>) {
        if self.is_triggered() {
            wake(&waker);
        }
        *self.state.waker.lock() = Some(waker);
    }

    /// Request a stop. Returns `false` if one was already requested; the
    /// first reason is kept.
    pub fn trigger(&self, reason: StopReason) -> bool {
        {
            let mut current = self.state.reason.lock();
            if let Some(first) = current.as_ref() {
                tracing::debug!(first = %first, ignored = %reason, "shutdown already requested");
                return false;
            }
            tracing::info!(reason = %reason, "shutdown requested");
            *current = Some(reason);
            self.state.stopped.store(true, Ordering::Release);
            self.state.changed.notify_all();
        }

        if let Some(waker) = self.state.waker.lock().as_ref() {
            wake(waker);
        }
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.state.reason.lock().clone()
    }

    /// Report of the teardown, once it has run.
    pub fn report(&self) -> Option<ShutdownReport> {
        self.state.report.lock().clone()
    }

    /// Release everything, in order:
    /// 1. destroy the admission resource (unlinks a named semaphore)
    /// 2. wait up to `grace` for in-flight workers
    /// 3. terminate and reap whatever is left
    /// 4. drain and stop the log pipeline
    ///
    /// Runs once; later calls return the first report. Implies
    /// `trigger(Requested)` if no stop was requested yet.
    pub fn teardown(&self, parts: Teardown<'_>) -> ShutdownReport {
        let mut slot = self.state.report.lock();
        if let Some(report) = slot.as_ref() {
            return report.clone();
        }

        self.trigger(StopReason::Requested);
        let reason = self.reason().unwrap_or(StopReason::Requested);
        let mut errors = Vec::new();

        if let Err(err) = parts.logger.log(format!("Shutting down ({reason})")) {
            tracing::debug!(error = %err, "shutdown record not written");
        }

        if let Err(err) = parts.admission.destroy() {
            tracing::error!(error = %err, "cannot destroy admission resource");
            errors.push(err.to_string());
        }

        let workers = parts.workers.drain(parts.grace);

        let records_written = parts.pipeline.map(|pipeline| match pipeline.shutdown() {
            Ok(written) => written,
            Err(err) => {
                tracing::error!(error = %err, "log pipeline did not drain cleanly");
                errors.push(err.to_string());
                pipeline.records_written()
            }
        });

        let report = ShutdownReport {
            reason,
            workers,
            records_written,
            errors,
        };
        tracing::info!(
            reason = %report.reason,
            completed = report.workers.completed,
            terminated = report.workers.terminated,
            abandoned = report.workers.abandoned,
            "teardown finished"
        );
        *slot = Some(report.clone());
        report
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl StopToken {
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }

    /// Block up to `timeout` for a stop request. Returns whether stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut reason = self.state.reason.lock();
        if reason.is_none() {
            self.state.changed.wait_for(&mut reason, timeout);
        }
        reason.is_some()
    }
}

fn wake(waker: &Waker) {
    if let Err(err) = waker.wake() {
        tracing::error!(error = %err, "cannot wake dispatcher");
    }
}
