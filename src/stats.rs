//! Service counters and the periodic load monitor

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::Admission;
use crate::network::SessionSummary;
use crate::shutdown::StopToken;

/// Counters updated by the dispatcher, workers and the registry.
///
/// In process mode message and byte counts stay in the child and are not
/// folded in; session outcomes still are, from the exit status.
#[derive(Debug, Default)]
pub struct ServiceStats {
    connections_accepted: AtomicU64,
    connections_dropped: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    workers_panicked: AtomicU64,
    workers_terminated: AtomicU64,
    messages_echoed: AtomicU64,
    bytes_echoed: AtomicU64,
}

/// Point-in-time copy of [`ServiceStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_dropped: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub workers_panicked: u64,
    pub workers_terminated: u64,
    pub messages_echoed: u64,
    pub bytes_echoed: u64,
}

impl StatsSnapshot {
    /// Sessions that have ended, whichever way.
    pub fn sessions_finished(&self) -> u64 {
        self.sessions_completed + self.sessions_failed + self.workers_panicked + self.workers_terminated
    }
}

impl ServiceStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Accepted but never handed to a worker.
    #[inline]
    pub fn connection_dropped(&self) {
        self.connections_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_summary(&self, summary: &SessionSummary) {
        self.messages_echoed
            .fetch_add(summary.messages, Ordering::Relaxed);
        self.bytes_echoed
            .fetch_add(summary.bytes_echoed, Ordering::Relaxed);
    }

    #[inline]
    pub fn session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn worker_panicked(&self) {
        self.workers_panicked.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn worker_terminated(&self) {
        self.workers_terminated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_dropped: self.connections_dropped.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            workers_panicked: self.workers_panicked.load(Ordering::Relaxed),
            workers_terminated: self.workers_terminated.load(Ordering::Relaxed),
            messages_echoed: self.messages_echoed.load(Ordering::Relaxed),
            bytes_echoed: self.bytes_echoed.load(Ordering::Relaxed),
        }
    }

    pub fn print_stats(&self, uptime: Duration) {
        let s = self.snapshot();
        let secs = uptime.as_secs_f64().max(f64::EPSILON);

        println!("\n📊 Service Stats (uptime: {:.1}s)", uptime.as_secs_f64());
        println!(
            "   Connections:   {} accepted, {} dropped",
            s.connections_accepted, s.connections_dropped
        );
        println!(
            "   Sessions:      {} completed, {} failed",
            s.sessions_completed, s.sessions_failed
        );
        println!(
            "   Messages:      {} ({:.1}/sec)",
            s.messages_echoed,
            s.messages_echoed as f64 / secs
        );
        println!("   Bytes echoed:  {} KB", s.bytes_echoed / 1024);
        if s.workers_panicked > 0 || s.workers_terminated > 0 {
            println!(
                "   Workers lost:  {} panicked, {} terminated ⚠️",
                s.workers_panicked, s.workers_terminated
            );
        }
    }
}

/// Periodically reports free and busy admission slots.
pub struct LoadMonitor {
    handle: JoinHandle<()>,
}

impl LoadMonitor {
    pub fn spawn(
        admission: Arc<dyn Admission>,
        stats: Arc<ServiceStats>,
        stop: StopToken,
        interval: Duration,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name("turnstile-monitor".to_string())
            .spawn(move || {
                let started = Instant::now();
                while !stop.wait_timeout(interval) {
                    report_load(admission.as_ref(), &stats, started.elapsed());
                }
            })?;
        Ok(Self { handle })
    }

    /// Wait for the monitor to notice the stop request.
    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("load monitor panicked");
        }
    }
}

fn report_load(admission: &dyn Admission, stats: &ServiceStats, uptime: Duration) {
    let limit = admission.limit();
    match admission.available() {
        Ok(free) => {
            let s = stats.snapshot();
            tracing::info!(
                free,
                in_use = limit.saturating_sub(free),
                limit,
                accepted = s.connections_accepted,
                finished = s.sessions_finished(),
                uptime_secs = uptime.as_secs(),
                "admission load"
            );
        }
        Err(err) => tracing::warn!(error = %err, "cannot read admission load"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LocalAdmission;
    use crate::shutdown::{Shutdown, StopReason};

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ServiceStats::new();
        stats.connection_accepted();
        stats.connection_accepted();
        stats.session_completed();
        stats.worker_panicked();
        stats.record_summary(&SessionSummary {
            peer: "127.0.0.1:1".parse().unwrap(),
            messages: 3,
            bytes_echoed: 42,
            duration: Duration::ZERO,
        });

        let s = stats.snapshot();
        assert_eq!(s.connections_accepted, 2);
        assert_eq!(s.sessions_finished(), 2);
        assert_eq!(s.messages_echoed, 3);
        assert_eq!(s.bytes_echoed, 42);
    }

    #[test]
    fn test_monitor_stops_on_shutdown() {
        let admission: Arc<dyn Admission> = Arc::new(LocalAdmission::new(2).unwrap());
        let shutdown = Shutdown::new();
        let monitor = LoadMonitor::spawn(
            admission,
            Arc::new(ServiceStats::new()),
            shutdown.token(),
            Duration::from_millis(5),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        shutdown.trigger(StopReason::Requested);
        monitor.join();
    }
}
