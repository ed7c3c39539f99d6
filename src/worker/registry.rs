use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{WorkerExit, WorkerHandle};
use crate::stats::ServiceStats;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How in-flight workers ended during a drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Finished on their own within the grace period.
    pub completed: usize,
    /// Processes sent `SIGTERM` after the grace period, then reaped.
    pub terminated: usize,
    /// Threads still blocked after the grace period; left to process exit.
    pub abandoned: usize,
}

/// In-flight workers owned by the dispatcher.
pub struct WorkerRegistry {
    workers: Vec<WorkerHandle>,
    stats: Arc<ServiceStats>,
}

impl WorkerRegistry {
    pub fn new(stats: Arc<ServiceStats>) -> Self {
        Self {
            workers: Vec::new(),
            stats,
        }
    }

    pub fn insert(&mut self, handle: WorkerHandle) {
        self.workers.push(handle);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Collect finished workers without blocking. Returns how many.
    pub fn reap(&mut self) -> usize {
        let before = self.workers.len();
        let stats = &self.stats;
        self.workers.retain_mut(|worker| match worker.try_join() {
            Ok(Some(exit)) => {
                account(stats, worker, exit);
                false
            }
            Ok(None) => true,
            Err(err) => {
                tracing::error!(worker = worker.id(), error = %err, "cannot reap worker");
                false
            }
        });
        before - self.workers.len()
    }

    /// Wait up to `grace` for every worker, then terminate and reap
    /// process workers that are still running.
    pub fn drain(&mut self, grace: Duration) -> DrainReport {
        let mut report = DrainReport::default();
        let deadline = Instant::now() + grace;

        loop {
            report.completed += self.reap();
            if self.workers.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(DRAIN_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }

        for mut worker in self.workers.drain(..) {
            if !worker.is_process() {
                tracing::warn!(worker = worker.id(), peer = %worker.peer(), "worker still busy at shutdown");
                report.abandoned += 1;
                continue;
            }

            if let Err(err) = worker.terminate() {
                tracing::error!(error = %err, "cannot terminate worker");
            }
            match worker.join() {
                Ok(exit) => {
                    tracing::info!(worker = worker.id(), pid = ?worker.pid(), ?exit, "worker terminated");
                    account(&self.stats, &worker, exit);
                    report.terminated += 1;
                }
                Err(err) => tracing::error!(error = %err, "cannot reap terminated worker"),
            }
        }

        report
    }
}

fn account(stats: &ServiceStats, worker: &WorkerHandle, exit: WorkerExit) {
    tracing::debug!(worker = worker.id(), peer = %worker.peer(), ?exit, "worker reaped");
    match exit {
        WorkerExit::Completed => stats.session_completed(),
        WorkerExit::Failed => stats.session_failed(),
        WorkerExit::Panicked => stats.worker_panicked(),
        WorkerExit::Signaled(_) => stats.worker_terminated(),
    }
}

impl Drop for WorkerRegistry {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            tracing::warn!(workers = self.workers.len(), "worker registry dropped with workers in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Admission, LocalAdmission, Permit};
    use crate::logging::Logger;
    use crate::network::{Connection, SessionConfig};
    use crate::worker::{Spawner, ThreadSpawner, WorkerContext};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    fn spawn_session(
        listener: &TcpListener,
        admission: &Arc<dyn Admission>,
        ctx: &WorkerContext,
        id: u64,
    ) -> (WorkerHandle, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        let permit = Permit::acquire(admission).unwrap();
        let handle = ThreadSpawner::new()
            .spawn(Connection { id, stream, peer }, permit, ctx)
            .unwrap();
        (handle, client)
    }

    #[test]
    fn test_reap_and_drain_account_workers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let admission: Arc<dyn Admission> = Arc::new(LocalAdmission::new(2).unwrap());
        let stats = Arc::new(ServiceStats::new());
        let ctx = WorkerContext {
            session: Arc::new(SessionConfig::default()),
            logger: Logger::disabled(),
            stats: Arc::clone(&stats),
        };
        let mut registry = WorkerRegistry::new(Arc::clone(&stats));

        let (first, mut quitting) = spawn_session(&listener, &admission, &ctx, 1);
        let (second, _idle) = spawn_session(&listener, &admission, &ctx, 2);
        registry.insert(first);
        registry.insert(second);
        assert_eq!(registry.len(), 2);

        quitting.write_all(b"QUIT\n").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.len() > 1 && Instant::now() < deadline {
            registry.reap();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(stats.snapshot().sessions_completed, 1);

        // The idle client never quits: its thread is abandoned.
        let report = registry.drain(Duration::from_millis(50));
        assert_eq!(report.abandoned, 1);
        assert!(registry.is_empty());
    }
}
