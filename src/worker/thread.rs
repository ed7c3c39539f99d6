//! In-process workers: one named thread per session

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

use super::{HandleKind, SpawnError, Spawner, WorkerContext, WorkerExit, WorkerHandle, WorkerMode};
use crate::core::Permit;
use crate::network::{Connection, Session};

/// Runs each session on its own thread, sharing logger and stats by `Arc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl ThreadSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl Spawner for ThreadSpawner {
    fn spawn(
        &self,
        conn: Connection,
        permit: Permit,
        ctx: &WorkerContext,
    ) -> Result<WorkerHandle, SpawnError> {
        let Connection { id, stream, peer } = conn;
        let session_config = Arc::clone(&ctx.session);
        let logger = ctx.logger.clone();
        let stats = Arc::clone(&ctx.stats);

        let handle = Builder::new()
            .name(format!("turnstile-worker-{id}"))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    Session::new(stream, peer, session_config, logger).run()
                }));
                // Released on every path, including a caught panic.
                drop(permit);

                match outcome {
                    Ok(Ok(summary)) => {
                        stats.record_summary(&summary);
                        tracing::debug!(worker = id, %peer, messages = summary.messages, "session closed");
                        WorkerExit::Completed
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(worker = id, %peer, error = %err, "session ended early");
                        WorkerExit::Failed
                    }
                    Err(_) => {
                        tracing::error!(worker = id, %peer, "session panicked");
                        WorkerExit::Panicked
                    }
                }
            })
            .map_err(SpawnError::Thread)?;

        Ok(WorkerHandle {
            id,
            peer,
            kind: HandleKind::Thread(ThreadWorker {
                handle: Some(handle),
                exit: None,
            }),
        })
    }

    fn mode(&self) -> WorkerMode {
        WorkerMode::Thread
    }
}

pub(super) struct ThreadWorker {
    handle: Option<JoinHandle<WorkerExit>>,
    exit: Option<WorkerExit>,
}

impl ThreadWorker {
    pub(super) fn try_join(&mut self) -> Option<WorkerExit> {
        match &self.handle {
            Some(handle) if handle.is_finished() => Some(self.join()),
            Some(_) => None,
            None => self.exit,
        }
    }

    pub(super) fn join(&mut self) -> WorkerExit {
        if let Some(handle) = self.handle.take() {
            // The body catches panics itself; a join error is a panic
            // raised after the permit was dropped.
            let exit = handle.join().unwrap_or(WorkerExit::Panicked);
            self.exit = Some(exit);
        }
        self.exit.unwrap_or(WorkerExit::Panicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Admission, LocalAdmission};
    use crate::logging::{Logger, MemorySink};
    use crate::network::SessionConfig;
    use crate::stats::ServiceStats;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};

    fn context(sink: Arc<MemorySink>) -> WorkerContext {
        WorkerContext {
            session: Arc::new(SessionConfig::default()),
            logger: Logger::direct(sink),
            stats: Arc::new(ServiceStats::new()),
        }
    }

    fn accepted_pair(listener: &TcpListener, id: u64) -> (Connection, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        (Connection { id, stream, peer }, client)
    }

    #[test]
    fn test_thread_worker_runs_session_and_releases() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let admission: Arc<dyn Admission> = Arc::new(LocalAdmission::new(1).unwrap());
        let sink = Arc::new(MemorySink::new());
        let ctx = context(sink.clone());

        let (conn, client) = accepted_pair(&listener, 7);
        let permit = Permit::acquire(&admission).unwrap();
        assert_eq!(admission.available().unwrap(), 0);

        let mut handle = ThreadSpawner::new().spawn(conn, permit, &ctx).unwrap();
        assert_eq!(handle.id(), 7);
        assert!(!handle.is_process());

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert!(line.starts_with("Hi! I'm an echo server."));
        reader.read_line(&mut line).unwrap();

        let mut writer = client;
        writer.write_all(b"ping\nQUIT\n").unwrap();
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "ping\n");

        assert_eq!(handle.join().unwrap(), WorkerExit::Completed);
        assert_eq!(admission.available().unwrap(), 1);
        assert_eq!(ctx.stats.snapshot().messages_echoed, 1);
        assert_eq!(handle.try_join().unwrap(), Some(WorkerExit::Completed));
    }

    #[test]
    fn test_peer_reset_counts_as_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let admission: Arc<dyn Admission> = Arc::new(LocalAdmission::new(1).unwrap());
        let ctx = context(Arc::new(MemorySink::new()));

        let (conn, client) = accepted_pair(&listener, 1);
        drop(client);

        let permit = Permit::acquire(&admission).unwrap();
        let mut handle = ThreadSpawner::new().spawn(conn, permit, &ctx).unwrap();
        assert_eq!(handle.join().unwrap(), WorkerExit::Failed);
        assert_eq!(admission.available().unwrap(), 1);
    }
}
