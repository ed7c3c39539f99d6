//! Process workers: `fork()` per session
//!
//! A child shares exactly two things with its parent: the named semaphore
//! behind the permit, and a socket pair carrying its log records to a
//! [`Relay`] in the parent. Every other inherited descriptor is closed
//! right after the fork. The child never returns into the parent's stack:
//! it leaves through `_exit`.
//!
//! The parent keeps the permit and releases it when it reaps the child, so
//! a slot comes back however the child ended (clean exit, panic, `SIGKILL`).

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::{HandleKind, SpawnError, Spawner, WorkerContext, WorkerExit, WorkerHandle, WorkerMode};
use crate::core::{Admission, Permit};
use crate::logging::{Logger, Relay};
use crate::network::{Connection, Session, SessionConfig};

/// Descriptor scan bound when `sysconf` gives no usable limit.
const FALLBACK_OPEN_MAX: RawFd = 1024;
const MAX_SCANNED_FDS: RawFd = 65_536;

/// Forks one child per connection.
#[derive(Debug, Default)]
pub struct ProcessSpawner {
    _private: (),
}

impl ProcessSpawner {
    /// Fails unless `admission` is visible across `fork()`.
    pub fn new(admission: &Arc<dyn Admission>) -> Result<Self, SpawnError> {
        if !admission.is_process_shared() {
            return Err(SpawnError::AdmissionNotShared);
        }
        Ok(Self::default())
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(
        &self,
        conn: Connection,
        permit: Permit,
        ctx: &WorkerContext,
    ) -> Result<WorkerHandle, SpawnError> {
        let relay_pair = if ctx.logger.is_disabled() {
            None
        } else {
            Some(UnixStream::pair().map_err(SpawnError::Relay)?)
        };

        // SAFETY: the child restricts itself to what `run_child` allows and
        // exits with `_exit`; it never unwinds back into the parent's frames.
        let pid = unsafe { libc::fork() };

        match pid {
            -1 => Err(SpawnError::Fork(io::Error::last_os_error())),
            0 => {
                let relay = relay_pair.map(|(_parent_end, child_end)| child_end);
                run_child(conn, permit, relay, &ctx.session)
            }
            pid => {
                let Connection { id, peer, stream } = conn;
                drop(stream);

                let relay = relay_pair.and_then(|(parent_end, child_end)| {
                    drop(child_end);
                    Relay::spawn(format!("turnstile-relay-{id}"), parent_end, ctx.logger.clone())
                        .map_err(|err| {
                            tracing::warn!(worker = id, error = %err, "cannot start log relay, child records are lost");
                        })
                        .ok()
                });

                tracing::debug!(worker = id, pid, %peer, "forked session worker");
                Ok(WorkerHandle {
                    id,
                    peer,
                    kind: HandleKind::Process(ChildProcess {
                        pid,
                        exit: None,
                        permit: Some(permit),
                        relay,
                    }),
                })
            }
        }
    }

    fn mode(&self) -> WorkerMode {
        WorkerMode::Process
    }
}

/// Body of a forked worker.
///
/// The child is a copy of a multi-threaded parent: any lock another parent
/// thread held at fork time stays locked forever here. So after the fork
/// the child may only:
/// - make syscalls on its own descriptors (the connection, the relay end);
/// - allocate (libc resets its allocator locks across `fork`);
/// - format and send log records through [`Logger::relay`], which locks
///   nothing;
/// - leave through `_exit`.
///
/// It must not use `tracing`, stderr, the default panic hook, or any
/// `parking_lot` lock shared with the parent. Failures are reported through
/// the exit code only.
fn run_child(
    conn: Connection,
    permit: Permit,
    relay: Option<UnixStream>,
    session: &Arc<SessionConfig>,
) -> ! {
    // The parent's copy releases the slot when it reaps this process.
    permit.forget();

    let Connection { stream, peer, .. } = conn;
    let mut keep = vec![stream.as_raw_fd()];
    keep.extend(relay.as_ref().map(AsRawFd::as_raw_fd));
    close_inherited(&keep);

    // Default action for SIGTERM again, so the parent can stop this child.
    let _ = crate::signals::unblock_termination();
    // The default hook writes to stderr; the exit code reports panics.
    panic::set_hook(Box::new(|_| {}));

    let logger = relay.map_or_else(Logger::disabled, Logger::relay);
    let session_config = Arc::clone(session);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        Session::new(stream, peer, session_config, logger)
            .untraced()
            .run()
    }));

    let exit = match outcome {
        Ok(Ok(_)) => WorkerExit::Completed,
        Ok(Err(_)) => WorkerExit::Failed,
        Err(_) => WorkerExit::Panicked,
    };

    // SAFETY: terminates only this child, skipping the parent's destructors.
    unsafe { libc::_exit(exit.exit_code()) }
}

/// Close every descriptor above stderr except `keep`.
fn close_inherited(keep: &[RawFd]) {
    // SAFETY: sysconf has no preconditions.
    let open_max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let limit = if open_max <= 0 {
        FALLBACK_OPEN_MAX
    } else {
        open_max.min(MAX_SCANNED_FDS as libc::c_long) as RawFd
    };

    for fd in 3..limit {
        if !keep.contains(&fd) {
            // SAFETY: closes this child's copy only; EBADF on unused numbers
            // is expected and ignored.
            unsafe {
                libc::close(fd);
            }
        }
    }
}

pub(super) struct ChildProcess {
    pid: libc::pid_t,
    exit: Option<WorkerExit>,
    /// Released once the child has been reaped.
    permit: Option<Permit>,
    relay: Option<Relay>,
}

impl ChildProcess {
    pub(super) fn pid(&self) -> i32 {
        self.pid
    }

    pub(super) fn try_wait(&mut self, id: u64) -> Result<Option<WorkerExit>, SpawnError> {
        self.wait_with(id, libc::WNOHANG)
    }

    pub(super) fn wait(&mut self, id: u64) -> Result<WorkerExit, SpawnError> {
        loop {
            if let Some(exit) = self.wait_with(id, 0)? {
                return Ok(exit);
            }
        }
    }

    fn wait_with(&mut self, id: u64, flags: libc::c_int) -> Result<Option<WorkerExit>, SpawnError> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }

        let mut status: libc::c_int = 0;
        loop {
            // SAFETY: `status` is a valid out-pointer; `pid` is our child.
            let ret = unsafe { libc::waitpid(self.pid, &mut status, flags) };
            if ret == 0 {
                return Ok(None);
            }
            if ret == self.pid {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(SpawnError::Wait { id, source: err });
        }

        let exit = if libc::WIFEXITED(status) {
            WorkerExit::from_exit_code(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            WorkerExit::Signaled(libc::WTERMSIG(status))
        } else {
            return Ok(None);
        };
        self.exit = Some(exit);
        self.settle();
        Ok(self.exit)
    }

    /// The child is gone: free its slot, then collect its last records.
    fn settle(&mut self) {
        drop(self.permit.take());
        if let Some(relay) = self.relay.take() {
            relay.join();
        }
    }

    pub(super) fn terminate(&self, id: u64) -> Result<(), SpawnError> {
        if self.exit.is_some() {
            return Ok(());
        }
        // SAFETY: plain syscall on our own child's pid.
        let ret = unsafe { libc::kill(self.pid, libc::SIGTERM) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            // Already gone, waiting to be reaped.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(SpawnError::Signal { id, source: err });
        }
        Ok(())
    }
}
