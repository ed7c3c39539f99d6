//! Admission Control: counting semaphores bounding concurrent workers
//!
//! Two implementations behind one trait:
//! - [`LocalAdmission`]: in-process, FIFO waiter queue, so a waiter is never
//!   overtaken by later arrivals
//! - [`NamedAdmission`]: POSIX named semaphore, visible to every process that
//!   opens the same name. Created before the first fork so that children
//!   share it
//!
//! Workers hold a [`Permit`]; dropping it releases the slot exactly once.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Errors raised by admission controllers.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("admission limit must be at least 1")]
    ZeroLimit,
    #[error("release without matching acquire (limit {limit} already free)")]
    OverRelease { limit: usize },
    #[error("invalid semaphore name {0:?}: must start with '/' and contain no other '/'")]
    InvalidName(String),
    #[error("{op} failed on named semaphore {name}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Counting semaphore shared by the dispatcher and every worker.
pub trait Admission: Send + Sync {
    /// Block until a slot is free, then take it.
    fn acquire(&self) -> Result<(), AdmissionError>;

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    /// Returns whether a slot was taken.
    fn acquire_timeout(&self, timeout: Duration) -> Result<bool, AdmissionError>;

    /// Take a slot only if one is free right now.
    fn try_acquire(&self) -> Result<bool, AdmissionError>;

    /// Return a slot. Fails with `OverRelease` if every slot is already free.
    ///
    /// [`LocalAdmission`] checks and releases under one lock, so the check is
    /// exact. [`NamedAdmission`] cannot: see its `release`.
    fn release(&self) -> Result<(), AdmissionError>;

    /// Currently free slots.
    fn available(&self) -> Result<usize, AdmissionError>;

    /// Configured maximum `N`.
    fn limit(&self) -> usize;

    /// Whether forked children operate on the same counter.
    fn is_process_shared(&self) -> bool {
        false
    }

    /// Remove any system-visible state. Idempotent.
    fn destroy(&self) -> Result<(), AdmissionError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

struct LocalState {
    free: usize,
    // Tickets of blocked callers, oldest first.
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

/// In-process counting semaphore with FIFO hand-off.
pub struct LocalAdmission {
    state: Mutex<LocalState>,
    cond: Condvar,
    limit: usize,
}

impl LocalAdmission {
    pub fn new(limit: usize) -> Result<Self, AdmissionError> {
        if limit == 0 {
            return Err(AdmissionError::ZeroLimit);
        }
        Ok(Self {
            state: Mutex::new(LocalState {
                free: limit,
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
            cond: Condvar::new(),
            limit,
        })
    }

    fn acquire_until(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();

        // Fast path only when nobody is queued, otherwise we would overtake.
        if state.waiters.is_empty() && state.free > 0 {
            state.free -= 1;
            return true;
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);

        loop {
            if state.free > 0 && state.waiters.front() == Some(&ticket) {
                state.waiters.pop_front();
                state.free -= 1;
                if state.free > 0 && !state.waiters.is_empty() {
                    // Next in line may proceed too.
                    self.cond.notify_all();
                }
                return true;
            }

            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        if state.free > 0 && state.waiters.front() == Some(&ticket) {
                            continue;
                        }
                        state.waiters.retain(|t| *t != ticket);
                        // Our departure may have promoted someone to the front.
                        self.cond.notify_all();
                        return false;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    /// Number of callers blocked in acquire.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl Admission for LocalAdmission {
    fn acquire(&self) -> Result<(), AdmissionError> {
        self.acquire_until(None);
        Ok(())
    }

    fn acquire_timeout(&self, timeout: Duration) -> Result<bool, AdmissionError> {
        Ok(self.acquire_until(Some(Instant::now() + timeout)))
    }

    fn try_acquire(&self) -> Result<bool, AdmissionError> {
        let mut state = self.state.lock();
        if state.waiters.is_empty() && state.free > 0 {
            state.free -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn release(&self) -> Result<(), AdmissionError> {
        let mut state = self.state.lock();
        if state.free >= self.limit {
            return Err(AdmissionError::OverRelease { limit: self.limit });
        }
        state.free += 1;
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn available(&self) -> Result<usize, AdmissionError> {
        Ok(self.state.lock().free)
    }

    fn limit(&self) -> usize {
        self.limit
    }
}

// ---------------------------------------------------------------------------
// Cross-process implementation
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
pub use named::NamedAdmission;

#[cfg(target_os = "linux")]
mod named {
    use super::{Admission, AdmissionError};
    use std::ffi::CString;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// POSIX named semaphore (`sem_open`).
    ///
    /// The semaphore memory is mapped shared by the kernel, so the pointer
    /// stays valid and coordinated in forked children.
    pub struct NamedAdmission {
        sem: *mut libc::sem_t,
        name: String,
        c_name: CString,
        limit: usize,
        destroyed: AtomicBool,
    }

    // SAFETY: sem_* calls on one sem_t are thread-safe; the pointer is never
    // dereferenced directly.
    unsafe impl Send for NamedAdmission {}
    unsafe impl Sync for NamedAdmission {}

    impl NamedAdmission {
        /// Create the semaphore with `limit` free slots.
        ///
        /// A semaphore left behind by an unclean previous run is unlinked and
        /// created again instead of failing.
        pub fn create(name: &str, limit: usize) -> Result<Self, AdmissionError> {
            if limit == 0 {
                return Err(AdmissionError::ZeroLimit);
            }
            if !name.starts_with('/') || name.len() < 2 || name[1..].contains('/') {
                return Err(AdmissionError::InvalidName(name.to_string()));
            }
            let c_name =
                CString::new(name).map_err(|_| AdmissionError::InvalidName(name.to_string()))?;

            let sem = match open_exclusive(&c_name, limit) {
                Ok(sem) => sem,
                Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                    tracing::warn!(
                        semaphore = name,
                        "named semaphore already exists, resetting stale state"
                    );
                    // SAFETY: c_name is a valid NUL-terminated string.
                    if unsafe { libc::sem_unlink(c_name.as_ptr()) } == -1 {
                        let err = io::Error::last_os_error();
                        if err.raw_os_error() != Some(libc::ENOENT) {
                            return Err(os_error("sem_unlink", name, err));
                        }
                    }
                    open_exclusive(&c_name, limit).map_err(|e| os_error("sem_open", name, e))?
                }
                Err(err) => return Err(os_error("sem_open", name, err)),
            };

            tracing::debug!(semaphore = name, limit, "named semaphore created");

            Ok(Self {
                sem,
                name: name.to_string(),
                c_name,
                limit,
                destroyed: AtomicBool::new(false),
            })
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        fn value(&self) -> Result<usize, AdmissionError> {
            let mut value: libc::c_int = 0;
            // SAFETY: sem is a live semaphore returned by sem_open.
            if unsafe { libc::sem_getvalue(self.sem, &mut value) } == -1 {
                return Err(os_error(
                    "sem_getvalue",
                    &self.name,
                    io::Error::last_os_error(),
                ));
            }
            // Linux reports 0 (never negative) while waiters are blocked.
            Ok(value.max(0) as usize)
        }
    }

    fn open_exclusive(name: &CString, limit: usize) -> io::Result<*mut libc::sem_t> {
        // SAFETY: variadic sem_open with O_CREAT takes (mode, value).
        let sem = unsafe {
            libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                limit as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(sem)
        }
    }

    fn os_error(op: &'static str, name: &str, source: io::Error) -> AdmissionError {
        AdmissionError::Os {
            op,
            name: name.to_string(),
            source,
        }
    }

    fn deadline_after(timeout: Duration) -> libc::timespec {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: valid out-pointer; CLOCK_REALTIME is what sem_timedwait uses.
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

        let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
        let secs = timeout.as_secs() + nanos / 1_000_000_000;
        libc::timespec {
            tv_sec: now.tv_sec.saturating_add(secs as libc::time_t),
            tv_nsec: (nanos % 1_000_000_000) as _,
        }
    }

    impl Admission for NamedAdmission {
        fn acquire(&self) -> Result<(), AdmissionError> {
            loop {
                // SAFETY: sem is a live semaphore returned by sem_open.
                if unsafe { libc::sem_wait(self.sem) } == 0 {
                    return Ok(());
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(os_error("sem_wait", &self.name, err));
                }
            }
        }

        fn acquire_timeout(&self, timeout: Duration) -> Result<bool, AdmissionError> {
            let deadline = deadline_after(timeout);
            loop {
                // SAFETY: sem is live; deadline is a valid timespec.
                if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::ETIMEDOUT) => return Ok(false),
                    Some(libc::EINTR) => continue,
                    _ => return Err(os_error("sem_timedwait", &self.name, err)),
                }
            }
        }

        fn try_acquire(&self) -> Result<bool, AdmissionError> {
            loop {
                // SAFETY: sem is a live semaphore returned by sem_open.
                if unsafe { libc::sem_trywait(self.sem) } == 0 {
                    return Ok(true);
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => return Ok(false),
                    Some(libc::EINTR) => continue,
                    _ => return Err(os_error("sem_trywait", &self.name, err)),
                }
            }
        }

        /// Best-effort over-release check: `sem_getvalue` and `sem_post`
        /// are two calls, so two racing releases (from any processes) can
        /// both pass the check and push the count past `N`. It catches a
        /// double release made in sequence, which is what the `Permit`
        /// guard's `debug_assert!` and the tests rely on; correctness rests
        /// on every slot having exactly one releasing owner.
        fn release(&self) -> Result<(), AdmissionError> {
            if self.value()? >= self.limit {
                return Err(AdmissionError::OverRelease { limit: self.limit });
            }
            // SAFETY: sem is a live semaphore returned by sem_open.
            if unsafe { libc::sem_post(self.sem) } == -1 {
                return Err(os_error("sem_post", &self.name, io::Error::last_os_error()));
            }
            Ok(())
        }

        fn available(&self) -> Result<usize, AdmissionError> {
            self.value()
        }

        fn limit(&self) -> usize {
            self.limit
        }

        fn is_process_shared(&self) -> bool {
            true
        }

        fn destroy(&self) -> Result<(), AdmissionError> {
            if self.destroyed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            // SAFETY: c_name is a valid NUL-terminated string.
            if unsafe { libc::sem_unlink(self.c_name.as_ptr()) } == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(os_error("sem_unlink", &self.name, err));
                }
            }
            tracing::debug!(semaphore = %self.name, "named semaphore unlinked");
            Ok(())
        }
    }

    impl Drop for NamedAdmission {
        fn drop(&mut self) {
            // SAFETY: sem came from sem_open and is closed exactly once here.
            unsafe { libc::sem_close(self.sem) };
        }
    }
}

// ---------------------------------------------------------------------------
// Scoped permit
// ---------------------------------------------------------------------------

/// One admission slot, released when dropped.
#[must_use = "dropping a permit releases the slot immediately"]
pub struct Permit {
    admission: Arc<dyn Admission>,
    armed: bool,
}

impl Permit {
    /// Block until a slot is free.
    pub fn acquire(admission: &Arc<dyn Admission>) -> Result<Self, AdmissionError> {
        admission.acquire()?;
        Ok(Self::armed(admission))
    }

    /// Wait at most `timeout` for a slot.
    pub fn acquire_timeout(
        admission: &Arc<dyn Admission>,
        timeout: Duration,
    ) -> Result<Option<Self>, AdmissionError> {
        Ok(admission
            .acquire_timeout(timeout)?
            .then(|| Self::armed(admission)))
    }

    pub fn try_acquire(admission: &Arc<dyn Admission>) -> Result<Option<Self>, AdmissionError> {
        Ok(admission.try_acquire()?.then(|| Self::armed(admission)))
    }

    fn armed(admission: &Arc<dyn Admission>) -> Self {
        Self {
            admission: Arc::clone(admission),
            armed: true,
        }
    }

    /// Give up this copy of the slot without releasing it; whoever received
    /// the other copy (a forked child) is now responsible for the release.
    pub fn forget(mut self) {
        self.armed = false;
    }

    /// Release now and report the outcome instead of logging it.
    pub fn release(mut self) -> Result<(), AdmissionError> {
        self.armed = false;
        self.admission.release()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.admission.release() {
            tracing::error!(error = %err, "admission slot release failed");
            debug_assert!(false, "admission slot release failed: {err}");
        }
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("limit", &self.admission.limit())
            .field("armed", &self.armed)
            .finish()
    }
}
