//! Termination signals delivered to a thread, not a handler
//!
//! [`SignalListener::install`] blocks `SIGINT` and `SIGTERM` in the calling
//! thread; every thread spawned afterwards inherits the mask, so the only
//! place those signals are consumed is the `sigwait` loop started by
//! [`SignalListener::spawn`].

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::thread::JoinHandleExt;
use std::thread::{self, JoinHandle};

use crate::shutdown::{Shutdown, StopReason};

fn termination_set() -> io::Result<libc::sigset_t> {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigemptyset initializes the set before sigaddset reads it.
    unsafe {
        if libc::sigemptyset(set.as_mut_ptr()) == -1
            || libc::sigaddset(set.as_mut_ptr(), libc::SIGINT) == -1
            || libc::sigaddset(set.as_mut_ptr(), libc::SIGTERM) == -1
        {
            return Err(io::Error::last_os_error());
        }
        Ok(set.assume_init())
    }
}

fn set_mask(how: libc::c_int, set: &libc::sigset_t) -> io::Result<()> {
    // SAFETY: `set` is initialized; the old mask is not requested.
    let ret = unsafe { libc::pthread_sigmask(how, set, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    Ok(())
}

/// Undo [`SignalListener::install`] in the calling thread. Used by forked
/// workers, which have no `sigwait` thread.
pub fn unblock_termination() -> io::Result<()> {
    set_mask(libc::SIG_UNBLOCK, &termination_set()?)
}

/// Termination signals blocked, waiting to be consumed.
pub struct SignalListener {
    set: libc::sigset_t,
}

impl SignalListener {
    /// Block `SIGINT`/`SIGTERM` in this thread. Call before spawning any
    /// other thread.
    pub fn install() -> io::Result<Self> {
        let set = termination_set()?;
        set_mask(libc::SIG_BLOCK, &set)?;
        Ok(Self { set })
    }

    /// Start the `sigwait` thread; the first signal triggers `shutdown`.
    pub fn spawn(self, shutdown: Shutdown) -> io::Result<SignalThread> {
        let handle = thread::Builder::new()
            .name("turnstile-signals".to_string())
            .spawn(move || {
                let mut sig: libc::c_int = 0;
                // SAFETY: `set` is initialized and `sig` is a valid out-pointer.
                let ret = unsafe { libc::sigwait(&self.set, &mut sig) };
                if ret != 0 {
                    tracing::error!(error = %io::Error::from_raw_os_error(ret), "sigwait failed");
                    return;
                }

                if shutdown.is_triggered() {
                    tracing::debug!(signal = sig, "signal after shutdown request");
                    return;
                }
                tracing::info!(signal = sig, "termination signal received");
                shutdown.trigger(StopReason::Signal(sig));
            })?;
        Ok(SignalThread { handle })
    }
}

/// Running `sigwait` thread.
pub struct SignalThread {
    handle: JoinHandle<()>,
}

impl SignalThread {
    /// Release the thread from `sigwait` if no signal arrived yet.
    ///
    /// The thread may exit between any check and the signal; the handle is
    /// not joined yet, so its id stays valid and `ESRCH` just means it is
    /// already done.
    pub fn wake(&self) -> io::Result<()> {
        let thread = self.handle.as_pthread_t();
        // SAFETY: the handle is unjoined, so `thread` names this thread
        // (running or exited); it blocks SIGTERM, so `sigwait` consumes it.
        let ret = unsafe { libc::pthread_kill(thread as libc::pthread_t, libc::SIGTERM) };
        match ret {
            0 | libc::ESRCH => Ok(()),
            err => Err(io::Error::from_raw_os_error(err)),
        }
    }

    /// Wake the thread if needed, then join it.
    pub fn stop(self) {
        if let Err(err) = self.wake() {
            tracing::warn!(error = %err, "cannot wake signal thread");
            return;
        }
        if self.handle.join().is_err() {
            tracing::error!("signal thread panicked");
        }
    }
}
