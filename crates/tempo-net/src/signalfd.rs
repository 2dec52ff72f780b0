//! Signal-to-descriptor bridge.
//!
//! `SIGINT`/`SIGTERM` are blocked and routed through a `signalfd`, so the
//! reactor observes them as ordinary readiness events instead of async
//! handlers. Blocking must happen before any thread is spawned that should
//! not receive the signals directly: call [`block_shutdown_signals`] from
//! `main` first; spawned threads inherit the mask.

use std::os::unix::io::RawFd;

use tempo_core::tfatal;

use crate::error::{errno_name, last_errno, NetError, Result};

/// The signals that request shutdown.
pub const SHUTDOWN_SIGNALS: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];

fn shutdown_sigset() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        for sig in SHUTDOWN_SIGNALS {
            libc::sigaddset(&mut set, sig);
        }
        set
    }
}

/// Block `SIGINT`/`SIGTERM` on the calling thread (and, via inheritance,
/// on every thread it spawns afterwards). Required before creating a
/// [`SignalFd`].
pub fn block_shutdown_signals() -> Result<()> {
    let set = shutdown_sigset();
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(NetError::SigMask(rc));
    }
    Ok(())
}

/// A non-blocking descriptor delivering the blocked shutdown signals.
pub struct SignalFd {
    fd: RawFd,
}

impl SignalFd {
    /// Create the signal descriptor. Failure here is a fatal invariant
    /// violation: shutdown signals would be lost.
    pub fn new() -> Self {
        let set = shutdown_sigset();
        let fd = unsafe { libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        if fd < 0 {
            tfatal!("signalfd failed: {}", errno_name(last_errno()));
        }
        Self { fd }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Drain every pending signal. Returns true if any `SIGINT`/`SIGTERM`
    /// was delivered (any delivery is a shutdown request).
    pub fn drain(&self) -> bool {
        let mut shutdown = false;
        loop {
            let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
            let rc = unsafe {
                libc::read(
                    self.fd,
                    &mut info as *mut libc::signalfd_siginfo as *mut libc::c_void,
                    std::mem::size_of::<libc::signalfd_siginfo>(),
                )
            };
            if rc < 0 {
                if last_errno() == libc::EINTR {
                    continue;
                }
                // EAGAIN: nothing pending.
                return shutdown;
            }
            if rc as usize >= std::mem::size_of::<libc::signalfd_siginfo>() {
                let signo = info.ssi_signo as libc::c_int;
                if SHUTDOWN_SIGNALS.contains(&signo) {
                    shutdown = true;
                }
            }
        }
    }
}

impl Drop for SignalFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
