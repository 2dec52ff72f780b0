//! Wake-up descriptor for the reactor.
//!
//! A non-blocking eventfd. Writes from other threads wake the reactor out
//! of its readiness wait; multiple notifies before the reactor drains the
//! counter coalesce into a single wakeup (eventfd counter semantics).

use std::os::unix::io::RawFd;

use tempo_core::tfatal;

use crate::error::{errno_name, last_errno};

pub struct WakeFd {
    fd: RawFd,
}

impl WakeFd {
    /// Create the wake-up descriptor. Failure here is a fatal invariant
    /// violation: the reactor cannot run without one.
    pub fn new() -> Self {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            tfatal!("eventfd failed: {}", errno_name(last_errno()));
        }
        Self { fd }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Wake the reactor. Callable from any thread.
    pub fn notify(&self) {
        let val: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated; a wakeup is already
        // pending.
        if rc < 0 {
            let errno = last_errno();
            if errno != libc::EAGAIN {
                tempo_core::twarn!("eventfd write failed: {}", errno_name(errno));
            }
        }
    }

    /// Read the counter down to zero. Called on every readiness fire of
    /// the wake descriptor.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        loop {
            let rc = unsafe {
                libc::read(
                    self.fd,
                    &mut val as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if rc < 0 {
                // EAGAIN: counter already zero. EINTR: retry.
                if last_errno() == libc::EINTR {
                    continue;
                }
                return;
            }
            // One successful read zeroes the counter.
            return;
        }
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
