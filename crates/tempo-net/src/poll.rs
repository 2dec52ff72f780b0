//! RAII wrapper over the epoll readiness set.
//!
//! Events carry the registered descriptor as their token (`u64` payload),
//! which is how the reactor routes a readiness batch. `wait` retries
//! `EINTR` internally; every other failure is surfaced, and the reactor
//! treats it as fatal.

use std::os::unix::io::RawFd;

use tempo_core::tfatal;

use crate::error::{errno_name, last_errno, NetError, Result};

/// One readiness event: the descriptor it fired for and the event mask.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub fd: RawFd,
    pub mask: u32,
}

pub struct Epoll {
    fd: RawFd,
    /// Kernel-filled event buffer, reused across waits.
    raw: Vec<libc::epoll_event>,
}

impl Epoll {
    /// Create the readiness set. Failure to create one is a fatal
    /// invariant violation, not a runtime condition.
    pub fn new(max_events: usize) -> Self {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            tfatal!("epoll_create1 failed: {}", errno_name(last_errno()));
        }
        Self {
            fd,
            raw: Vec::with_capacity(max_events.max(1)),
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(NetError::EpollCtl(last_errno()));
        }
        Ok(())
    }

    /// Register `fd` with the given event mask.
    pub fn add(&self, fd: RawFd, mask: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
    }

    /// Replace the event mask of an already registered `fd`.
    pub fn modify(&self, fd: RawFd, mask: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
    }

    /// Unregister `fd`. Unregistering a descriptor that is not in the set
    /// is tolerated (close paths can race kernel-side auto-removal).
    pub fn remove(&self, fd: RawFd) -> Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc != 0 {
            let errno = last_errno();
            if errno == libc::ENOENT || errno == libc::EBADF {
                return Ok(());
            }
            return Err(NetError::EpollCtl(errno));
        }
        Ok(())
    }

    /// Wait for readiness, filling `out` with at most the buffer's
    /// capacity worth of events. Returns the event count. `EINTR`
    /// retries; `timeout_ms < 0` blocks indefinitely.
    pub fn wait(&mut self, out: &mut Vec<Ready>, timeout_ms: i32) -> Result<usize> {
        let cap = self.raw.capacity();
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(self.fd, self.raw.as_mut_ptr(), cap as libc::c_int, timeout_ms)
            };
            if rc >= 0 {
                break rc as usize;
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            return Err(NetError::EpollWait(errno));
        };
        // Safety: the kernel initialized the first `n` entries.
        unsafe { self.raw.set_len(n) };

        out.clear();
        out.extend(self.raw.iter().map(|ev| Ready {
            fd: ev.u64 as RawFd,
            mask: ev.events,
        }));
        Ok(n)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_wait_remove() {
        let mut ep = Epoll::new(8);

        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let (a, b) = (fds[0], fds[1]);

        ep.add(a, (libc::EPOLLIN as u32) | (libc::EPOLLET as u32)).unwrap();

        // Nothing readable yet.
        let mut ready = Vec::new();
        assert_eq!(ep.wait(&mut ready, 0).unwrap(), 0);

        let msg = b"x";
        unsafe { libc::write(b, msg.as_ptr() as *const libc::c_void, 1) };

        assert_eq!(ep.wait(&mut ready, 1000).unwrap(), 1);
        assert_eq!(ready[0].fd, a);
        assert_ne!(ready[0].mask & libc::EPOLLIN as u32, 0);

        ep.remove(a).unwrap();
        // Removing twice is tolerated.
        ep.remove(a).unwrap();

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
