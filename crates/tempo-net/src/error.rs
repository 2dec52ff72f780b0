//! Networking error types.

use std::fmt;

#[derive(Debug)]
pub enum NetError {
    /// `epoll_ctl` failed.
    EpollCtl(i32),
    /// `epoll_wait` failed with something other than `EINTR`.
    EpollWait(i32),
    /// `pthread_sigmask` failed.
    SigMask(i32),
    /// Listener socket bring-up failed at the named step.
    Listen(&'static str, i32),
    /// OS error with errno.
    Os(i32),
}

impl NetError {
    /// The errno carried by this error.
    pub fn errno(&self) -> i32 {
        match *self {
            Self::EpollCtl(e)
            | Self::EpollWait(e)
            | Self::SigMask(e)
            | Self::Listen(_, e)
            | Self::Os(e) => e,
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EpollCtl(e) => write!(f, "epoll_ctl: {}", errno_name(*e)),
            Self::EpollWait(e) => write!(f, "epoll_wait: {}", errno_name(*e)),
            Self::SigMask(e) => write!(f, "pthread_sigmask: {}", errno_name(*e)),
            Self::Listen(step, e) => write!(f, "listener {}: {}", step, errno_name(*e)),
            Self::Os(e) => write!(f, "OS error: {}", errno_name(*e)),
        }
    }
}

impl std::error::Error for NetError {}

pub type Result<T> = std::result::Result<T, NetError>;

/// Current thread's errno.
#[inline]
pub fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Symbolic name for the errnos this core handles, for log lines.
/// Anything unrecognized renders as `errno(<n>)`.
pub fn errno_name(errno: i32) -> std::borrow::Cow<'static, str> {
    let name = match errno {
        libc::EAGAIN => "EAGAIN",
        libc::EINTR => "EINTR",
        libc::EBADF => "EBADF",
        libc::EINVAL => "EINVAL",
        libc::EMFILE => "EMFILE",
        libc::ENFILE => "ENFILE",
        libc::ENOBUFS => "ENOBUFS",
        libc::ENOMEM => "ENOMEM",
        libc::EPIPE => "EPIPE",
        libc::ECONNRESET => "ECONNRESET",
        libc::ECONNABORTED => "ECONNABORTED",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::ETIMEDOUT => "ETIMEDOUT",
        libc::ENETDOWN => "ENETDOWN",
        libc::ENETUNREACH => "ENETUNREACH",
        libc::EHOSTUNREACH => "EHOSTUNREACH",
        libc::ENOTCONN => "ENOTCONN",
        libc::EADDRINUSE => "EADDRINUSE",
        libc::EADDRNOTAVAIL => "EADDRNOTAVAIL",
        libc::EACCES => "EACCES",
        libc::EEXIST => "EEXIST",
        libc::ENOENT => "ENOENT",
        _ => return std::borrow::Cow::Owned(format!("errno({})", errno)),
    };
    std::borrow::Cow::Borrowed(name)
}
