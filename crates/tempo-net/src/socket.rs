//! Listener bring-up and small socket helpers.
//!
//! The reactor takes a bound, listening, non-blocking descriptor as input;
//! producing one is the caller's job and lives here. Name resolution is
//! deliberately absent: the bind address is a parsed `Ipv4Addr`.

use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use crate::error::{last_errno, NetError, Result};

/// Create a bound, listening TCP socket on `addr:port`, non-blocking and
/// close-on-exec, with `SO_REUSEADDR`. Returns the raw descriptor; the
/// caller owns it.
pub fn bind_listener(addr: Ipv4Addr, port: u16, backlog: i32) -> Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(NetError::Listen("socket", last_errno()));
    }

    let opt: i32 = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let errno = last_errno();
        unsafe { libc::close(fd) };
        return Err(NetError::Listen("setsockopt", errno));
    }

    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_addr.s_addr = u32::from(addr).to_be();
    sa.sin_port = port.to_be();

    let rc = unsafe {
        libc::bind(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let errno = last_errno();
        unsafe { libc::close(fd) };
        return Err(NetError::Listen("bind", errno));
    }

    let rc = unsafe { libc::listen(fd, backlog) };
    if rc != 0 {
        let errno = last_errno();
        unsafe { libc::close(fd) };
        return Err(NetError::Listen("listen", errno));
    }

    Ok(fd)
}

/// Switch an existing descriptor to non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(NetError::Os(last_errno()));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(NetError::Os(last_errno()));
    }
    Ok(())
}

/// The port a socket is actually bound to (port-0 binds in tests).
pub fn local_port(fd: RawFd) -> Result<u16> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(NetError::Os(last_errno()));
    }
    Ok(u16::from_be(sa.sin_port))
}

/// Retrieve and clear the socket's pending error (`SO_ERROR`).
/// Returns 0 when the socket carries none.
pub fn take_soerror(fd: RawFd) -> i32 {
    let mut err: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return last_errno();
    }
    err
}
