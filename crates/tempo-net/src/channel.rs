//! Per-connection channel: state machine, bounded buffers, drain policy.
//!
//! A channel owns one socket descriptor, a bounded RX and TX buffer, and
//! the protocol instance plugged into it. The reactor delivers readiness
//! masks; the channel converts them into `recv`/`send` bursts and protocol
//! hook invocations.
//!
//! Edge-triggered readiness reports each transition once, so the channel
//! must drain: it keeps pulling until the socket would block, the RX
//! buffer is full, or the peer half-closed; it then hands buffered bytes
//! to the protocol and flushes whatever the protocol staged. The loop
//! stops only when an iteration makes no forward progress (neither bytes
//! received nor RX consumed), which bounds the work per readiness fire
//! even against a protocol that consumes slowly.

use std::os::unix::io::RawFd;

use tempo_core::metrics::{self, StCounterKey};
use tempo_core::twarn;

use crate::error::{errno_name, last_errno};
use crate::protocol::Protocol;
use tempo_core::buffer::FixedBuf;

/// Receive buffer capacity per connection.
pub const RX_CAPACITY: usize = 4096;
/// Transmit buffer capacity per connection.
pub const TX_CAPACITY: usize = 4096;

/// Readiness bits that mean "try reading" (peer hangup surfaces as EOF
/// through `recv`).
const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP) as u32;
const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;

/// Socket lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SocketState {
    /// No descriptor attached; the slot is idle in its pool chunk.
    #[default]
    Closed = 0,
    /// Normal duplex operation.
    Running = 1,
    /// No more reads (peer EOF or shutdown request); TX still flushing.
    Draining = 2,
    /// Unrecoverable transport failure; close at the next opportunity.
    Aborting = 3,
}

/// Outcome of [`ChannelIo::tx_send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Every byte was queued.
    Full,
    /// The TX buffer filled before every byte was queued; back off.
    Partial,
    /// The channel is not accepting new bytes (Closed or Aborting);
    /// nothing was queued.
    Rejected,
}

/// The restricted channel view handed to protocol hooks.
pub struct ChannelIo<'a> {
    state: SocketState,
    rx: &'a mut FixedBuf<RX_CAPACITY>,
    tx: &'a mut FixedBuf<TX_CAPACITY>,
}

impl ChannelIo<'_> {
    /// All currently buffered RX bytes.
    pub fn rx_span(&self) -> &[u8] {
        self.rx.readable_span(RX_CAPACITY)
    }

    /// Discard the first `n` RX bytes.
    pub fn rx_consume(&mut self, n: usize) {
        self.rx.consume(n);
    }

    /// Queue bytes for transmission. Returns how many were queued and
    /// whether that was all of them ([`SendResult::Partial`] is the
    /// signal to stop producing until TX drains).
    pub fn tx_send(&mut self, bytes: &[u8]) -> (usize, SendResult) {
        if matches!(self.state, SocketState::Closed | SocketState::Aborting) {
            return (0, SendResult::Rejected);
        }
        let n = self.tx.write(bytes);
        let result = if n == bytes.len() {
            SendResult::Full
        } else {
            SendResult::Partial
        };
        (n, result)
    }
}

/// One logical connection: descriptor, state, RX/TX, protocol instance.
pub struct Channel<P: Protocol> {
    fd: RawFd,
    state: SocketState,
    /// Last readiness mask delivered by the reactor.
    events: u32,
    rx: FixedBuf<RX_CAPACITY>,
    tx: FixedBuf<TX_CAPACITY>,
    proto: P,
}

impl<P: Protocol + Default> Default for Channel<P> {
    fn default() -> Self {
        Self {
            fd: -1,
            state: SocketState::Closed,
            events: 0,
            rx: FixedBuf::new(),
            tx: FixedBuf::new(),
            proto: P::default(),
        }
    }
}

impl<P: Protocol> Channel<P> {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Take ownership of a connected descriptor and start running.
    pub fn attach(&mut self, fd: RawFd) {
        debug_assert_eq!(self.state, SocketState::Closed, "attach on live channel");
        self.fd = fd;
        self.state = SocketState::Running;
        self.events = 0;
        self.rx.clear();
        self.tx.clear();
    }

    /// Return to the idle state. Does not close the descriptor; the
    /// reactor's close path owns that step.
    pub fn detach(&mut self) {
        self.fd = -1;
        self.state = SocketState::Closed;
        self.events = 0;
        self.rx.clear();
        self.tx.clear();
    }

    /// Stop reading and drain: Running becomes Draining. The read side is
    /// half-closed at the kernel level so the peer's further bytes are
    /// discarded rather than buffered.
    pub fn begin_shutdown(&mut self) {
        if self.state == SocketState::Running {
            if self.fd >= 0 {
                unsafe { libc::shutdown(self.fd, libc::SHUT_RD) };
            }
            self.state = SocketState::Draining;
        }
    }

    /// Whether the reactor should run the close path now.
    #[inline]
    pub fn should_close(&self) -> bool {
        match self.state {
            SocketState::Aborting => true,
            SocketState::Draining => self.tx.is_empty(),
            SocketState::Running | SocketState::Closed => false,
        }
    }

    /// Readiness interest, derived from current state and buffer fill.
    /// Never stored: the reactor asks whenever it re-arms the descriptor.
    pub fn desired_events(&self) -> u32 {
        let mut mask = 0u32;
        if self.state == SocketState::Running && !self.rx.is_full() {
            mask |= libc::EPOLLIN as u32;
        }
        if matches!(self.state, SocketState::Running | SocketState::Draining) && !self.tx.is_empty()
        {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }

    /// Run the drain policy for a readiness mask. A write-only wakeup
    /// runs the TX flush alone.
    pub fn handle_events(&mut self, mask: u32) {
        self.events = mask;
        if mask & READ_EVENTS != 0 {
            self.drain();
        } else if mask & WRITE_EVENTS != 0 {
            self.flush_tx();
        }
    }

    /// Readiness-error entry point: account the pending socket error,
    /// abort, and fire the protocol's error hook.
    pub fn fail(&mut self, errno: i32) {
        self.abort_with(errno);
    }

    /// Final protocol notification before the slot is detached.
    pub fn notify_close(&mut self) {
        let (mut io, proto) = self.split();
        proto.on_close(&mut io);
    }

    // ── Drain policy ─────────────────────────────────────────────

    fn drain(&mut self) {
        if self.state == SocketState::Aborting {
            return;
        }
        loop {
            let received = self.pull_rx();

            let consumed = if self.rx.is_empty() { 0 } else { self.fire_on_read() };

            if !self.tx.is_empty()
                && matches!(self.state, SocketState::Running | SocketState::Draining)
            {
                self.flush_tx();
            }

            if self.state == SocketState::Aborting {
                break;
            }
            // No forward progress: nothing read, nothing consumed.
            if received == 0 && consumed == 0 {
                break;
            }
        }
    }

    /// `recv` until the socket would block, RX fills, or the peer ends
    /// the stream. Returns bytes pulled this burst.
    fn pull_rx(&mut self) -> usize {
        let fd = self.fd;
        let mut total = 0usize;
        while self.state == SocketState::Running && !self.rx.is_full() {
            let span = self.rx.writable_span(RX_CAPACITY);
            let rc =
                unsafe { libc::recv(fd, span.as_mut_ptr() as *mut libc::c_void, span.len(), 0) };
            if rc > 0 {
                let n = rc as usize;
                self.rx.commit(n);
                total += n;
                metrics::add_counter(StCounterKey::BytesReceived, n as u64);
                continue;
            }
            if rc == 0 {
                // Peer EOF.
                self.state = SocketState::Draining;
                break;
            }
            match last_errno() {
                libc::EINTR => continue,
                libc::EAGAIN => break,
                errno => {
                    self.abort_with(errno);
                    break;
                }
            }
        }
        total
    }

    /// `send` until the socket would block or TX empties.
    fn flush_tx(&mut self) {
        let fd = self.fd;
        while !self.tx.is_empty()
            && matches!(self.state, SocketState::Running | SocketState::Draining)
        {
            let span = self.tx.readable_span(TX_CAPACITY);
            let rc = unsafe {
                libc::send(
                    fd,
                    span.as_ptr() as *const libc::c_void,
                    span.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if rc > 0 {
                let n = rc as usize;
                self.tx.consume(n);
                metrics::add_counter(StCounterKey::BytesSent, n as u64);
                continue;
            }
            if rc == 0 {
                break;
            }
            match last_errno() {
                libc::EINTR => continue,
                libc::EAGAIN => break,
                errno => {
                    self.abort_with(errno);
                    break;
                }
            }
        }
    }

    /// One `on_read` invocation; returns how many RX bytes the protocol
    /// consumed.
    fn fire_on_read(&mut self) -> usize {
        let used_before = self.rx.used_space();
        let (mut io, proto) = self.split();
        proto.on_read(&mut io);
        used_before - self.rx.used_space()
    }

    fn abort_with(&mut self, errno: i32) {
        twarn!("socket error on fd {}: {}", self.fd, errno_name(errno));
        record_socket_error(errno);
        if self.fd >= 0 {
            unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
        }
        self.state = SocketState::Aborting;
        let (mut io, proto) = self.split();
        proto.on_error(&mut io, errno);
    }

    fn split(&mut self) -> (ChannelIo<'_>, &mut P) {
        (
            ChannelIo {
                state: self.state,
                rx: &mut self.rx,
                tx: &mut self.tx,
            },
            &mut self.proto,
        )
    }

    #[cfg(test)]
    pub(crate) fn proto(&self) -> &P {
        &self.proto
    }
}

/// Bump the socket-error counters for a transport failure.
pub(crate) fn record_socket_error(errno: i32) {
    metrics::inc_counter(StCounterKey::SocketErrorTotal);
    let key = match errno {
        libc::ECONNRESET => StCounterKey::SocketErrorConnReset,
        libc::ETIMEDOUT => StCounterKey::SocketErrorTimedOut,
        libc::EPIPE => StCounterKey::SocketErrorPipe,
        libc::ENETDOWN => StCounterKey::SocketErrorNetDown,
        _ => StCounterKey::SocketErrorOther,
    };
    metrics::inc_counter(key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Echo;

    /// Protocol that records hook invocations and consumes on request.
    #[derive(Default)]
    struct Recorder {
        reads: usize,
        errors: Vec<i32>,
        closed: bool,
        /// Bytes to consume per on_read (0 = consume nothing).
        consume_per_read: usize,
    }

    impl Protocol for Recorder {
        fn on_read(&mut self, io: &mut ChannelIo<'_>) {
            self.reads += 1;
            let n = self.consume_per_read.min(io.rx_span().len());
            io.rx_consume(n);
        }

        fn on_error(&mut self, _io: &mut ChannelIo<'_>, errno: i32) {
            self.errors.push(errno);
        }

        fn on_close(&mut self, _io: &mut ChannelIo<'_>) {
            self.closed = true;
        }
    }

    fn nonblocking_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0, "socketpair failed");
        (fds[0], fds[1])
    }

    fn write_peer(fd: RawFd, bytes: &[u8]) {
        let rc = unsafe { libc::send(fd, bytes.as_ptr() as *const libc::c_void, bytes.len(), 0) };
        assert_eq!(rc, bytes.len() as isize);
    }

    fn read_peer(fd: RawFd, max: usize) -> Vec<u8> {
        let mut buf = vec![0u8; max];
        let rc = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, max, 0) };
        if rc <= 0 {
            return Vec::new();
        }
        buf.truncate(rc as usize);
        buf
    }

    fn close_fd(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn attach_detach_lifecycle() {
        let (a, b) = nonblocking_pair();
        let mut ch: Channel<Echo> = Channel::default();

        assert_eq!(ch.state(), SocketState::Closed);
        assert_eq!(ch.fd(), -1);
        assert_eq!(ch.desired_events(), 0);

        ch.attach(a);
        assert_eq!(ch.state(), SocketState::Running);
        assert_eq!(ch.fd(), a);
        assert_eq!(ch.desired_events(), libc::EPOLLIN as u32);
        assert!(!ch.should_close());

        ch.detach();
        assert_eq!(ch.state(), SocketState::Closed);
        assert_eq!(ch.fd(), -1);

        close_fd(a);
        close_fd(b);
    }

    #[test]
    fn readiness_interest_is_derived() {
        let (a, b) = nonblocking_pair();
        let mut ch: Channel<Recorder> = Channel::default();
        ch.attach(a);

        // Running + RX space: read interest only.
        assert_eq!(ch.desired_events(), libc::EPOLLIN as u32);

        // Staged TX adds write interest.
        ch.tx.write(b"pending");
        assert_eq!(
            ch.desired_events(),
            (libc::EPOLLIN | libc::EPOLLOUT) as u32
        );

        // Full RX drops read interest.
        let free = ch.rx.free_space();
        ch.rx.write(&vec![0u8; free]);
        assert_eq!(ch.desired_events(), libc::EPOLLOUT as u32);

        // Draining never reads; writes only while TX is non-empty.
        ch.state = SocketState::Draining;
        assert_eq!(ch.desired_events(), libc::EPOLLOUT as u32);
        ch.tx.clear();
        assert_eq!(ch.desired_events(), 0);

        close_fd(a);
        close_fd(b);
    }

    #[test]
    fn close_eligibility() {
        let mut ch: Channel<Recorder> = Channel::default();
        assert!(!ch.should_close());

        ch.state = SocketState::Running;
        assert!(!ch.should_close());

        ch.state = SocketState::Draining;
        assert!(ch.should_close());
        ch.tx.write(b"x");
        assert!(!ch.should_close());

        ch.state = SocketState::Aborting;
        assert!(ch.should_close());
    }

    #[test]
    fn echo_roundtrip_over_socketpair() {
        let (a, b) = nonblocking_pair();
        let mut ch: Channel<Echo> = Channel::default();
        ch.attach(a);

        write_peer(b, b"ping");
        ch.handle_events(libc::EPOLLIN as u32);

        assert_eq!(read_peer(b, 64), b"ping");
        assert_eq!(ch.state(), SocketState::Running);
        assert!(ch.tx.is_empty());
        assert!(ch.rx.is_empty());

        close_fd(a);
        close_fd(b);
    }

    #[test]
    fn peer_eof_transitions_to_draining() {
        let (a, b) = nonblocking_pair();
        let mut ch: Channel<Echo> = Channel::default();
        ch.attach(a);

        write_peer(b, b"bye");
        unsafe { libc::shutdown(b, libc::SHUT_WR) };

        ch.handle_events(libc::EPOLLIN as u32);

        // Buffered bytes were still echoed before the EOF took effect.
        assert_eq!(read_peer(b, 64), b"bye");
        assert_eq!(ch.state(), SocketState::Draining);
        assert!(ch.should_close());

        close_fd(a);
        close_fd(b);
    }

    #[test]
    fn slow_protocol_does_not_livelock() {
        let (a, b) = nonblocking_pair();
        let mut ch: Channel<Recorder> = Channel::default();
        ch.proto.consume_per_read = 0; // consumes nothing, ever
        ch.attach(a);

        write_peer(b, b"stubborn");
        ch.handle_events(libc::EPOLLIN as u32);

        // One no-progress iteration ends the drain; bytes stay buffered.
        assert_eq!(ch.rx.used_space(), 8);
        assert!(ch.proto().reads >= 1);
        assert_eq!(ch.state(), SocketState::Running);

        close_fd(a);
        close_fd(b);
    }

    #[test]
    fn tx_send_contract() {
        let (a, b) = nonblocking_pair();
        let mut ch: Channel<Recorder> = Channel::default();
        ch.attach(a);

        {
            let (mut io, _) = ch.split();
            let (n, res) = io.tx_send(b"abc");
            assert_eq!((n, res), (3, SendResult::Full));

            // Fill the rest of TX; overflow reports Partial.
            let big = vec![b'x'; TX_CAPACITY];
            let (n, res) = io.tx_send(&big);
            assert_eq!(n, TX_CAPACITY - 3);
            assert_eq!(res, SendResult::Partial);

            let (n, res) = io.tx_send(b"y");
            assert_eq!((n, res), (0, SendResult::Partial));
        }

        // Aborting channels reject without touching the buffer.
        ch.state = SocketState::Aborting;
        let used = ch.tx.used_space();
        {
            let (mut io, _) = ch.split();
            let (n, res) = io.tx_send(b"z");
            assert_eq!((n, res), (0, SendResult::Rejected));
        }
        assert_eq!(ch.tx.used_space(), used);

        close_fd(a);
        close_fd(b);
    }

    #[test]
    fn begin_shutdown_drains_then_closes() {
        let (a, b) = nonblocking_pair();
        let mut ch: Channel<Echo> = Channel::default();
        ch.attach(a);

        ch.tx.write(b"tail");
        ch.begin_shutdown();
        assert_eq!(ch.state(), SocketState::Draining);
        assert!(!ch.should_close());

        ch.handle_events(libc::EPOLLOUT as u32);
        assert_eq!(read_peer(b, 64), b"tail");
        assert!(ch.should_close());

        // Idempotent: a second call does not regress the state.
        ch.begin_shutdown();
        assert_eq!(ch.state(), SocketState::Draining);

        close_fd(a);
        close_fd(b);
    }

    #[test]
    fn hard_error_fires_on_error_and_aborts() {
        let (a, b) = nonblocking_pair();
        let mut ch: Channel<Recorder> = Channel::default();
        ch.attach(a);

        ch.fail(libc::ECONNRESET);

        assert_eq!(ch.state(), SocketState::Aborting);
        assert_eq!(ch.proto().errors, vec![libc::ECONNRESET]);
        assert!(ch.should_close());

        ch.notify_close();
        assert!(ch.proto().closed);

        close_fd(a);
        close_fd(b);
    }

    #[test]
    fn rx_backpressure_stops_pulling() {
        let (a, b) = nonblocking_pair();
        let mut ch: Channel<Recorder> = Channel::default();
        ch.proto.consume_per_read = 0;
        ch.attach(a);

        // More than RX capacity on the wire.
        let payload = vec![b'q'; RX_CAPACITY + 512];
        let rc = unsafe {
            libc::send(
                b,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
                0,
            )
        };
        assert!(rc > 0);

        ch.handle_events(libc::EPOLLIN as u32);

        // RX filled, read interest dropped, remainder left in the kernel.
        assert!(ch.rx.is_full());
        assert_eq!(ch.desired_events() & libc::EPOLLIN as u32, 0);

        close_fd(a);
        close_fd(b);
    }
}
