//! The readiness reactor.
//!
//! Single-threaded: one epoll set multiplexes the listener, a wake-up
//! eventfd, a signalfd carrying `SIGINT`/`SIGTERM`, and every live
//! channel. All channel and pool state is touched only by the thread
//! inside [`Reactor::run`]; other threads use a [`ReactorHandle`], which
//! enqueues an intent on a bounded lock-free queue and kicks the eventfd,
//! never mutating reactor state directly.
//!
//! Channels and the listener are registered edge-triggered (plus
//! `EPOLLRDHUP`), so their handlers drain until the kernel would block.
//! The wake-up and signal descriptors stay level-triggered and are drained
//! unconditionally on every fire.
//!
//! Shutdown: close and unregister the listener, move every channel to
//! Draining, kick the wake-up, and sweep. `run` returns once shutdown is
//! active and the pool is empty; the eventfd guarantees the readiness
//! wait cannot sleep through an off-thread request.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use tempo_core::metrics::{self, StCounterKey, StGaugeKey};
use tempo_core::{tdebug, tfatal, tinfo, twarn};

use crate::error::{errno_name, last_errno, Result};
use crate::poll::{Epoll, Ready};
use crate::pool::{ChannelId, ChannelPool};
use crate::protocol::Protocol;
use crate::signalfd::SignalFd;
use crate::socket::take_soerror;
use crate::wake::WakeFd;

/// Readiness batch size per wait.
const MAX_EVENTS: usize = 256;
/// Pending cross-thread intents. A full queue still wakes the reactor.
const INTENT_QUEUE_DEPTH: usize = 64;
/// How often the reactor folds its own metrics shard.
const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Edge-triggered + peer-hangup bits every channel registration carries.
const ET_FLAGS: u32 = (libc::EPOLLET as u32) | (libc::EPOLLRDHUP as u32);

/// Cross-thread requests to the reactor.
enum Intent {
    Shutdown,
}

/// Clonable handle for talking to a running reactor from other threads.
pub struct ReactorHandle {
    intents: Arc<ArrayQueue<Intent>>,
    wake: Arc<WakeFd>,
}

impl Clone for ReactorHandle {
    fn clone(&self) -> Self {
        Self {
            intents: self.intents.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl ReactorHandle {
    /// Ask the reactor to shut down. Idempotent; safe from any thread.
    pub fn request_shutdown(&self) {
        // A full queue means intents are already pending; the wakeup alone
        // is enough for the reactor to notice them.
        let _ = self.intents.push(Intent::Shutdown);
        self.wake.notify();
    }
}

pub struct Reactor<P: Protocol> {
    epoll: Epoll,
    wake: Arc<WakeFd>,
    sigfd: SignalFd,
    /// Listening descriptor, `-1` before `add_listener` and after shutdown
    /// unregisters it.
    listener: RawFd,
    pool: ChannelPool<P>,
    intents: Arc<ArrayQueue<Intent>>,
    shutdown: bool,
    /// Readiness batch buffer, reused across waits.
    events: Vec<Ready>,
}

impl<P: Protocol + Default> Reactor<P> {
    /// Create the reactor and register its control descriptors. A
    /// readiness set that cannot be created or wired up is a fatal
    /// invariant violation, so construction never fails.
    ///
    /// `SIGINT`/`SIGTERM` must already be blocked
    /// ([`crate::signalfd::block_shutdown_signals`]) or the signalfd will
    /// never see them.
    pub fn new() -> Self {
        let epoll = Epoll::new(MAX_EVENTS);
        let wake = Arc::new(WakeFd::new());
        let sigfd = SignalFd::new();

        // Control descriptors are level-triggered: a drain that races a
        // new arrival just fires again.
        if let Err(e) = epoll.add(wake.fd(), libc::EPOLLIN as u32) {
            tfatal!("cannot register wake-up descriptor: {}", e);
        }
        if let Err(e) = epoll.add(sigfd.fd(), libc::EPOLLIN as u32) {
            tfatal!("cannot register signal descriptor: {}", e);
        }

        Self {
            epoll,
            wake,
            sigfd,
            listener: -1,
            pool: ChannelPool::new(),
            intents: Arc::new(ArrayQueue::new(INTENT_QUEUE_DEPTH)),
            shutdown: false,
            events: Vec::new(),
        }
    }

    /// Register a bound, listening, non-blocking descriptor. The reactor
    /// performs no address resolution or option setting.
    pub fn add_listener(&mut self, fd: RawFd) -> Result<()> {
        if self.listener >= 0 {
            tfatal!("listener already registered (fd {})", self.listener);
        }
        self.epoll.add(fd, (libc::EPOLLIN | libc::EPOLLET) as u32)?;
        self.listener = fd;
        Ok(())
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            intents: self.intents.clone(),
            wake: self.wake.clone(),
        }
    }

    /// Number of live channels.
    pub fn connections(&self) -> usize {
        self.pool.len()
    }

    /// Run until shutdown completes. Readiness-wait failures other than
    /// `EINTR` are programming/system errors and terminate.
    pub fn run(&mut self) {
        tinfo!("reactor running");
        loop {
            if self.shutdown && self.pool.is_empty() {
                tinfo!("reactor drained, exiting");
                return;
            }

            let mut events = std::mem::take(&mut self.events);
            let n = match self.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(e) => tfatal!("readiness wait failed: {}", e),
            };

            for &Ready { fd, mask } in &events[..n] {
                if fd == self.wake.fd() {
                    self.on_wake();
                } else if fd == self.sigfd.fd() {
                    self.on_signal();
                } else if self.listener >= 0 && fd == self.listener {
                    self.on_listener_event();
                } else if let Some(id) = self.pool.lookup(fd) {
                    self.on_channel_event(fd, id, mask);
                } else {
                    tdebug!("event on unknown fd {} (mask {:#x})", fd, mask);
                }
            }
            self.events = events;

            metrics::flush_thread(METRICS_FLUSH_INTERVAL);
        }
    }

    // ── Control descriptors ──────────────────────────────────────

    fn on_wake(&mut self) {
        self.wake.drain();
        while let Some(intent) = self.intents.pop() {
            match intent {
                Intent::Shutdown => self.initiate_shutdown(),
            }
        }
        self.sweep();
    }

    fn on_signal(&mut self) {
        if self.sigfd.drain() {
            tinfo!("shutdown signal received");
            self.initiate_shutdown();
        }
        self.sweep();
    }

    fn initiate_shutdown(&mut self) {
        if self.shutdown {
            return;
        }
        self.shutdown = true;
        tinfo!(
            "shutdown: unregistering listener, draining {} channels",
            self.pool.len()
        );

        if self.listener >= 0 {
            let _ = self.epoll.remove(self.listener);
            unsafe { libc::close(self.listener) };
            self.listener = -1;
        }

        self.pool.for_each_mut(|_fd, ch| ch.begin_shutdown());
        self.wake.notify();
        self.sweep();
    }

    /// Close every channel that became eligible; refresh the interest of
    /// the rest (re-MOD also re-arms edge-triggered readiness that is
    /// already pending, so a Draining channel with staged TX gets its
    /// write event).
    fn sweep(&mut self) {
        let mut to_close = Vec::new();
        let mut to_rearm = Vec::new();
        self.pool.for_each_mut(|fd, ch| {
            if ch.should_close() {
                to_close.push(fd);
            } else {
                to_rearm.push((fd, ch.desired_events()));
            }
        });

        for fd in to_close {
            if let Some(id) = self.pool.lookup(fd) {
                self.close_channel(fd, id);
            }
        }
        for (fd, mask) in to_rearm {
            if let Err(e) = self.epoll.modify(fd, mask | ET_FLAGS) {
                tfatal!("re-arm failed for fd {}: {}", fd, e);
            }
        }
    }

    // ── Channel events ───────────────────────────────────────────

    fn on_channel_event(&mut self, fd: RawFd, id: ChannelId, mask: u32) {
        if mask & libc::EPOLLERR as u32 != 0 {
            // Readiness error: account it and abort, skipping the drain.
            let errno = match take_soerror(fd) {
                0 => libc::EIO,
                e => e,
            };
            self.pool.get_mut(id).fail(errno);
        } else {
            self.pool.get_mut(id).handle_events(mask);
        }

        let (close, desired) = {
            let ch = self.pool.get(id);
            (ch.should_close(), ch.desired_events())
        };
        if close {
            self.close_channel(fd, id);
        } else if let Err(e) = self.epoll.modify(fd, desired | ET_FLAGS) {
            tfatal!("re-arm failed for fd {}: {}", fd, e);
        }
    }

    fn close_channel(&mut self, fd: RawFd, id: ChannelId) {
        let _ = self.epoll.remove(fd);
        let ch = self.pool.get_mut(id);
        ch.notify_close();
        ch.detach();
        self.pool.release(fd);
        unsafe { libc::close(fd) };
        metrics::set_gauge(StGaugeKey::ConnActive, self.pool.len() as u64);
        tdebug!("closed fd {} ({} live)", fd, self.pool.len());
    }

    // ── Acceptor ─────────────────────────────────────────────────

    /// Accept until the listener would block. Resource exhaustion aborts
    /// the burst (back off until the next readiness fire); per-connection
    /// failures skip just that connection.
    fn on_listener_event(&mut self) {
        loop {
            let fd = unsafe {
                libc::accept4(
                    self.listener,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd >= 0 {
                self.register_accepted(fd);
                continue;
            }
            match last_errno() {
                libc::EAGAIN => return,
                libc::EINTR => continue,
                libc::EMFILE => {
                    metrics::inc_counter(StCounterKey::AcceptErrorMfile);
                    twarn!("accept: process fd limit reached, backing off");
                    return;
                }
                libc::ENFILE => {
                    metrics::inc_counter(StCounterKey::AcceptErrorNfile);
                    twarn!("accept: system fd limit reached, backing off");
                    return;
                }
                libc::ENOBUFS => {
                    metrics::inc_counter(StCounterKey::AcceptErrorNobufs);
                    twarn!("accept: out of buffer space, backing off");
                    return;
                }
                libc::ECONNABORTED => {
                    // The peer gave up while queued; next one.
                    metrics::inc_counter(StCounterKey::AcceptErrorOther);
                    continue;
                }
                errno => {
                    metrics::inc_counter(StCounterKey::AcceptErrorOther);
                    twarn!("accept failed: {}", errno_name(errno));
                    return;
                }
            }
        }
    }

    fn register_accepted(&mut self, fd: RawFd) {
        let id = self.pool.acquire(fd);
        let desired = {
            let ch = self.pool.get_mut(id);
            ch.attach(fd);
            ch.desired_events()
        };
        if let Err(e) = self.epoll.add(fd, desired | ET_FLAGS) {
            twarn!("failed to register accepted fd {}: {}", fd, e);
            self.close_channel(fd, id);
            return;
        }
        metrics::set_gauge(StGaugeKey::ConnActive, self.pool.len() as u64);
        tdebug!("accepted fd {} ({} live)", fd, self.pool.len());
    }
}
