//! # tempo-net — the non-blocking TCP I/O core
//!
//! A single-threaded, edge-triggered readiness reactor and its per-
//! connection machinery:
//!
//! - [`reactor`]: the epoll loop: acceptor dispatch, wake-up and signal
//!   descriptors, shutdown orchestration.
//! - [`channel`]: the per-connection state machine with bounded RX/TX
//!   buffers and the edge-triggered drain policy.
//! - [`pool`]: chunked slot storage for channels, addressed by stable
//!   `(chunk, slot)` ids and indexed by socket descriptor.
//! - [`protocol`]: the plug-in surface (`on_read` / `on_error` /
//!   `on_close`) user protocols implement, plus the built-in [`Echo`]
//!   protocol.
//! - [`poll`] / [`wake`] / [`signalfd`]: thin RAII wrappers over the
//!   kernel descriptors the reactor owns.
//! - [`socket`]: listener bring-up and small socket helpers.
//!
//! The reactor thread owns every channel and the pool; other threads talk
//! to it only through [`ReactorHandle`] (an intent queue plus an eventfd
//! kick) and through the metrics subsystem, which is safe from any thread.
//!
//! ```ignore
//! tempo_net::signalfd::block_shutdown_signals()?;
//! let listener = tempo_net::socket::bind_listener("0.0.0.0".parse()?, 7070, 1024)?;
//! let mut reactor: Reactor<Echo> = Reactor::new();
//! reactor.add_listener(listener)?;
//! reactor.run();
//! ```

pub mod channel;
pub mod error;
pub mod poll;
pub mod pool;
pub mod protocol;
pub mod reactor;
pub mod signalfd;
pub mod socket;
pub mod wake;

pub use channel::{Channel, ChannelIo, SendResult, SocketState};
pub use error::{NetError, Result};
pub use pool::{ChannelId, ChannelPool};
pub use protocol::{Echo, Protocol};
pub use reactor::{Reactor, ReactorHandle};
