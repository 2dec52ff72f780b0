//! Protocol plug-in surface.
//!
//! A protocol lives inside a channel slot for the slot's lifetime and is
//! driven between `attach` and `detach` through three hooks. Hooks must
//! return promptly (the reactor thread runs every channel) and are
//! expected to return normally; a panicking hook takes the process down
//! as an invariant violation.

use crate::channel::ChannelIo;

/// The capability set a user protocol implements.
///
/// Hooks receive a [`ChannelIo`] exposing only the RX view
/// (`rx_span`/`rx_consume`) and `tx_send`. A `Partial` send result means
/// the TX buffer is full: stop producing and wait for the next `on_read`.
pub trait Protocol {
    /// RX bytes are available. Invoked once per drain iteration.
    fn on_read(&mut self, io: &mut ChannelIo<'_>);

    /// The transport failed (`errno` is the raw OS error). The channel is
    /// already Aborting; queued TX will never be sent.
    fn on_error(&mut self, io: &mut ChannelIo<'_>, errno: i32) {
        let _ = (io, errno);
    }

    /// Terminal disposal: the channel is about to be detached and its
    /// descriptor closed.
    fn on_close(&mut self, io: &mut ChannelIo<'_>) {
        let _ = io;
    }
}

/// Echo: send back whatever arrives.
///
/// The placeholder protocol `tempod` serves while the storage engine does
/// not exist; also the protocol the loopback tests run.
#[derive(Default)]
pub struct Echo {
    scratch: Vec<u8>,
}

impl Protocol for Echo {
    fn on_read(&mut self, io: &mut ChannelIo<'_>) {
        self.scratch.clear();
        self.scratch.extend_from_slice(io.rx_span());
        let (sent, _result) = io.tx_send(&self.scratch);
        // Consume exactly what was queued; the rest stays in RX until TX
        // drains and the next iteration retries.
        io.rx_consume(sent);
    }
}
