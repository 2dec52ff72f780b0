//! Fixed-capacity byte FIFO.
//!
//! `FixedBuf<N>` is the receive/transmit buffer of a connection: a
//! contiguous region where the readable bytes always live at offsets
//! `[0, used)`. Producers either copy in with [`FixedBuf::write`] or borrow
//! a [`FixedBuf::writable_span`] and [`FixedBuf::commit`] what they filled;
//! consumers mirror that with [`FixedBuf::read`] or
//! [`FixedBuf::readable_span`] + [`FixedBuf::consume`]. The span pairs are
//! what lets `recv(2)`/`send(2)` run without an intermediate copy.
//!
//! `consume` compacts the leftover bytes back to offset 0 with a block
//! move, so the readable region never wraps.

/// Fixed-capacity contiguous byte FIFO.
///
/// Invariants: `0 <= used <= N`, `free == N - used`, readable bytes are
/// contiguous at `[0, used)`.
pub struct FixedBuf<const N: usize> {
    data: [u8; N],
    used: usize,
}

impl<const N: usize> FixedBuf<N> {
    pub const fn new() -> Self {
        Self { data: [0u8; N], used: 0 }
    }

    /// Total capacity in bytes.
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Bytes currently readable.
    #[inline]
    pub const fn used_space(&self) -> usize {
        self.used
    }

    /// Bytes currently writable.
    #[inline]
    pub const fn free_space(&self) -> usize {
        N - self.used
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[inline]
    pub const fn is_full(&self) -> bool {
        self.used == N
    }

    /// Copy in as much of `src` as fits. Returns the number of bytes
    /// written (`min(src.len(), free_space())`). Never reallocates.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.free_space());
        self.data[self.used..self.used + n].copy_from_slice(&src[..n]);
        self.used += n;
        n
    }

    /// Copy out as much as `dst` holds, then consume it. Returns the
    /// number of bytes read (`min(dst.len(), used_space())`).
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.used);
        dst[..n].copy_from_slice(&self.data[..n]);
        self.consume(n);
        n
    }

    /// Borrow up to `max` writable bytes at the write cursor.
    ///
    /// Pair with exactly one [`commit`](Self::commit) before the next
    /// producer call; the span length is `min(max, free_space())`.
    pub fn writable_span(&mut self, max: usize) -> &mut [u8] {
        let n = max.min(self.free_space());
        &mut self.data[self.used..self.used + n]
    }

    /// Mark `n` bytes of the last writable span as filled.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.free_space(), "commit past free space");
        self.used += n.min(self.free_space());
    }

    /// Borrow up to `max` readable bytes at offset 0.
    ///
    /// May be consumed in full, in part, or not at all.
    pub fn readable_span(&self, max: usize) -> &[u8] {
        &self.data[..max.min(self.used)]
    }

    /// Discard the first `n` readable bytes, compacting the remainder to
    /// offset 0. `n == 0` is a no-op; `n > used_space()` clears the buffer.
    pub fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let n = n.min(self.used);
        self.data.copy_within(n..self.used, 0);
        self.used -= n;
    }

    /// Drop all buffered bytes.
    #[inline]
    pub fn clear(&mut self) {
        self.used = 0;
    }
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}
