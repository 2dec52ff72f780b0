//! Chunked slot storage for channels.
//!
//! Channels are constructed once, inside fixed-size chunks, and reused for
//! the life of the pool; a [`ChannelId`] (`chunk`, `slot`) stays valid
//! from `acquire` to `release`, so the reactor never chases reallocating
//! storage between events. Each chunk keeps a LIFO stack of free slot
//! indices (recently used slots are cache-warm), and the pool keeps the
//! indices of non-full chunks for O(1) allocation plus the fd → id map
//! for event dispatch.
//!
//! Misuse is a programming error, not a runtime condition: acquiring a
//! descriptor that is already mapped, releasing an unknown descriptor, or
//! dropping a pool that still has live entries all terminate the process.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use tempo_core::tfatal;

use crate::channel::Channel;
use crate::protocol::Protocol;

/// Channel slots per chunk.
pub const CHUNK_SLOTS: usize = 256;

/// Stable handle to a pooled channel slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId {
    chunk: u32,
    slot: u32,
}

struct Chunk<P: Protocol> {
    slots: Vec<Channel<P>>,
    /// LIFO stack of free slot indices.
    free: Vec<u16>,
}

impl<P: Protocol + Default> Chunk<P> {
    fn new() -> Self {
        Self {
            slots: (0..CHUNK_SLOTS).map(|_| Channel::default()).collect(),
            // Reversed so the first pops hand out slot 0, 1, 2, …
            free: (0..CHUNK_SLOTS as u16).rev().collect(),
        }
    }
}

pub struct ChannelPool<P: Protocol> {
    chunks: Vec<Chunk<P>>,
    /// Indices of chunks with at least one free slot; each appears once.
    open: Vec<u32>,
    /// fd → slot handle for every live channel.
    active: HashMap<RawFd, ChannelId>,
}

impl<P: Protocol + Default> ChannelPool<P> {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            open: Vec::new(),
            active: HashMap::new(),
        }
    }

    /// Claim a slot for `fd`. The slot is in whatever state its previous
    /// tenant left; callers follow up with `attach`.
    pub fn acquire(&mut self, fd: RawFd) -> ChannelId {
        if self.active.contains_key(&fd) {
            tfatal!("duplicate fd {} in channel pool", fd);
        }

        let chunk_idx = match self.open.last() {
            Some(&idx) => idx,
            None => {
                self.chunks.push(Chunk::new());
                let idx = (self.chunks.len() - 1) as u32;
                self.open.push(idx);
                idx
            }
        };

        let chunk = &mut self.chunks[chunk_idx as usize];
        let slot = match chunk.free.pop() {
            Some(slot) => slot,
            None => tfatal!("chunk {} in the open list has no free slot", chunk_idx),
        };
        if chunk.free.is_empty() {
            // The chunk just filled; it was the tail of the open list.
            let popped = self.open.pop();
            debug_assert_eq!(popped, Some(chunk_idx));
        }

        let id = ChannelId {
            chunk: chunk_idx,
            slot: slot as u32,
        };
        self.active.insert(fd, id);
        id
    }

    /// Return `fd`'s slot to its chunk's free stack and drop the mapping.
    pub fn release(&mut self, fd: RawFd) -> ChannelId {
        let id = match self.active.remove(&fd) {
            Some(id) => id,
            None => tfatal!("release of unknown fd {}", fd),
        };
        let chunk = &mut self.chunks[id.chunk as usize];
        let was_full = chunk.free.is_empty();
        chunk.free.push(id.slot as u16);
        if was_full {
            self.open.push(id.chunk);
        }
        id
    }

    /// O(1) average fd → handle lookup.
    #[inline]
    pub fn lookup(&self, fd: RawFd) -> Option<ChannelId> {
        self.active.get(&fd).copied()
    }

    #[inline]
    pub fn get(&self, id: ChannelId) -> &Channel<P> {
        &self.chunks[id.chunk as usize].slots[id.slot as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, id: ChannelId) -> &mut Channel<P> {
        &mut self.chunks[id.chunk as usize].slots[id.slot as usize]
    }

    /// Number of live channels.
    #[inline]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Visit every live channel once. The visitor must not acquire or
    /// release; pool membership is frozen for the duration.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(RawFd, &mut Channel<P>)) {
        for (&fd, &id) in self.active.iter() {
            f(fd, &mut self.chunks[id.chunk as usize].slots[id.slot as usize]);
        }
    }
}

impl<P: Protocol + Default> Default for ChannelPool<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Protocol> Drop for ChannelPool<P> {
    fn drop(&mut self) {
        if !self.active.is_empty() {
            tfatal!("channel pool dropped with {} live entries", self.active.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SocketState;
    use crate::protocol::Echo;

    // Test fds are plain numbers: acquire/attach never touch the kernel.

    #[test]
    fn acquire_attach_release() {
        let mut pool: ChannelPool<Echo> = ChannelPool::new();
        assert!(pool.is_empty());

        let id = pool.acquire(100);
        pool.get_mut(id).attach(100);

        assert_eq!(pool.len(), 1);
        assert_eq!(pool.lookup(100), Some(id));
        assert_eq!(pool.get(id).fd(), 100);
        assert_eq!(pool.get(id).state(), SocketState::Running);

        pool.get_mut(id).detach();
        pool.release(100);
        assert!(pool.is_empty());
        assert_eq!(pool.lookup(100), None);
    }

    #[test]
    fn slot_reuse_is_lifo() {
        let mut pool: ChannelPool<Echo> = ChannelPool::new();

        let a = pool.acquire(1);
        let _b = pool.acquire(2);
        pool.release(1);

        // The freed slot is handed out again first.
        let c = pool.acquire(3);
        assert_eq!(c, a);

        pool.release(2);
        pool.release(3);
    }

    #[test]
    fn ids_stay_valid_across_growth() {
        let mut pool: ChannelPool<Echo> = ChannelPool::new();

        // Span several chunks so the chunk vector grows.
        let n = CHUNK_SLOTS * 2 + 10;
        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let fd = 1000 + i as RawFd;
            let id = pool.acquire(fd);
            pool.get_mut(id).attach(fd);
            ids.push((fd, id));
        }

        for &(fd, id) in &ids {
            assert_eq!(pool.lookup(fd), Some(id));
            assert_eq!(pool.get(id).fd(), fd);
        }

        for &(fd, id) in &ids {
            pool.get_mut(id).detach();
            pool.release(fd);
        }
        assert!(pool.is_empty());
    }

    #[test]
    fn full_chunk_leaves_and_rejoins_open_list() {
        let mut pool: ChannelPool<Echo> = ChannelPool::new();

        for i in 0..CHUNK_SLOTS {
            pool.acquire(i as RawFd);
        }
        assert_eq!(pool.chunks.len(), 1);
        assert!(pool.open.is_empty());

        // Next acquire allocates a second chunk.
        let overflow = pool.acquire(9999);
        assert_eq!(pool.chunks.len(), 2);

        // Releasing from the full chunk puts it back exactly once.
        pool.release(0);
        pool.release(1);
        assert_eq!(pool.open.iter().filter(|&&c| c == 0).count(), 1);

        // And it is preferred for the next allocation.
        let again = pool.acquire(0);
        assert_eq!(again.chunk, 0);

        pool.release(0);
        pool.release(9999);
        let _ = overflow;
        for i in 2..CHUNK_SLOTS {
            pool.release(i as RawFd);
        }
    }

    #[test]
    fn for_each_visits_every_live_channel_once() {
        let mut pool: ChannelPool<Echo> = ChannelPool::new();
        for fd in [5, 6, 7] {
            let id = pool.acquire(fd);
            pool.get_mut(id).attach(fd);
        }

        let mut seen = Vec::new();
        pool.for_each_mut(|fd, ch| {
            assert_eq!(ch.fd(), fd);
            seen.push(fd);
        });
        seen.sort_unstable();
        assert_eq!(seen, vec![5, 6, 7]);

        for fd in [5, 6, 7] {
            pool.get_mut(pool.lookup(fd).unwrap()).detach();
            pool.release(fd);
        }
    }
}
