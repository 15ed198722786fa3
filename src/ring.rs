//! Fixed-capacity circular byte buffer used for per-connection receive
//! reassembly and send backpressure.
//!
//! A ring is owned by exactly one connection and only touched by the thread
//! that owns that connection, so it carries no synchronization of its own.

use anyhow::{bail, Result};

pub const CACHE_LINE: usize = 64;
pub const MIN_RING_SIZE: usize = 4 * 1024;
pub const MAX_RING_SIZE: usize = 64 * 1024 * 1024;

pub struct Ring {
    data: Box<[u8]>,
    read: usize,
    write: usize,
    len: usize,
}

impl Ring {
    /// Allocate a ring; the hint is rounded up to a cache-line multiple and
    /// clamped to [4KiB, 64MiB].
    pub fn new(capacity_hint: usize) -> Result<Self> {
        let size = Self::real_size(capacity_hint);
        if !(MIN_RING_SIZE..=MAX_RING_SIZE).contains(&size) {
            bail!("ring size {} outside [{}, {}]", size, MIN_RING_SIZE, MAX_RING_SIZE);
        }
        // Zeroed allocation: pages stay uncommitted until the ring first touches them
        let data = vec![0u8; size].into_boxed_slice();
        Ok(Self {
            data,
            read: 0,
            write: 0,
            len: 0,
        })
    }

    fn real_size(hint: usize) -> usize {
        let rounded = hint.saturating_add(CACHE_LINE - 1) / CACHE_LINE * CACHE_LINE;
        rounded.clamp(MIN_RING_SIZE, MAX_RING_SIZE)
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn data_size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space; less than a cache line counts as full
    pub fn free_space(&self) -> usize {
        let free = self.capacity() - self.len;
        if free < CACHE_LINE {
            0
        } else {
            free
        }
    }

    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.len = 0;
    }

    /// Copy all of `src` in or nothing at all. Returns bytes written.
    pub fn write(&mut self, src: &[u8]) -> usize {
        if src.is_empty() || self.free_space() < src.len() {
            return 0;
        }
        let cap = self.capacity();
        let first = (cap - self.write).min(src.len());
        self.data[self.write..self.write + first].copy_from_slice(&src[..first]);
        let rest = src.len() - first;
        if rest > 0 {
            self.data[..rest].copy_from_slice(&src[first..]);
        }
        self.write = (self.write + src.len()) % cap;
        self.len += src.len();
        src.len()
    }

    /// Copy up to `dst.len()` buffered bytes out without consuming them
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        let cap = self.capacity();
        let first = (cap - self.read).min(n);
        dst[..first].copy_from_slice(&self.data[self.read..self.read + first]);
        if n > first {
            dst[first..n].copy_from_slice(&self.data[..n - first]);
        }
        n
    }

    /// Copy out and consume up to `dst.len()` bytes
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.consume(n);
        n
    }

    /// Contiguous readable bytes starting at the read cursor (stops at the wrap)
    pub fn readable_chunk(&self) -> &[u8] {
        let n = (self.capacity() - self.read).min(self.len);
        &self.data[self.read..self.read + n]
    }

    /// Drop `n` bytes from the front
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.read = (self.read + n) % self.capacity();
        self.len -= n;
    }

    /// Move unread bytes to offset zero so the free space is one contiguous run
    pub fn compact(&mut self) {
        if self.len == 0 {
            self.clear();
            return;
        }
        if self.read == 0 {
            return;
        }
        if self.read + self.len <= self.capacity() {
            self.data.copy_within(self.read..self.read + self.len, 0);
        } else {
            // Wrapped: rotate the whole buffer so `read` lands on zero
            self.data.rotate_left(self.read);
        }
        self.read = 0;
        self.write = self.len % self.capacity();
    }

    /// Contiguous writable region after the write cursor. Call `compact` first
    /// to get the largest possible region, then `commit` what was filled.
    pub fn spare_tail_mut(&mut self) -> &mut [u8] {
        let end = if self.len == self.capacity() {
            self.write
        } else if self.write >= self.read {
            self.capacity()
        } else {
            self.read
        };
        &mut self.data[self.write..end]
    }

    /// Account for `n` bytes written directly through `spare_tail_mut`
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.capacity() - self.len);
        self.write = (self.write + n) % self.capacity();
        self.len += n;
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("read", &self.read)
            .field("write", &self.write)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_rounded_and_clamped() {
        assert_eq!(Ring::new(1).unwrap().capacity(), MIN_RING_SIZE);
        assert_eq!(Ring::new(5000).unwrap().capacity(), 5056);
        assert_eq!(Ring::real_size(usize::MAX / 2), MAX_RING_SIZE);
    }

    fn resident_bytes() -> usize {
        let statm = std::fs::read_to_string("/proc/self/statm").unwrap();
        let pages: usize = statm.split_whitespace().nth(1).unwrap().parse().unwrap();
        pages * unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize
    }

    #[test]
    fn idle_rings_do_not_commit_memory() {
        let before = resident_bytes();
        let rings: Vec<Ring> = (0..8).map(|_| Ring::new(MAX_RING_SIZE).unwrap()).collect();
        let grown = resident_bytes().saturating_sub(before);
        assert_eq!(rings[7].capacity(), MAX_RING_SIZE);
        // 8 rings span 512 MiB of address space
        assert!(grown < 64 * 1024 * 1024, "idle rings committed {} bytes", grown);
    }

    #[test]
    fn writes_accumulate_across_wrap() {
        let mut ring = Ring::new(MIN_RING_SIZE).unwrap();
        let cap = ring.capacity();

        // Push the cursors close to the end so the next writes wrap
        let filler = vec![0xAAu8; cap - 100];
        assert_eq!(ring.write(&filler), filler.len());
        ring.consume(filler.len());

        let chunks: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 40 + i as usize]).collect();
        let mut total = 0;
        for c in &chunks {
            assert_eq!(ring.write(c), c.len());
            total += c.len();
            assert_eq!(ring.data_size(), total);
        }

        let mut out = vec![0u8; total];
        assert_eq!(ring.read(&mut out), total);
        let expected: Vec<u8> = chunks.concat();
        assert_eq!(out, expected);
        assert!(ring.is_empty());
    }

    #[test]
    fn write_is_all_or_nothing() {
        let mut ring = Ring::new(MIN_RING_SIZE).unwrap();
        let cap = ring.capacity();
        assert_eq!(ring.write(&vec![1u8; cap - 100]), cap - 100);
        assert_eq!(ring.write(&[2u8; 101]), 0);
        assert_eq!(ring.data_size(), cap - 100);
        // Under one cache line of room counts as full
        assert_eq!(ring.write(&[3u8; 40]), 40);
        assert_eq!(ring.free_space(), 0);
        assert_eq!(ring.write(&[4u8; 1]), 0);
    }

    #[test]
    fn compact_handles_wrapped_data() {
        let mut ring = Ring::new(MIN_RING_SIZE).unwrap();
        let cap = ring.capacity();
        ring.write(&vec![0u8; cap - 10]);
        ring.consume(cap - 10);
        let data: Vec<u8> = (0..30u8).collect();
        ring.write(&data);
        assert!(ring.readable_chunk().len() < data.len());

        ring.compact();
        assert_eq!(ring.readable_chunk(), &data[..]);
        let tail = ring.spare_tail_mut();
        assert_eq!(tail.len(), cap - 30);
        tail[..2].copy_from_slice(&[99, 100]);
        ring.commit(2);
        assert_eq!(ring.data_size(), 32);
        assert_eq!(&ring.readable_chunk()[30..], &[99, 100]);
    }
}
