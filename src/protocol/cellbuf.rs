//! Pooled cell buffers
//!
//! Relay traffic churns through an enormous number of short-lived 514-byte
//! buffers. Recycling them through a bounded pool keeps memory usage
//! predictable under load. `CellBuf` is an RAII guard: dropping one returns
//! its storage to the process-wide pool, provided the capacity is still
//! exactly [`MAX_CELL_SIZE`] (variable-length cells that outgrew the pool
//! size are simply freed).

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Size of a fixed v4 cell, and of every pooled buffer.
pub const MAX_CELL_SIZE: usize = 514;

/// Upper bound on pooled buffers before release starts dropping them.
const POOL_CAP: usize = 100_000;

/// Buffers preallocated by [`seed_pool`].
const SEED_COUNT: usize = 1000;

struct Pool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

static POOL: Pool = Pool {
    bufs: Mutex::new(Vec::new()),
};

impl Pool {
    fn seed(&self) {
        let mut pool = self.bufs.lock().expect("cell pool poisoned");
        while pool.len() < SEED_COUNT {
            pool.push(vec![0u8; MAX_CELL_SIZE]);
        }
    }

    fn get(&self) -> Vec<u8> {
        let mut data = {
            let mut pool = self.bufs.lock().expect("cell pool poisoned");
            pool.pop().unwrap_or_else(|| vec![0u8; MAX_CELL_SIZE])
        };
        data.resize(MAX_CELL_SIZE, 0);
        data
    }

    fn release(&self, mut data: Vec<u8>) {
        if data.capacity() != MAX_CELL_SIZE {
            return;
        }
        // Restore full length so the next user gets a uniform buffer.
        data.resize(MAX_CELL_SIZE, 0);
        let mut pool = self.bufs.lock().expect("cell pool poisoned");
        if pool.len() < POOL_CAP {
            pool.push(data);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.bufs.lock().expect("cell pool poisoned").len()
    }
}

/// Preload the pool. Doing this at startup makes memory usage far more
/// predictable.
pub fn seed_pool() {
    POOL.seed();
}

/// A byte buffer drawn from the cell pool.
///
/// Handed out at length [`MAX_CELL_SIZE`] and truncated down by the caller.
/// Buffers for oversized variable-length cells are heap-allocated instead
/// and not returned to the pool on drop.
pub struct CellBuf {
    data: Vec<u8>,
}

impl CellBuf {
    /// Fetch a buffer of length [`MAX_CELL_SIZE`], optionally wiped.
    pub fn get(wiped: bool) -> CellBuf {
        let mut data = POOL.get();
        if wiped {
            data.fill(0);
        }
        CellBuf { data }
    }

    /// Fetch a zeroed buffer of exactly `len` bytes. Lengths above
    /// [`MAX_CELL_SIZE`] bypass the pool.
    pub fn with_len(len: usize) -> CellBuf {
        if len <= MAX_CELL_SIZE {
            let mut buf = CellBuf::get(true);
            buf.truncate(len);
            buf
        } else {
            CellBuf {
                data: vec![0u8; len],
            }
        }
    }

    /// Copy `src` into a fresh buffer truncated to `src.len()`.
    pub fn copy_from(src: &[u8]) -> CellBuf {
        let mut buf = CellBuf::with_len(src.len());
        buf.data.copy_from_slice(src);
        buf
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for CellBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for CellBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for CellBuf {
    fn drop(&mut self) {
        POOL.release(std::mem::take(&mut self.data));
    }
}

impl std::fmt::Debug for CellBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CellBuf({} bytes)", self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Count assertions run against a private pool; the global one is
    // shared with every other concurrently running test.
    fn private_pool() -> Pool {
        Pool {
            bufs: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn release_recycles_only_exact_capacity() {
        let pool = private_pool();
        pool.release(vec![0u8; MAX_CELL_SIZE]);
        assert_eq!(pool.len(), 1);

        // Wrong capacity gets dropped instead of poisoning the pool.
        pool.release(Vec::with_capacity(MAX_CELL_SIZE * 2));
        pool.release(vec![0u8; 32]);
        assert_eq!(pool.len(), 1);

        let buf = pool.get();
        assert_eq!(buf.len(), MAX_CELL_SIZE);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn seeding_prefills() {
        let pool = private_pool();
        let mut seeded = pool.bufs.lock().unwrap();
        for _ in 0..SEED_COUNT {
            seeded.push(vec![0u8; MAX_CELL_SIZE]);
        }
        drop(seeded);
        assert_eq!(pool.len(), SEED_COUNT);
        let _ = pool.get();
        assert_eq!(pool.len(), SEED_COUNT - 1);
    }

    #[test]
    fn buffers_hand_out_at_full_length() {
        seed_pool();
        let mut buf = CellBuf::get(false);
        assert_eq!(buf.len(), MAX_CELL_SIZE);
        buf.truncate(7);
        drop(buf);
        let buf = CellBuf::get(false);
        assert_eq!(buf.len(), MAX_CELL_SIZE);
    }

    #[test]
    fn wiped_buffers_are_zeroed() {
        {
            let mut buf = CellBuf::get(false);
            buf.fill(0xAA);
        }
        let buf = CellBuf::get(true);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn sized_buffers() {
        let small = CellBuf::with_len(100);
        assert_eq!(small.len(), 100);
        assert!(small.iter().all(|&b| b == 0));

        let big = CellBuf::with_len(MAX_CELL_SIZE + 100);
        assert_eq!(big.len(), MAX_CELL_SIZE + 100);

        let copied = CellBuf::copy_from(b"hello");
        assert_eq!(&copied[..], b"hello");
    }
}
