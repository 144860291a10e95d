/*
 * LWP Pool Allocator
 *
 * Bitmap over the global LWP table. Guarded by its own lock, separate from
 * the process-table lock; when both are needed the process table is taken
 * first.
 */

use crate::{
    config::MAX_LWPS,
    error::{SchedError, SchedResult},
};

const WORDS: usize = MAX_LWPS.div_ceil(64);

/// Allocation bitmap for the LWP table
pub struct LwpPool {
    bits: [u64; WORDS],
    used: usize,
}

impl LwpPool {
    pub const fn new() -> Self {
        Self {
            bits: [0; WORDS],
            used: 0,
        }
    }

    /// Claim the lowest free entry
    ///
    /// # Returns
    /// Its table index, or `AllocationExhausted` when the pool is full.
    pub fn alloc(&mut self) -> SchedResult<usize> {
        for (w, word) in self.bits.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let idx = w * 64 + bit;
            if idx >= MAX_LWPS {
                break;
            }
            *word |= 1 << bit;
            self.used += 1;
            return Ok(idx);
        }
        Err(SchedError::AllocationExhausted)
    }

    /// Return an entry to the pool
    ///
    /// # Panics
    /// If `idx` lies outside the pool or is not allocated; either means the
    /// LWP table is corrupt.
    pub fn dealloc(&mut self, idx: usize) {
        if idx >= MAX_LWPS {
            panic!("dealloc: lwp {} outside pool", idx);
        }
        let (w, mask) = (idx / 64, 1u64 << (idx % 64));
        if self.bits[w] & mask == 0 {
            panic!("dealloc: lwp {} not allocated", idx);
        }
        self.bits[w] &= !mask;
        self.used -= 1;
    }

    pub fn is_allocated(&self, idx: usize) -> bool {
        idx < MAX_LWPS && self.bits[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Number of entries in use
    pub fn in_use(&self) -> usize {
        self.used
    }
}

impl Default for LwpPool {
    fn default() -> Self {
        Self::new()
    }
}
