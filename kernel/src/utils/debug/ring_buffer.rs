/*
 * Byte Ring for Log Output
 *
 * Fixed-size circular buffer that keeps the newest bytes. Callers wrap it
 * in a lock; scheduler code logs with the process-table lock held, so
 * writing must never block or allocate.
 *
 * Design:
 * - Fixed-size storage (8KB)
 * - `head` is the next write position, `len` the bytes held
 * - Overwrite on overflow (oldest bytes are lost)
 */

/// Size of the ring in bytes
pub const BUFFER_SIZE: usize = 8 * 1024;

pub struct RingBuffer {
    buffer: [u8; BUFFER_SIZE],
    head: usize,
    len: usize,
    /// Bytes overwritten before they were read
    dropped: usize,
}

impl RingBuffer {
    pub const fn new() -> Self {
        Self {
            buffer: [0; BUFFER_SIZE],
            head: 0,
            len: 0,
            dropped: 0,
        }
    }

    /// Append `data`, overwriting the oldest bytes if full
    ///
    /// # Returns
    /// Number of bytes written
    pub fn write(&mut self, data: &[u8]) -> usize {
        // only the newest BUFFER_SIZE bytes can survive
        let data = &data[data.len().saturating_sub(BUFFER_SIZE)..];

        for &byte in data {
            self.buffer[self.head] = byte;
            self.head = (self.head + 1) % BUFFER_SIZE;
            if self.len == BUFFER_SIZE {
                self.dropped += 1;
            } else {
                self.len += 1;
            }
        }
        data.len()
    }

    /// Move up to `dest.len()` of the oldest bytes into `dest`
    ///
    /// # Returns
    /// Number of bytes read
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let count = self.len.min(dest.len());
        let tail = (self.head + BUFFER_SIZE - self.len) % BUFFER_SIZE;

        for (i, slot) in dest.iter_mut().take(count).enumerate() {
            *slot = self.buffer[(tail + i) % BUFFER_SIZE];
        }
        self.len -= count;
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}
