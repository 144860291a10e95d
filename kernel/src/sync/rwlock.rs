/*
 * Readers-Writer Lock
 *
 * Classic first-readers construction over two semaphores. The first reader
 * in takes the write permit on behalf of all readers and the last reader
 * out returns it. There is no fairness: a steady stream of readers can
 * starve a writer indefinitely.
 */

use spin::Mutex;

use super::semaphore::Semaphore;
use crate::{
    error::SchedResult,
    scheduler::{Kernel, Platform},
};

pub struct RwLock {
    /// Serializes updates of `readers`
    count_lock: Semaphore,
    readers: Mutex<u32>,
    /// Held by one writer, or by the reader group
    write: Semaphore,
}

impl RwLock {
    pub const fn new() -> Self {
        Self {
            count_lock: Semaphore::new(1),
            readers: Mutex::new(0),
            write: Semaphore::new(1),
        }
    }

    /// Enter as a reader
    ///
    /// Readers only block while a writer holds the lock.
    pub fn acquire_read<P: Platform>(&self, kernel: &'static Kernel<P>) -> SchedResult<()> {
        self.count_lock.wait(kernel)?;
        if *self.readers.lock() == 0 {
            if let Err(e) = self.write.wait(kernel) {
                self.count_lock.signal(kernel);
                return Err(e);
            }
        }
        *self.readers.lock() += 1;
        self.count_lock.signal(kernel);
        Ok(())
    }

    /// Leave as a reader; the last reader out lets writers in
    ///
    /// # Panics
    /// If no reader holds the lock.
    pub fn release_read<P: Platform>(&self, kernel: &'static Kernel<P>) -> SchedResult<()> {
        self.count_lock.wait(kernel)?;
        let last = {
            let mut readers = self.readers.lock();
            if *readers == 0 {
                panic!("release_read: no readers");
            }
            *readers -= 1;
            *readers == 0
        };
        if last {
            self.write.signal(kernel);
        }
        self.count_lock.signal(kernel);
        Ok(())
    }

    /// Enter as the single writer
    pub fn acquire_write<P: Platform>(&self, kernel: &'static Kernel<P>) -> SchedResult<()> {
        self.write.wait(kernel)
    }

    pub fn release_write<P: Platform>(&self, kernel: &'static Kernel<P>) {
        self.write.signal(kernel);
    }

    /// Readers currently inside
    pub fn readers(&self) -> u32 {
        *self.readers.lock()
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}
