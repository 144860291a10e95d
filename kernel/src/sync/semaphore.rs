/*
 * Counting Semaphore
 *
 * Waiters sleep on the semaphore's own address. `signal` wakes a single
 * waiter; which one is not specified.
 */

use spin::Mutex;

use crate::{
    error::{SchedError, SchedResult},
    scheduler::{Channel, Kernel, Platform},
};

/// Counting semaphore for threads of the scheduler
pub struct Semaphore {
    caps: Mutex<u32>,
}

impl Semaphore {
    /// Create a semaphore holding `caps` permits
    pub const fn new(caps: u32) -> Self {
        Self {
            caps: Mutex::new(caps),
        }
    }

    fn channel(&self) -> Channel {
        Channel::of(self)
    }

    /// Take a permit, sleeping while none is available
    ///
    /// # Returns
    /// `Killed` if the caller's process is killed while waiting. A permit
    /// is never consumed in that case; a wakeup that brought one is passed
    /// on to the next waiter.
    pub fn wait<P: Platform>(&self, kernel: &'static Kernel<P>) -> SchedResult<()> {
        let mut caps = self.caps.lock();
        while *caps == 0 {
            if kernel.killed() {
                return Err(SchedError::Killed);
            }
            caps = kernel.sleep(self.channel(), &self.caps, caps);
            if *caps > 0 && kernel.killed() {
                kernel.wakeup_one(self.channel());
                return Err(SchedError::Killed);
            }
        }
        *caps -= 1;
        Ok(())
    }

    /// Take a permit if one is available right now
    pub fn try_wait(&self) -> bool {
        let mut caps = self.caps.lock();
        if *caps == 0 {
            return false;
        }
        *caps -= 1;
        true
    }

    /// Return a permit and wake one waiter
    pub fn signal<P: Platform>(&self, kernel: &'static Kernel<P>) {
        let mut caps = self.caps.lock();
        *caps += 1;
        kernel.wakeup_one(self.channel());
    }

    /// Permits currently available
    pub fn value(&self) -> u32 {
        *self.caps.lock()
    }
}
