/*
 * Blocking Synchronization Primitives
 *
 * Built on the scheduler's sleep/wakeup channels. A waiter sleeps on the
 * address of the primitive it waits for; `Kernel::sleep` releases the
 * primitive's internal spin lock only once the waiter is registered, so a
 * signal cannot slip between the check and the sleep.
 *
 * - Semaphore: counting semaphore
 * - RwLock: readers-writer lock (no fairness between readers and writers)
 */

pub mod rwlock;
pub mod semaphore;

pub use rwlock::RwLock;
pub use semaphore::Semaphore;
