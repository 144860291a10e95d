/*
 * Tiersched: Two-Tier Scheduler and Lightweight-Process Runtime
 *
 * A teaching-kernel CPU scheduler. Processes either compete in a
 * multi-level feedback queue (MLFQ) or hold a fixed percentage of CPU time
 * in a stride scheduler; the MLFQ as a whole holds one reserved share in
 * the same stride heap. Processes may run several lightweight processes
 * (threads) that share the process's address space and scheduling slot.
 *
 * Layout:
 * - scheduler: fractions, policies, the combined core, and the runtime
 *   (process table, dispatch loop, thread create/join/exit, sleep/wakeup)
 * - sync: semaphore and readers-writer lock on top of sleep/wakeup
 * - config: scheduler constants and tunables
 * - error: the error type shared by all operations
 * - utils: logging backend
 *
 * The crate is `no_std` and reaches the machine only through the
 * `scheduler::Platform` trait. Tests run on the host with std.
 */

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod scheduler;
pub mod sync;
pub mod utils;

#[cfg(test)]
mod tests;

pub use config::SchedParams;
pub use error::{SchedError, SchedResult};
pub use scheduler::{Dispatch, Kernel, Platform};
