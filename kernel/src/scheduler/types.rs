/*
 * Scheduler Type Definitions
 *
 * This module defines the core types used throughout the scheduler subsystem.
 * These types are designed to be lightweight, Copy-able, and suitable for
 * use in both policy and mechanism layers.
 */

/// CPU identifier
///
/// Represents a logical CPU core. Each core runs its own scheduler loop
/// and indexes its per-CPU record with this value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Bootstrap processor (CPU 0)
    pub const BSP: CpuId = CpuId(0);

    /// Get the CPU ID as a usize for indexing
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Process identifier
///
/// Allocated monotonically; never reused while the kernel runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

/// Thread identifier, unique within its owning process
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u32);

impl Tid {
    /// Parent assigned to threads whose creator exited before them
    pub const REAPER: Tid = Tid(u32::MAX);

    /// Thread id of a process's first thread
    pub const MAIN: Tid = Tid(0);
}

/// Scheduling class of a process
///
/// Every process starts in the MLFQ. The only transition is Mlfq -> Stride,
/// made by an explicit share request; it never reverts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedClass {
    /// Scheduled by the multi-level feedback queue at `level`
    Mlfq { level: usize },

    /// Holds a proportional share of `percent`
    Stride { percent: u32 },
}

impl Default for SchedClass {
    fn default() -> Self {
        SchedClass::Mlfq { level: 0 }
    }
}

/// Sleep channel
///
/// Opaque token a sleeping thread waits on; a wakeup on the same token
/// makes it runnable again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Threads waiting for children of (or a join on) `tid` in `pid`
    Thread { pid: Pid, tid: Tid },

    /// Waiters for orphaned zombie threads and process termination
    Reaper(Pid),

    /// Any kernel object, keyed by its address
    Object(usize),
}

impl Channel {
    /// Channel keyed by the address of `object`
    pub fn of<T>(object: &T) -> Self {
        Channel::Object(object as *const T as usize)
    }
}
