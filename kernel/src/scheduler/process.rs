/*
 * Process Record
 *
 * The scheduling view of a heavyweight process: its scheduling class and
 * tick accounting, the table of thread slots it owns, which of those threads
 * is currently active, and its flags.
 *
 * A process owns its threads through slot indices into the global LWP
 * table rather than references, so reclaiming a thread never leaves a
 * dangling pointer behind.
 */

use bitflags::bitflags;
use heapless::String;

use crate::config::NLWPS;

use super::types::{Pid, SchedClass, Tid};

bitflags! {
    /// Per-process flags
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ProcFlags: u8 {
        /// Marked for termination; blocked threads bail out
        const KILLED = 1 << 0;
        /// Last forced yield came from the stride quantum
        const STRIDE_YIELD = 1 << 1;
        /// Last forced yield came from the MLFQ quantum
        const MLFQ_YIELD = 1 << 2;
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// At least one thread has not exited
    Live,
    /// Every thread is a zombie; waiting to be reaped
    Exited,
}

/// Tick accounting the policies read and update
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Account {
    /// Current scheduling class
    pub class: SchedClass,
    /// Ticks consumed at the current MLFQ level
    pub cticks: u32,
    /// Ticks consumed in the current dispatch
    pub slice_used: u32,
}

/// A process as seen by the scheduler
pub struct Process<S> {
    /// Unique process identifier
    pub pid: Pid,

    /// Human-readable name (for debugging)
    pub name: String<16>,

    /// User address space shared by all threads
    pub space: S,

    /// Thread slots, each holding an index into the LWP table
    pub threads: [Option<usize>; NLWPS],

    /// Slot of the thread that runs when the process is dispatched
    pub active: usize,

    /// Next thread id to hand out
    pub next_tid: u32,

    pub account: Account,
    pub flags: ProcFlags,
    pub state: ProcessState,
}

impl<S> Process<S> {
    /// Create a process with no threads yet
    ///
    /// Names longer than the inline buffer are truncated.
    pub fn new(pid: Pid, name: &str, space: S) -> Self {
        let mut short = String::new();
        for c in name.chars() {
            if short.push(c).is_err() {
                break;
            }
        }

        Self {
            pid,
            name: short,
            space,
            threads: [None; NLWPS],
            active: 0,
            next_tid: Tid::MAIN.0,
            account: Account::default(),
            flags: ProcFlags::empty(),
            state: ProcessState::Live,
        }
    }

    /// Hand out the next thread id
    pub fn alloc_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    /// First empty thread slot
    pub fn free_slot(&self) -> Option<usize> {
        self.threads.iter().position(|t| t.is_none())
    }

    /// LWP table indices of all owned threads, with their slots
    pub fn owned(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.threads
            .iter()
            .enumerate()
            .filter_map(|(slot, idx)| idx.map(|idx| (slot, idx)))
    }

    pub fn is_killed(&self) -> bool {
        self.flags.contains(ProcFlags::KILLED)
    }
}
