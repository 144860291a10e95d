/*
 * Scheduler Configuration
 *
 * Compile-time table sizes and address-space layout constants, plus the
 * runtime policy parameters (quanta, allotments, boost interval, shares)
 * the kernel is constructed with.
 */

use crate::error::{SchedError, SchedResult};

/// Maximum number of processes
pub const NPROC: usize = 64;

/// Thread slots per process
pub const NLWPS: usize = 64;

/// Size of the global LWP pool
pub const MAX_LWPS: usize = 256;

/// Maximum number of CPUs
pub const NCPU: usize = 8;

/// Number of MLFQ levels
pub const NMLFQ: usize = 3;

/// Page size in bytes
pub const PAGE_SIZE: u64 = 4096;

/// Size of a kernel stack (one page)
pub const KSTACK_SIZE: u64 = 4096;

/// Highest user address; thread stacks are carved downwards from here
pub const USER_TOP: u64 = 0x7fff_e000;

/// Address-space pages reserved per thread slot
pub const PAGES_PER_LWP: u64 = 6;

/// Pages actually mapped for a thread stack (guard + usable)
pub const LWP_STACK_PAGES: u64 = 2;

/// Allotment value meaning "never demote"
pub const UNBOUNDED: u32 = u32::MAX;

/// Runtime scheduling policy parameters
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SchedParams {
    /// Ticks a process may run per dispatch at each MLFQ level
    pub mlfq_quantum: [u32; NMLFQ],
    /// Cumulative ticks at a level before demotion
    pub mlfq_allotment: [u32; NMLFQ],
    /// MLFQ ticks between priority boosts
    pub boost_interval: u64,
    /// Ticks a stride process may run per dispatch
    pub stride_quantum: u32,
    /// Percent reserved for the MLFQ aggregate entry
    pub mlfq_share: u32,
    /// Upper bound on the sum of all live shares
    pub share_ceiling: u32,
    /// Largest share a single process may hold
    pub max_proc_share: u32,
}

impl Default for SchedParams {
    fn default() -> Self {
        Self {
            mlfq_quantum: [5, 10, 20],
            mlfq_allotment: [20, 40, UNBOUNDED],
            boost_interval: 200,
            stride_quantum: 5,
            mlfq_share: 22,
            share_ceiling: 102,
            max_proc_share: 80,
        }
    }
}

impl SchedParams {
    /// Check the parameter set for consistency
    ///
    /// # Returns
    /// `InvalidConfig` if any quantum, interval or share is zero, if an
    /// allotment is shorter than its level's quantum, or if the aggregate
    /// share leaves no room below the ceiling.
    pub fn validate(&self) -> SchedResult<()> {
        let levels_ok = self
            .mlfq_quantum
            .iter()
            .zip(self.mlfq_allotment.iter())
            .all(|(&quantum, &allot)| quantum > 0 && allot >= quantum);

        if !levels_ok
            || self.boost_interval == 0
            || self.stride_quantum == 0
            || self.mlfq_share == 0
            || self.max_proc_share == 0
            || self.mlfq_share >= self.share_ceiling
        {
            return Err(SchedError::InvalidConfig);
        }

        Ok(())
    }
}
