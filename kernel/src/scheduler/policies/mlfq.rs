/*
 * Multi-Level Feedback Queue Policy
 *
 * NMLFQ ready levels, each a bounded circular FIFO of process ids. Level 0
 * is the highest priority.
 *
 * - A process runs for at most its level's dispatch quantum per turn.
 * - After consuming its level's allotment (summed over turns) it drops one
 *   level and its consumed-tick counter restarts.
 * - Every `boost_interval` MLFQ ticks all processes below level 0 are moved
 *   back to level 0 with their counters cleared, so demoted processes
 *   cannot starve.
 *
 * The MLFQ as a whole is one entrant of the stride queue; it only runs when
 * that aggregate entry wins a stride turn.
 */

use crate::{
    config::{NMLFQ, NPROC, SchedParams},
    error::{SchedError, SchedResult},
    scheduler::{
        process::Account,
        traits::SchedView,
        types::{Pid, SchedClass},
    },
};

/// Slots per level; one slot stays empty to tell "full" from "empty"
pub const LEVEL_CAPACITY: usize = NPROC + 1;

/// Bounded circular FIFO of processes
pub struct LevelQueue {
    front: usize,
    rear: usize,
    items: [Option<Pid>; LEVEL_CAPACITY],
}

impl LevelQueue {
    pub const fn new() -> Self {
        Self {
            front: 0,
            rear: 0,
            items: [None; LEVEL_CAPACITY],
        }
    }

    fn next(i: usize) -> usize {
        (i + 1) % LEVEL_CAPACITY
    }

    pub fn is_empty(&self) -> bool {
        self.front == self.rear
    }

    pub fn is_full(&self) -> bool {
        Self::next(self.rear) == self.front
    }

    pub fn len(&self) -> usize {
        (self.rear + LEVEL_CAPACITY - self.front) % LEVEL_CAPACITY
    }

    /// Queued processes, front first
    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        (0..self.len()).filter_map(move |k| self.items[(self.front + k) % LEVEL_CAPACITY])
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.iter().any(|p| p == pid)
    }

    /// Append `pid` at the rear
    ///
    /// # Returns
    /// `QueueFull` if no slot is left, `AlreadyQueued` if `pid` is present.
    pub fn push(&mut self, pid: Pid) -> SchedResult<()> {
        if self.is_full() {
            return Err(SchedError::QueueFull);
        }
        if self.contains(pid) {
            return Err(SchedError::AlreadyQueued);
        }
        self.items[self.rear] = Some(pid);
        self.rear = Self::next(self.rear);
        Ok(())
    }

    /// Take the process at the front
    pub fn pop(&mut self) -> SchedResult<Pid> {
        if self.is_empty() {
            return Err(SchedError::QueueEmpty);
        }
        let pid = self.items[self.front].take();
        self.front = Self::next(self.front);
        pid.ok_or(SchedError::QueueEmpty)
    }

    /// Cut `pid` out of the queue, keeping the order of the rest
    ///
    /// Entries ahead of it shift one slot towards the rear and the front
    /// advances.
    ///
    /// # Returns
    /// Whether `pid` was queued.
    pub fn remove(&mut self, pid: Pid) -> bool {
        let Some(k) = self.iter().position(|p| p == pid) else {
            return false;
        };

        for j in (1..=k).rev() {
            let dst = (self.front + j) % LEVEL_CAPACITY;
            let src = (self.front + j - 1) % LEVEL_CAPACITY;
            self.items[dst] = self.items[src];
        }
        self.items[self.front] = None;
        self.front = Self::next(self.front);
        true
    }
}

impl Default for LevelQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The MLFQ policy: ready levels plus tick and boost bookkeeping
pub struct Mlfq {
    levels: [LevelQueue; NMLFQ],
    quantum: [u32; NMLFQ],
    allotment: [u32; NMLFQ],
    boost_interval: u64,

    /// MLFQ ticks since the last boost
    ticks: u64,

    boosts: u64,
}

impl Mlfq {
    pub fn new(params: &SchedParams) -> Self {
        Self {
            levels: [const { LevelQueue::new() }; NMLFQ],
            quantum: params.mlfq_quantum,
            allotment: params.mlfq_allotment,
            boost_interval: params.boost_interval,
            ticks: 0,
            boosts: 0,
        }
    }

    /// Queue `pid` at `level`
    pub fn push(&mut self, level: usize, pid: Pid) -> SchedResult<()> {
        self.levels[level.min(NMLFQ - 1)].push(pid)
    }

    /// Take the front process of `level`
    pub fn pop(&mut self, level: usize) -> SchedResult<Pid> {
        self.levels[level.min(NMLFQ - 1)].pop()
    }

    /// Remove `pid` from whichever level holds it
    pub fn remove(&mut self, pid: Pid) -> bool {
        self.levels.iter_mut().any(|level| level.remove(pid))
    }

    /// Enter a new process at the top level with fresh accounting
    pub fn admit(&mut self, pid: Pid, acc: &mut Account) -> SchedResult<()> {
        self.push(0, pid)?;
        *acc = Account::default();
        Ok(())
    }

    /// Choose the next process to dispatch
    ///
    /// Scans levels from highest priority down and takes the first queued
    /// process that has a runnable thread. Blocked processes keep their
    /// place in line.
    pub fn pick(&mut self, view: &dyn SchedView) -> Option<Pid> {
        for level in self.levels.iter_mut() {
            let found = level.iter().find(|&pid| view.has_runnable(pid));
            if let Some(pid) = found {
                level.remove(pid);
                return Some(pid);
            }
        }
        None
    }

    /// Account one timer tick to a running MLFQ process
    ///
    /// # Returns
    /// True once the process has used up its level's dispatch quantum.
    pub fn has_to_yield(&mut self, acc: &mut Account) -> bool {
        let SchedClass::Mlfq { level } = acc.class else {
            return false;
        };

        self.ticks += 1;
        acc.cticks = acc.cticks.saturating_add(1);
        acc.slice_used = acc.slice_used.saturating_add(1);
        acc.slice_used >= self.quantum[level]
    }

    pub fn boost_due(&self) -> bool {
        self.ticks >= self.boost_interval
    }

    /// Move every process below level 0 back to the top level
    ///
    /// Queued processes keep their relative order, appended after the
    /// current level 0 entries. Processes that are running right now have
    /// their accounting reset too and are requeued at level 0 after their
    /// turn.
    pub fn boost(&mut self, view: &mut dyn SchedView) {
        self.ticks = 0;
        self.boosts += 1;

        let (top, lower) = self.levels.split_at_mut(1);
        for level in lower.iter_mut() {
            while let Ok(pid) = level.pop() {
                if let Err(e) = top[0].push(pid) {
                    log::warn!("mlfq boost: pid {} lost: {}", pid.0, e);
                }
            }
        }

        view.for_each_account(&mut |_, acc| {
            if let SchedClass::Mlfq { level } = acc.class {
                if level > 0 {
                    acc.class = SchedClass::Mlfq { level: 0 };
                    acc.cticks = 0;
                }
            }
        });

        log::debug!("mlfq: boost #{}", self.boosts);
    }

    /// Put a process back after its turn, demoting it if its allotment is
    /// used up
    pub fn requeue(&mut self, pid: Pid, acc: &mut Account) -> SchedResult<()> {
        let SchedClass::Mlfq { mut level } = acc.class else {
            return Err(SchedError::NotMlfq);
        };

        if level + 1 < NMLFQ && acc.cticks >= self.allotment[level] {
            level += 1;
            acc.class = SchedClass::Mlfq { level };
            acc.cticks = 0;
            log::trace!("mlfq: pid {} demoted to level {}", pid.0, level);
        }

        self.push(level, pid)
    }

    pub fn level_len(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    pub fn quantum(&self, level: usize) -> u32 {
        self.quantum[level]
    }

    pub fn boosts(&self) -> u64 {
        self.boosts
    }

    /// Log the contents of every level
    pub fn dump(&self) {
        for (n, level) in self.levels.iter().enumerate() {
            log::info!("mlfq level {} ({} queued):", n, level.len());
            for pid in level.iter() {
                log::info!("  pid {}", pid.0);
            }
        }
    }
}
