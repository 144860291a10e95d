/*
 * Stride (Proportional-Share) Policy
 *
 * A binary min-heap of share holders keyed by pass. Each turn the holder
 * with the smallest pass runs and its pass advances by
 *
 *     stride = total_share / percent
 *
 * so over time every holder receives CPU turns in proportion to its percent.
 * Passes are exact fractions; see `fraction.rs`.
 *
 * One entry is reserved for the MLFQ as a whole (the aggregate). It is never
 * removed and is charged in place when it wins, so several CPUs may be
 * running MLFQ processes at once. A concrete holder is taken out of the heap
 * for the length of its turn and parked in the per-CPU in-flight slot; it
 * is charged and reinserted (or released if its owner has terminated) when
 * the turn ends.
 *
 * New holders start at `max_pass`, the highest pass handed out so far, so a
 * newcomer cannot monopolize the CPU by starting below everyone else.
 */

use heapless::Vec;

use crate::{
    config::{NCPU, NPROC, SchedParams},
    error::{SchedError, SchedResult},
    scheduler::{
        fraction::Fraction,
        types::{CpuId, Pid},
    },
};

/// Who a share entry belongs to
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Holder {
    /// Stands for "run the MLFQ for one turn"
    MlfqAggregate,
    /// A process that asked for a fixed share
    Process(Pid),
}

/// One share holder in the stride queue
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ShareEntry {
    pub holder: Holder,
    pub percent: u32,
    pub pass: Fraction,
}

/// Capacity of the heap: every process plus the aggregate
pub const HEAP_CAPACITY: usize = NPROC + 1;

/// The stride queue
pub struct StrideQueue {
    heap: Vec<ShareEntry, HEAP_CAPACITY>,

    /// Concrete holders currently running, by CPU
    in_flight: [Option<ShareEntry>; NCPU],

    /// Sum of all live percents, aggregate included
    total_share: u32,

    /// Highest pass assigned so far; seeds new holders
    max_pass: Fraction,

    ceiling: u32,
    max_proc_share: u32,
}

fn parent(i: usize) -> usize {
    (i - 1) / 2
}

impl StrideQueue {
    /// Create a queue holding only the MLFQ aggregate
    pub fn new(params: &SchedParams) -> Self {
        let mut heap = Vec::new();
        // cannot fail: the heap is empty
        let _ = heap.push(ShareEntry {
            holder: Holder::MlfqAggregate,
            percent: params.mlfq_share,
            pass: Fraction::ZERO,
        });

        Self {
            heap,
            in_flight: [None; NCPU],
            total_share: params.mlfq_share,
            max_pass: Fraction::ZERO,
            ceiling: params.share_ceiling,
            max_proc_share: params.max_proc_share,
        }
    }

    // ========================================================================
    // Heap maintenance
    // ========================================================================

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let p = parent(i);
            if !self.heap[i].pass.less_than(self.heap[p].pass) {
                break;
            }
            self.heap.swap(i, p);
            i = p;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap.len();
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut min = i;
            if l < len && self.heap[l].pass.less_than(self.heap[min].pass) {
                min = l;
            }
            if r < len && self.heap[r].pass.less_than(self.heap[min].pass) {
                min = r;
            }
            if min == i {
                break;
            }
            self.heap.swap(i, min);
            i = min;
        }
    }

    fn insert(&mut self, entry: ShareEntry) -> SchedResult<()> {
        self.heap
            .push(entry)
            .map_err(|_| SchedError::AllocationExhausted)?;
        self.sift_up(self.heap.len() - 1);
        Ok(())
    }

    /// Swap entry `i` with the last one, drop it, and restore order
    fn remove_at(&mut self, i: usize) -> Option<ShareEntry> {
        let last = self.heap.len().checked_sub(1)?;
        self.heap.swap(i, last);
        let entry = self.heap.pop();
        if i < self.heap.len() {
            self.sift_down(i);
            self.sift_up(i);
        }
        entry
    }

    fn position(&self, pid: Pid) -> Option<usize> {
        self.heap
            .iter()
            .position(|e| e.holder == Holder::Process(pid))
    }

    fn in_flight_slot(&self, pid: Pid) -> Option<usize> {
        self.in_flight
            .iter()
            .position(|e| e.is_some_and(|e| e.holder == Holder::Process(pid)))
    }

    // ========================================================================
    // Share management
    // ========================================================================

    fn check_percent(&self, percent: u32) -> SchedResult<()> {
        if percent == 0 || percent > self.max_proc_share {
            return Err(SchedError::InvalidShare);
        }
        Ok(())
    }

    /// Register `pid` as a new holder of `percent`
    ///
    /// A process that is running on a CPU right now (`running_on`) must not
    /// be selectable elsewhere until that turn ends, so its entry is parked
    /// in that CPU's in-flight slot and queued by `end_turn`.
    ///
    /// # Returns
    /// `InvalidShare` if `percent` is outside (0, max share], would push the
    /// total past the ceiling, or `pid` already holds a share. Nothing
    /// changes on failure.
    pub fn request_share(&mut self, pid: Pid, percent: u32, running_on: Option<CpuId>) -> SchedResult<()> {
        self.check_percent(percent)?;
        if self.total_share + percent > self.ceiling || self.contains(pid) {
            return Err(SchedError::InvalidShare);
        }

        let entry = ShareEntry {
            holder: Holder::Process(pid),
            percent,
            pass: self.max_pass,
        };
        match running_on {
            Some(cpu) => {
                let slot = &mut self.in_flight[cpu.as_usize()];
                if slot.is_some() {
                    return Err(SchedError::AlreadyQueued);
                }
                *slot = Some(entry);
            }
            None => self.insert(entry)?,
        }
        self.total_share += percent;

        log::info!(
            "stride: pid {} holds {}% (total {}%, pass {})",
            pid.0,
            percent,
            self.total_share,
            self.max_pass
        );
        Ok(())
    }

    /// Change the share of an existing holder, keeping its pass
    pub fn adjust_share(&mut self, pid: Pid, percent: u32) -> SchedResult<()> {
        self.check_percent(percent)?;

        let entry = match (self.position(pid), self.in_flight_slot(pid)) {
            (Some(i), _) => &mut self.heap[i],
            (None, Some(cpu)) => match self.in_flight[cpu].as_mut() {
                Some(entry) => entry,
                None => return Err(SchedError::UnknownHandle),
            },
            (None, None) => return Err(SchedError::UnknownHandle),
        };

        let total = self.total_share - entry.percent + percent;
        if total > self.ceiling {
            return Err(SchedError::InvalidShare);
        }
        entry.percent = percent;
        self.total_share = total;

        log::info!("stride: pid {} adjusted to {}%", pid.0, percent);
        Ok(())
    }

    /// Drop `pid`'s share, wherever it is
    ///
    /// # Returns
    /// The removed entry, or `UnknownHandle` if `pid` holds no share.
    pub fn remove(&mut self, pid: Pid) -> SchedResult<ShareEntry> {
        let entry = if let Some(i) = self.position(pid) {
            self.remove_at(i)
        } else if let Some(cpu) = self.in_flight_slot(pid) {
            self.in_flight[cpu].take()
        } else {
            None
        };

        let entry = entry.ok_or(SchedError::UnknownHandle)?;
        self.total_share -= entry.percent;
        Ok(entry)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Pick the holder for the next turn on `cpu`
    ///
    /// The aggregate is charged immediately and stays queued. A concrete
    /// holder leaves the heap until `end_turn`.
    pub fn select(&mut self, cpu: CpuId) -> Option<Holder> {
        let top = *self.heap.first()?;
        match top.holder {
            Holder::MlfqAggregate => {
                let mut entry = top;
                self.charge(&mut entry);
                self.heap[0] = entry;
                self.sift_down(0);
                Some(Holder::MlfqAggregate)
            }
            Holder::Process(pid) => {
                if let Some(stale) = self.in_flight[cpu.as_usize()].take() {
                    log::warn!("stride: cpu {} selected with a turn still open", cpu.0);
                    if self.insert(stale).is_err() {
                        log::warn!("stride: heap full, share of {:?} dropped", stale.holder);
                        self.total_share -= stale.percent;
                    }
                }
                self.in_flight[cpu.as_usize()] = self.remove_at(0);
                Some(Holder::Process(pid))
            }
        }
    }

    /// Close the turn of the holder running on `cpu`
    ///
    /// The holder's pass advances by one stride and it goes back into the
    /// heap, unless its owner has terminated, in which case its share is
    /// released for good.
    pub fn end_turn(&mut self, cpu: CpuId, terminated: bool) {
        let Some(mut entry) = self.in_flight[cpu.as_usize()].take() else {
            return;
        };

        if terminated {
            self.total_share -= entry.percent;
            log::info!(
                "stride: released {}% (total {}%)",
                entry.percent,
                self.total_share
            );
            return;
        }

        self.charge(&mut entry);
        if self.insert(entry).is_err() {
            log::warn!("stride: heap full, share of {:?} dropped", entry.holder);
            self.total_share -= entry.percent;
        }
    }

    /// Advance `entry` by one stride and track the highest pass
    ///
    /// `entry` must not be in the heap or an in-flight slot.
    fn charge(&mut self, entry: &mut ShareEntry) {
        let Ok(stride) = Fraction::new(self.total_share as u64, entry.percent as u64) else {
            return;
        };

        let next = match entry.pass.checked_add(stride) {
            Ok(pass) => pass,
            Err(_) => {
                let floor = self.min_pass().min(entry.pass);
                self.rebase(floor);
                entry.pass = entry.pass.checked_sub(floor).unwrap_or(Fraction::ZERO);
                match entry.pass.checked_add(stride) {
                    Ok(pass) => pass,
                    Err(_) => {
                        log::warn!("stride: pass space exhausted, restarting all passes");
                        self.restart();
                        entry.pass = Fraction::ZERO;
                        stride
                    }
                }
            }
        };

        entry.pass = next;
        if self.max_pass < next {
            self.max_pass = next;
        }
    }

    /// Smallest pass among queued and running holders
    fn min_pass(&self) -> Fraction {
        self.heap
            .iter()
            .chain(self.in_flight.iter().flatten())
            .map(|e| e.pass)
            .min()
            .unwrap_or(Fraction::ZERO)
    }

    /// Subtract `floor` from every pass, keeping relative order and gaps
    fn rebase(&mut self, floor: Fraction) {
        let entries = self.heap.iter_mut().chain(self.in_flight.iter_mut().flatten());
        for entry in entries {
            entry.pass = entry.pass.checked_sub(floor).unwrap_or(Fraction::ZERO);
        }
        self.max_pass = self.max_pass.checked_sub(floor).unwrap_or(Fraction::ZERO);
        log::debug!("stride: passes rebased by {}", floor);
    }

    /// Put every holder back at pass zero
    fn restart(&mut self) {
        let entries = self.heap.iter_mut().chain(self.in_flight.iter_mut().flatten());
        for entry in entries {
            entry.pass = Fraction::ZERO;
        }
        self.max_pass = Fraction::ZERO;
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn total_share(&self) -> u32 {
        self.total_share
    }

    pub fn max_pass(&self) -> Fraction {
        self.max_pass
    }

    /// Holders waiting in the heap, aggregate included
    pub fn queued(&self) -> usize {
        self.heap.len()
    }

    /// Queued plus running holders
    pub fn len(&self) -> usize {
        self.heap.len() + self.in_flight.iter().flatten().count()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.position(pid).is_some() || self.in_flight_slot(pid).is_some()
    }

    /// The entry of `pid`, queued or running
    pub fn entry(&self, pid: Pid) -> Option<ShareEntry> {
        self.heap
            .iter()
            .chain(self.in_flight.iter().flatten())
            .find(|e| e.holder == Holder::Process(pid))
            .copied()
    }

    /// Whether every parent's pass is at most its children's
    pub fn is_heap_ordered(&self) -> bool {
        (1..self.heap.len()).all(|i| !self.heap[i].pass.less_than(self.heap[parent(i)].pass))
    }

    /// Log the heap in array order
    pub fn dump(&self) {
        log::info!(
            "stride: total {}% max_pass {} ({} holders)",
            self.total_share,
            self.max_pass,
            self.len()
        );
        for (i, e) in self.heap.iter().enumerate() {
            log::info!("  [{}] {:?} {}% pass {}", i, e.holder, e.percent, e.pass);
        }
        for (cpu, e) in self.in_flight.iter().enumerate() {
            if let Some(e) = e {
                log::info!("  cpu{} {:?} {}% pass {}", cpu, e.holder, e.percent, e.pass);
            }
        }
    }
}
