/*
 * Scheduler Core - Two-Tier Decision Layer
 *
 * SchedCore combines the two policies into one decision per scheduling
 * opportunity:
 *
 *   stride queue ──► concrete holder ──► that process
 *        │
 *        └──► MLFQ aggregate ──► MLFQ levels ──► a process
 *
 * Every turn starts in the stride queue. When the MLFQ aggregate wins, the
 * MLFQ picks the concrete process. When the turn is over the unit that ran
 * is re-validated (it may have exited, or switched class, while it ran) and
 * only then requeued.
 *
 * SchedCore never touches threads or contexts; it sees processes through
 * SchedView. It is owned by the process table and protected by its lock.
 */

use crate::{
    config::SchedParams,
    error::{SchedError, SchedResult},
};

use super::{
    policies::{Holder, Mlfq, StrideQueue},
    process::ProcFlags,
    traits::SchedView,
    types::{CpuId, Pid, SchedClass},
};

/// Outcome of one scheduling decision
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Pick {
    /// An MLFQ process won through the aggregate entry
    Mlfq(Pid),
    /// A stride process won its own turn
    Stride(Pid),
    /// Nothing is runnable
    Idle,
}

impl Pick {
    pub fn pid(self) -> Option<Pid> {
        match self {
            Pick::Mlfq(pid) | Pick::Stride(pid) => Some(pid),
            Pick::Idle => None,
        }
    }
}

/// The combined MLFQ + stride scheduler state
pub struct SchedCore {
    params: SchedParams,
    mlfq: Mlfq,
    stride: StrideQueue,
}

impl SchedCore {
    /// Create the scheduler for `params`
    ///
    /// # Returns
    /// `InvalidConfig` if the parameters are inconsistent.
    pub fn new(params: SchedParams) -> SchedResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            mlfq: Mlfq::new(&params),
            stride: StrideQueue::new(&params),
        })
    }

    pub fn params(&self) -> &SchedParams {
        &self.params
    }

    pub fn mlfq(&self) -> &Mlfq {
        &self.mlfq
    }

    pub fn stride(&self) -> &StrideQueue {
        &self.stride
    }

    /// Enter a new process into the top MLFQ level
    pub fn admit(&mut self, pid: Pid, view: &mut dyn SchedView) -> SchedResult<()> {
        let acc = view.account(pid).ok_or(SchedError::UnknownHandle)?;
        self.mlfq.admit(pid, acc)
    }

    /// Remove every trace of `pid` from both policies
    pub fn retire(&mut self, pid: Pid) {
        self.mlfq.remove(pid);
        let _ = self.stride.remove(pid);
    }

    /// Decide what `cpu` runs next
    ///
    /// Stride holders that have nothing runnable are charged for the turn
    /// and passed over, as is an aggregate turn with no runnable MLFQ
    /// process. Once the MLFQ came up empty and every queued holder has
    /// been passed over, the CPU idles.
    pub fn pick_next(&mut self, cpu: CpuId, view: &mut dyn SchedView) -> Pick {
        let holders = self.stride.queued().saturating_sub(1);
        let mut skipped = 0;
        let mut mlfq_idle = false;

        loop {
            match self.stride.select(cpu) {
                None => return Pick::Idle,
                Some(Holder::MlfqAggregate) => {
                    if !mlfq_idle {
                        if let Some(pid) = self.mlfq.pick(view) {
                            return Pick::Mlfq(pid);
                        }
                        mlfq_idle = true;
                    }
                }
                Some(Holder::Process(pid)) => {
                    if view.has_runnable(pid) {
                        return Pick::Stride(pid);
                    }
                    self.stride.end_turn(cpu, view.is_terminated(pid));
                    skipped += 1;
                }
            }

            if mlfq_idle && skipped >= holders {
                return Pick::Idle;
            }
        }
    }

    /// Close the turn that `pick` started on `cpu`
    ///
    /// Re-reads the process state: a terminated process is not requeued,
    /// and an MLFQ process that obtained a share during its turn is already
    /// queued on the stride side.
    pub fn finish_turn(&mut self, cpu: CpuId, pick: Pick, view: &mut dyn SchedView) {
        match pick {
            Pick::Idle => {}
            Pick::Mlfq(pid) => {
                let terminated = view.is_terminated(pid);
                // a share granted during the turn was parked on this CPU
                self.stride.end_turn(cpu, terminated);
                if terminated {
                    return;
                }
                let Some(acc) = view.account(pid) else {
                    return;
                };
                if let SchedClass::Mlfq { .. } = acc.class {
                    if let Err(e) = self.mlfq.requeue(pid, acc) {
                        log::warn!("sched: requeue of pid {} failed: {}", pid.0, e);
                    }
                }
            }
            Pick::Stride(pid) => {
                let terminated = view.is_terminated(pid);
                self.stride.end_turn(cpu, terminated);
            }
        }
    }

    /// Account a timer tick to the running process `pid`
    ///
    /// Also runs the MLFQ boost when it falls due.
    ///
    /// # Returns
    /// The yield reason if the process's dispatch quantum is used up.
    pub fn on_tick(&mut self, pid: Pid, view: &mut dyn SchedView) -> Option<ProcFlags> {
        let acc = view.account(pid)?;
        let expired = match acc.class {
            SchedClass::Mlfq { .. } => self
                .mlfq
                .has_to_yield(acc)
                .then_some(ProcFlags::MLFQ_YIELD),
            SchedClass::Stride { .. } => {
                acc.slice_used = acc.slice_used.saturating_add(1);
                (acc.slice_used >= self.params.stride_quantum).then_some(ProcFlags::STRIDE_YIELD)
            }
        };

        if self.mlfq.boost_due() {
            self.mlfq.boost(view);
        }

        expired
    }

    /// Move an MLFQ process into the stride queue with `percent`
    ///
    /// `running_on` is the CPU the process is running on, if any. Its new
    /// share only becomes selectable once that turn is finished.
    ///
    /// # Returns
    /// `InvalidShare` if the process is already a stride process or the
    /// share is rejected; the process is left untouched in that case.
    pub fn set_cpu_share(
        &mut self,
        pid: Pid,
        percent: u32,
        running_on: Option<CpuId>,
        view: &mut dyn SchedView,
    ) -> SchedResult<()> {
        let acc = view.account(pid).ok_or(SchedError::UnknownHandle)?;
        if !matches!(acc.class, SchedClass::Mlfq { .. }) {
            return Err(SchedError::InvalidShare);
        }

        self.stride.request_share(pid, percent, running_on)?;
        self.mlfq.remove(pid);
        acc.class = SchedClass::Stride { percent };
        acc.cticks = 0;
        Ok(())
    }

    /// Change the share of a process already in the stride queue
    pub fn adjust_cpu_share(&mut self, pid: Pid, percent: u32, view: &mut dyn SchedView) -> SchedResult<()> {
        let acc = view.account(pid).ok_or(SchedError::UnknownHandle)?;
        if !matches!(acc.class, SchedClass::Stride { .. }) {
            return Err(SchedError::InvalidShare);
        }

        self.stride.adjust_share(pid, percent)?;
        acc.class = SchedClass::Stride { percent };
        Ok(())
    }

    /// Current MLFQ level of `pid`
    ///
    /// # Returns
    /// `NotMlfq` for a stride process.
    pub fn get_level(&self, pid: Pid, view: &mut dyn SchedView) -> SchedResult<usize> {
        match view.account(pid).ok_or(SchedError::UnknownHandle)?.class {
            SchedClass::Mlfq { level } => Ok(level),
            SchedClass::Stride { .. } => Err(SchedError::NotMlfq),
        }
    }

    /// Log both policies' queues
    pub fn dump(&self) {
        self.stride.dump();
        self.mlfq.dump();
    }
}
