/*
 * Two-Tier Scheduler and LWP Runtime
 *
 * This module ties the scheduling policies to the machine. It owns the
 * process table, the LWP table and the per-CPU records, all behind one
 * spin lock (the process-table lock), plus the LWP pool bitmap behind a
 * second lock.
 *
 * SCHEDULING:
 * ===========
 *
 * Each CPU runs `run()`, which calls `schedule_once()` in a loop:
 *
 * 1. SchedCore picks a process (stride turn, or MLFQ via the aggregate)
 * 2. The process's next runnable thread is chosen round-robin from its
 *    active slot and marked Running
 * 3. The CPU switches from its scheduler context to that thread
 * 4. The thread runs until it yields, sleeps or exits; sleeping and
 *    exiting threads first try to hand the CPU to a runnable sibling
 * 5. Back in the scheduler, the turn is closed: the process state is read
 *    again and it is requeued, demoted or dropped
 *
 * LOCK HANDOFF:
 * =============
 *
 * The process-table lock is held across every context switch. The side
 * that switches away forgets its guard; the side that resumes force-unlocks
 * and re-acquires it (`handoff`). A brand-new thread force-unlocks in
 * `ThreadStart::enter`. A thread therefore never runs user code with the
 * lock held, and nobody can observe a context that is half saved.
 *
 * Lock order: caller's own lock (e.g. a semaphore) -> process table ->
 * LWP pool.
 */

pub mod fraction;
pub mod frame;
pub mod lwp;
pub mod lwp_pool;
pub mod policies;
pub mod process;
pub mod sched_core;
pub mod thread;
pub mod traits;
pub mod types;

use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};
use x86_64::VirtAddr;

use crate::{
    config::{KSTACK_SIZE, MAX_LWPS, NCPU, NLWPS, NPROC, SchedParams},
    error::{SchedError, SchedResult},
};

pub use fraction::Fraction;
pub use frame::{KernelStack, StackRegion, TrapFrame};
pub use lwp_pool::LwpPool;
pub use process::{Account, ProcFlags, Process, ProcessState};
pub use sched_core::{Pick, SchedCore};
pub use thread::{Lwp, LwpState};
pub use traits::{Platform, SchedView, UserMemory};
pub use types::{Channel, CpuId, Pid, SchedClass, Tid};

/// Process and LWP storage
///
/// Fixed-size tables allocated once; entries never move, so saved contexts
/// keep stable addresses while a switch is in progress.
pub struct Slots<P: Platform> {
    procs: Vec<Option<Process<P::Space>>>,
    lwps: Vec<Lwp<P::Context>>,
}

impl<P: Platform> Slots<P> {
    fn new() -> Self {
        Self {
            procs: (0..NPROC).map(|_| None).collect(),
            lwps: (0..MAX_LWPS).map(|_| Lwp::unused()).collect(),
        }
    }

    fn proc_index(&self, pid: Pid) -> Option<usize> {
        self.procs
            .iter()
            .position(|p| p.as_ref().is_some_and(|p| p.pid == pid))
    }

    fn proc(&self, pid: Pid) -> Option<&Process<P::Space>> {
        self.procs.iter().flatten().find(|p| p.pid == pid)
    }

    fn proc_mut(&mut self, pid: Pid) -> Option<&mut Process<P::Space>> {
        self.procs.iter_mut().flatten().find(|p| p.pid == pid)
    }

    /// Next runnable thread of `pid` after slot `after`, wrapping around
    ///
    /// # Returns
    /// `(slot, lwp index)`; `after` itself is considered last.
    fn next_runnable(&self, pid: Pid, after: usize) -> Option<(usize, usize)> {
        let p = self.proc(pid)?;
        (1..=NLWPS)
            .map(|k| (after + k) % NLWPS)
            .find_map(|slot| {
                let idx = p.threads[slot]?;
                (self.lwps[idx].state == LwpState::Runnable).then_some((slot, idx))
            })
    }

    /// Thread to dispatch when `pid` wins a turn
    fn choose_thread(&self, pid: Pid) -> Option<(usize, usize)> {
        let active = self.proc(pid)?.active;
        self.next_runnable(pid, active)
    }

    fn all_zombie(&self, pid: Pid) -> bool {
        self.proc(pid).is_some_and(|p| {
            p.owned()
                .all(|(_, idx)| self.lwps[idx].state == LwpState::Zombie)
        })
    }

    /// Find the thread `tid` of `pid`
    fn find_thread(&self, pid: Pid, tid: Tid) -> Option<(usize, usize)> {
        self.proc(pid)?
            .owned()
            .find(|&(_, idx)| self.lwps[idx].tid == tid)
    }

    /// Make every thread sleeping on `chan` runnable
    fn wakeup(&mut self, chan: Channel) -> usize {
        let mut woken = 0;
        for lwp in self.lwps.iter_mut().filter(|l| l.is_sleeping_on(chan)) {
            lwp.state = LwpState::Runnable;
            woken += 1;
        }
        woken
    }

    /// Make the first thread sleeping on `chan` runnable
    fn wakeup_one(&mut self, chan: Channel) -> bool {
        match self.lwps.iter_mut().find(|l| l.is_sleeping_on(chan)) {
            Some(lwp) => {
                lwp.state = LwpState::Runnable;
                true
            }
            None => false,
        }
    }
}

impl<P: Platform> SchedView for Slots<P> {
    fn has_runnable(&self, pid: Pid) -> bool {
        self.proc(pid).is_some_and(|p| {
            p.state == ProcessState::Live
                && p.owned()
                    .any(|(_, idx)| self.lwps[idx].state == LwpState::Runnable)
        })
    }

    fn is_terminated(&self, pid: Pid) -> bool {
        self.proc(pid)
            .is_none_or(|p| p.state == ProcessState::Exited)
    }

    fn account(&mut self, pid: Pid) -> Option<&mut Account> {
        self.proc_mut(pid).map(|p| &mut p.account)
    }

    fn for_each_account(&mut self, f: &mut dyn FnMut(Pid, &mut Account)) {
        for p in self.procs.iter_mut().flatten() {
            f(p.pid, &mut p.account);
        }
    }
}

/// Per-CPU scheduling record
struct CpuSlot<C> {
    /// Process whose thread is running here
    current: Option<Pid>,

    /// Turn opened by the last dispatch, closed when control comes back
    turn: Pick,

    /// Context of this CPU's scheduler loop
    scheduler: C,
}

/// Everything protected by the process-table lock
pub struct ProcTable<P: Platform> {
    core: SchedCore,
    slots: Slots<P>,
    cpus: Vec<CpuSlot<P::Context>>,
    next_pid: u32,
}

impl<P: Platform> ProcTable<P> {
    /// Running process, its active slot and LWP index on `cpu`
    fn current(&self, cpu: CpuId) -> Option<(Pid, usize, usize)> {
        let pid = self.cpus.get(cpu.as_usize())?.current?;
        let p = self.slots.proc(pid)?;
        let idx = p.threads[p.active]?;
        Some((pid, p.active, idx))
    }
}

type TableGuard<P> = MutexGuard<'static, ProcTable<P>>;

/// Bootstrap handed to a new thread's first context
///
/// The platform's trampoline calls `enter` on the new kernel stack and then
/// returns to user mode with the trap frame it gets back.
pub struct ThreadStart<P: Platform> {
    kernel: &'static Kernel<P>,
    frame: TrapFrame,
}

impl<P: Platform> ThreadStart<P> {
    pub fn kernel(&self) -> &'static Kernel<P> {
        self.kernel
    }

    /// Finish the switch into a new thread
    ///
    /// The dispatcher switched here holding the process-table lock; release
    /// it and yield the frame to return to user mode with.
    pub fn enter(self) -> TrapFrame {
        // SAFETY: whoever switched to this context forgot its guard
        unsafe { self.kernel.table.force_unlock() };
        self.frame
    }
}

/// What one scheduling opportunity did
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A thread of this process ran until it gave the CPU back
    Ran(Pid),
    /// Nothing was runnable
    Idle,
}

/// The scheduler and LWP runtime of one machine
pub struct Kernel<P: Platform> {
    platform: P,
    table: Mutex<ProcTable<P>>,
    pool: Mutex<LwpPool>,
}

impl<P: Platform> Kernel<P> {
    /// Create the runtime on `platform`
    ///
    /// # Returns
    /// `InvalidConfig` if `params` are inconsistent.
    pub fn new(platform: P, params: SchedParams) -> SchedResult<Self> {
        let core = SchedCore::new(params)?;
        let cpus = (0..NCPU)
            .map(|_| CpuSlot {
                current: None,
                turn: Pick::Idle,
                scheduler: P::Context::default(),
            })
            .collect();

        log::info!(
            "sched: {} MLFQ levels, aggregate {}%, ceiling {}%",
            crate::config::NMLFQ,
            params.mlfq_share,
            params.share_ceiling
        );

        Ok(Self {
            platform,
            table: Mutex::new(ProcTable {
                core,
                slots: Slots::new(),
                cpus,
                next_pid: 1,
            }),
            pool: Mutex::new(LwpPool::new()),
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    // ========================================================================
    // Context switching
    // ========================================================================

    /// Switch from `from` to `to` with the process table held, and take it
    /// again once something switches back
    fn handoff(
        &'static self,
        table: TableGuard<P>,
        from: *mut P::Context,
        to: *const P::Context,
    ) -> TableGuard<P> {
        core::mem::forget(table);
        // SAFETY: both contexts live in fixed tables that are never resized.
        // The lock is still held; whoever resumes us forgot their guard.
        unsafe {
            self.platform.switch(from, to);
            self.table.force_unlock();
        }
        self.table.lock()
    }

    /// Give the CPU back to this CPU's scheduler loop
    fn sched(&'static self, mut table: TableGuard<P>, me: usize) -> TableGuard<P> {
        let c = self.platform.cpu_id().as_usize();
        let from: *mut P::Context = &mut table.slots.lwps[me].context;
        let to: *const P::Context = &table.cpus[c].scheduler;
        self.handoff(table, from, to)
    }

    // ========================================================================
    // Process admission and teardown
    // ========================================================================

    /// Register a new process with one thread that starts from `frame`
    ///
    /// The process enters the top MLFQ level.
    ///
    /// # Returns
    /// The new pid, or `AllocationExhausted` if no process slot, LWP or
    /// kernel stack is free (nothing is leaked in that case).
    pub fn spawn_process(&'static self, name: &str, space: P::Space, frame: TrapFrame) -> SchedResult<Pid> {
        let idx = self.pool.lock().alloc()?;
        let Some(page) = self.platform.alloc_page() else {
            self.pool.lock().dealloc(idx);
            return Err(SchedError::AllocationExhausted);
        };
        let kstack = KernelStack::new(page, KSTACK_SIZE);

        let mut table = self.table.lock();
        let Some(slot) = table.slots.procs.iter().position(Option::is_none) else {
            drop(table);
            self.release_spawn(idx, page);
            return Err(SchedError::AllocationExhausted);
        };

        let pid = Pid(table.next_pid);
        table.next_pid += 1;

        let mut process = Process::new(pid, name, space);
        let tid = process.alloc_tid();
        process.threads[0] = Some(idx);
        table.slots.procs[slot] = Some(process);

        let lwp = &mut table.slots.lwps[idx];
        lwp.tid = tid;
        lwp.parent = Tid::REAPER;
        lwp.owner = Some(pid);
        lwp.state = LwpState::Embryo;
        lwp.kstack = Some(kstack);
        lwp.frame = frame;
        self.platform
            .init_context(&mut lwp.context, &kstack, ThreadStart { kernel: self, frame });
        lwp.state = LwpState::Runnable;

        let t = &mut *table;
        if let Err(e) = t.core.admit(pid, &mut t.slots) {
            t.slots.lwps[idx].clear();
            t.slots.procs[slot] = None;
            drop(table);
            self.release_spawn(idx, page);
            log::warn!("sched: pid {} ({}) not admitted: {}", pid.0, name, e);
            return Err(e);
        }

        log::info!("sched: spawned pid {} ({})", pid.0, name);
        Ok(pid)
    }

    /// Give back the LWP and kernel stack of a spawn that failed
    fn release_spawn(&self, idx: usize, page: VirtAddr) {
        self.platform.free_page(page);
        self.pool.lock().dealloc(idx);
    }

    /// Mark `pid` for termination
    ///
    /// Sleeping threads of the process are woken; blocking operations they
    /// are in return `Killed`. Running threads are not interrupted.
    pub fn kill(&self, pid: Pid) -> SchedResult<()> {
        let mut table = self.table.lock();
        let slots = &mut table.slots;
        let process = slots.proc_mut(pid).ok_or(SchedError::UnknownHandle)?;
        process.flags.insert(ProcFlags::KILLED);

        let threads = process.threads;
        for idx in threads.into_iter().flatten() {
            let lwp = &mut slots.lwps[idx];
            if lwp.state == LwpState::Sleeping {
                lwp.state = LwpState::Runnable;
            }
        }

        log::info!("sched: pid {} killed", pid.0);
        Ok(())
    }

    /// Release every resource of a process whose threads have all exited
    ///
    /// # Returns
    /// `StillRunning` while any thread is alive or a CPU has not finished
    /// switching away from it.
    pub fn reap_process(&self, pid: Pid) -> SchedResult<()> {
        let mut table = self.table.lock();
        let t = &mut *table;

        let slot = t.slots.proc_index(pid).ok_or(SchedError::UnknownHandle)?;
        let exited = t.slots.procs[slot]
            .as_ref()
            .is_some_and(|p| p.state == ProcessState::Exited);
        if !exited || t.cpus.iter().any(|c| c.current == Some(pid)) {
            return Err(SchedError::StillRunning);
        }

        let owned: Vec<(usize, usize)> = t.slots.procs[slot]
            .as_ref()
            .map(|p| p.owned().collect())
            .unwrap_or_default();
        for (thread_slot, idx) in owned {
            self.reclaim_lwp(t, pid, thread_slot, idx);
        }

        t.core.retire(pid);
        t.slots.procs[slot] = None;

        log::info!("sched: reaped pid {}", pid.0);
        Ok(())
    }

    // ========================================================================
    // Scheduler loop
    // ========================================================================

    /// Run one scheduling opportunity on the calling CPU
    ///
    /// Must be called from the CPU's scheduler context, never from a thread.
    pub fn schedule_once(&'static self) -> Dispatch {
        let cpu = self.platform.cpu_id();
        let c = cpu.as_usize();

        let mut table = self.table.lock();
        let t = &mut *table;

        let pick = t.core.pick_next(cpu, &mut t.slots);
        let Some(pid) = pick.pid() else {
            return Dispatch::Idle;
        };

        // selection and dispatch happen under one lock hold, but re-check
        let Some((slot, idx)) = t.slots.choose_thread(pid) else {
            t.core.finish_turn(cpu, pick, &mut t.slots);
            return Dispatch::Idle;
        };
        let Some(kstack) = t.slots.lwps[idx].kstack else {
            panic!("sched: pid {} lwp {} dispatched without a kernel stack", pid.0, idx);
        };

        if let Some(p) = t.slots.proc_mut(pid) {
            p.active = slot;
            p.account.slice_used = 0;
            p.flags.remove(ProcFlags::STRIDE_YIELD | ProcFlags::MLFQ_YIELD);
            p.space.activate();
        }
        t.slots.lwps[idx].state = LwpState::Running;
        t.cpus[c].current = Some(pid);
        t.cpus[c].turn = pick;
        self.platform.set_kernel_stack(cpu, kstack.top());

        log::trace!("sched: cpu {} -> pid {} ({:?})", cpu.0, pid.0, pick);

        let from: *mut P::Context = &mut t.cpus[c].scheduler;
        let to: *const P::Context = &t.slots.lwps[idx].context;
        let mut table = self.handoff(table, from, to);

        let t = &mut *table;
        t.cpus[c].current = None;
        let pick = core::mem::replace(&mut t.cpus[c].turn, Pick::Idle);
        t.core.finish_turn(cpu, pick, &mut t.slots);

        Dispatch::Ran(pid)
    }

    /// Per-CPU scheduler loop
    pub fn run(&'static self) -> ! {
        log::info!("sched: cpu {} entering scheduler", self.platform.cpu_id().0);
        loop {
            if self.schedule_once() == Dispatch::Idle {
                self.platform.idle();
            }
        }
    }

    /// Give up the CPU; the calling thread stays runnable
    pub fn yield_now(&'static self) -> SchedResult<()> {
        let mut table = self.table.lock();
        let (_, _, me) = table
            .current(self.platform.cpu_id())
            .ok_or(SchedError::NoCurrentThread)?;

        table.slots.lwps[me].state = LwpState::Runnable;
        let table = self.sched(table, me);
        drop(table);
        Ok(())
    }

    /// Timer checkpoint for the running thread
    ///
    /// Accounts one tick to the current process and yields if its dispatch
    /// quantum is used up.
    ///
    /// # Returns
    /// Whether the thread yielded.
    pub fn tick(&'static self) -> SchedResult<bool> {
        let expired = {
            let mut table = self.table.lock();
            let (pid, _, _) = table
                .current(self.platform.cpu_id())
                .ok_or(SchedError::NoCurrentThread)?;

            let t = &mut *table;
            let reason = t.core.on_tick(pid, &mut t.slots);
            if let (Some(flag), Some(p)) = (reason, t.slots.proc_mut(pid)) {
                p.flags.insert(flag);
            }
            reason.is_some()
        };

        if expired {
            self.yield_now()?;
        }
        Ok(expired)
    }

    // ========================================================================
    // Share and level requests
    // ========================================================================

    fn current_pid(&self) -> SchedResult<Pid> {
        let table = self.table.lock();
        table
            .current(self.platform.cpu_id())
            .map(|(pid, _, _)| pid)
            .ok_or(SchedError::NoCurrentThread)
    }

    /// Move the calling process from the MLFQ to a fixed `percent` share
    ///
    /// The change is permanent. On success the caller yields so the next
    /// turn is taken under the new class.
    pub fn set_cpu_share(&'static self, percent: u32) -> SchedResult<()> {
        let pid = self.current_pid()?;
        self.set_cpu_share_of(pid, percent)?;
        self.yield_now()
    }

    /// `set_cpu_share` on behalf of another process
    pub fn set_cpu_share_of(&self, pid: Pid, percent: u32) -> SchedResult<()> {
        let mut table = self.table.lock();
        let t = &mut *table;
        let running_on = t
            .cpus
            .iter()
            .position(|c| c.current == Some(pid))
            .map(|c| CpuId(c as u32));
        t.core.set_cpu_share(pid, percent, running_on, &mut t.slots)?;
        log::info!("sched: pid {} left the MLFQ with {}%", pid.0, percent);
        Ok(())
    }

    /// Change the share of the calling stride process
    pub fn adjust_cpu_share(&self, percent: u32) -> SchedResult<()> {
        let pid = self.current_pid()?;
        let mut table = self.table.lock();
        let t = &mut *table;
        t.core.adjust_cpu_share(pid, percent, &mut t.slots)
    }

    /// MLFQ level of the calling process
    ///
    /// # Returns
    /// `NotMlfq` if the process holds a stride share.
    pub fn get_level(&self) -> SchedResult<usize> {
        let pid = self.current_pid()?;
        self.get_level_of(pid)
    }

    pub fn get_level_of(&self, pid: Pid) -> SchedResult<usize> {
        let mut table = self.table.lock();
        let t = &mut *table;
        t.core.get_level(pid, &mut t.slots)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn process_exited(&self, pid: Pid) -> bool {
        self.table.lock().slots.is_terminated(pid)
    }

    pub fn thread_state(&self, pid: Pid, tid: Tid) -> Option<LwpState> {
        let table = self.table.lock();
        let (_, idx) = table.slots.find_thread(pid, tid)?;
        Some(table.slots.lwps[idx].state)
    }

    pub fn thread_parent(&self, pid: Pid, tid: Tid) -> Option<Tid> {
        let table = self.table.lock();
        let (_, idx) = table.slots.find_thread(pid, tid)?;
        Some(table.slots.lwps[idx].parent)
    }

    /// Threads (any state but unused) owned by `pid`
    pub fn thread_count(&self, pid: Pid) -> usize {
        self.table
            .lock()
            .slots
            .proc(pid)
            .map_or(0, |p| p.owned().count())
    }

    pub fn flags(&self, pid: Pid) -> Option<ProcFlags> {
        self.table.lock().slots.proc(pid).map(|p| p.flags)
    }

    /// LWP pool entries in use
    pub fn lwps_in_use(&self) -> usize {
        self.pool.lock().in_use()
    }

    pub fn total_share(&self) -> u32 {
        self.table.lock().core.stride().total_share()
    }

    /// Run `f` on the address space of `pid`
    pub fn with_space<R>(&self, pid: Pid, f: impl FnOnce(&P::Space) -> R) -> Option<R> {
        let table = self.table.lock();
        table.slots.proc(pid).map(|p| f(&p.space))
    }

    /// Log the scheduler queues and every thread in use
    pub fn dump_threads(&self) {
        let table = self.table.lock();
        table.core.dump();
        for p in table.slots.procs.iter().flatten() {
            log::info!(
                "pid {} {} {:?} {:?} active slot {}",
                p.pid.0,
                p.name.as_str(),
                p.state,
                p.account.class,
                p.active
            );
            for (slot, idx) in p.owned() {
                let lwp = &table.slots.lwps[idx];
                log::info!(
                    "  slot {} tid {} parent {} {} stack {}",
                    slot,
                    lwp.tid.0,
                    lwp.parent.0,
                    lwp.state,
                    lwp.stack_size()
                );
            }
        }
    }
}
