/*
 * Light-Weight Process Runtime
 *
 * Threads of one process share its address space, its pid, its scheduling
 * class and its slot in the MLFQ or stride heap. Each thread has its own
 * kernel stack and a private user stack region derived from its slot.
 *
 * LIFECYCLE:
 * ==========
 *
 *   Unused -> Embryo -> Runnable <-> Running -> Zombie -> Unused
 *                          ^            |
 *                          +- Sleeping <+
 *
 * A Zombie keeps its slot, kernel stack and user stack until a joiner
 * collects the return value. When a thread exits, its unjoined children are
 * handed to the reaper (`Tid::REAPER`). When the last thread of a process
 * becomes a Zombie the whole process is marked exited and the reaper
 * channel is woken.
 *
 * Sleeping and exiting threads hand the CPU to a runnable sibling when
 * there is one; the process keeps the rest of its turn.
 */

use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};
use x86_64::{VirtAddr, structures::paging::PageTableFlags};

use super::{
    Kernel, ProcTable, TableGuard, ThreadStart,
    frame::{KernelStack, StackRegion, build_thread_frame},
    process::ProcessState,
    thread::LwpState,
    traits::{Platform, UserMemory},
    types::{Channel, Pid, Tid},
};
use crate::{
    config::{KSTACK_SIZE, LWP_STACK_PAGES},
    error::{SchedError, SchedResult},
};

impl<P: Platform> Kernel<P> {
    // ========================================================================
    // Thread creation and teardown
    // ========================================================================

    /// Create a thread in the calling process
    ///
    /// # Arguments
    /// - `entry`: user function the thread starts in
    /// - `arg`: single argument passed to `entry`
    ///
    /// # Returns
    /// The new thread's id. `AllocationExhausted` if no LWP, kernel stack,
    /// thread slot or stack memory is available; nothing is leaked then.
    pub fn thread_create(&'static self, entry: VirtAddr, arg: usize) -> SchedResult<Tid> {
        let idx = self.pool.lock().alloc()?;
        let Some(page) = self.platform.alloc_page() else {
            self.pool.lock().dealloc(idx);
            return Err(SchedError::AllocationExhausted);
        };
        let kstack = KernelStack::new(page, KSTACK_SIZE);

        let mut table = self.table.lock();
        match self.install_thread(&mut table, idx, kstack, entry, arg) {
            Ok(tid) => Ok(tid),
            Err(e) => {
                drop(table);
                self.platform.free_page(page);
                self.pool.lock().dealloc(idx);
                log::warn!("thread_create: {}", e);
                Err(e)
            }
        }
    }

    fn install_thread(
        &'static self,
        t: &mut ProcTable<P>,
        idx: usize,
        kstack: KernelStack,
        entry: VirtAddr,
        arg: usize,
    ) -> SchedResult<Tid> {
        let (pid, _, me) = t
            .current(self.platform.cpu_id())
            .ok_or(SchedError::NoCurrentThread)?;
        let parent = t.slots.lwps[me].tid;
        let parent_frame = t.slots.lwps[me].frame;

        let process = t.slots.proc_mut(pid).ok_or(SchedError::UnknownHandle)?;
        let slot = process.free_slot().ok_or(SchedError::AllocationExhausted)?;
        let region = StackRegion::for_slot(slot);

        process.space.map(
            region.guard,
            LWP_STACK_PAGES,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
        )?;

        let built = build_thread_frame(&parent_frame, entry, arg as u64, &region);
        let installed = process
            .space
            .set_flags(region.guard, PageTableFlags::PRESENT | PageTableFlags::WRITABLE)
            .and_then(|()| process.space.copy_out(built.stack_ptr, &built.stack_bytes()));
        if let Err(e) = installed {
            process.space.unmap(region.guard, LWP_STACK_PAGES);
            return Err(e);
        }

        let tid = process.alloc_tid();
        process.threads[slot] = Some(idx);

        let lwp = &mut t.slots.lwps[idx];
        lwp.tid = tid;
        lwp.parent = parent;
        lwp.owner = Some(pid);
        lwp.state = LwpState::Embryo;
        lwp.kstack = Some(kstack);
        lwp.ustack = Some(region);
        lwp.frame = built.frame;
        lwp.chan = None;
        lwp.retval = 0;
        lwp.joining = None;
        self.platform.init_context(
            &mut lwp.context,
            &kstack,
            ThreadStart {
                kernel: self,
                frame: built.frame,
            },
        );
        lwp.state = LwpState::Runnable;

        log::debug!(
            "thread_create: pid {} tid {} slot {} stack top {:#x}",
            pid.0,
            tid.0,
            slot,
            region.top.as_u64()
        );
        Ok(tid)
    }

    /// Free everything a zombie (or a reaped thread) still holds
    ///
    /// # Returns
    /// The thread's exit value.
    pub(super) fn reclaim_lwp(&self, t: &mut ProcTable<P>, pid: Pid, slot: usize, idx: usize) -> usize {
        let lwp = &mut t.slots.lwps[idx];
        let retval = lwp.retval;
        let ustack = lwp.ustack;
        let kstack = lwp.kstack;
        lwp.clear();

        if let Some(process) = t.slots.proc_mut(pid) {
            process.threads[slot] = None;
            if let Some(region) = ustack {
                process.space.unmap(region.guard, LWP_STACK_PAGES);
            }
        }
        if let Some(kstack) = kstack {
            self.platform.free_page(kstack.base);
        }
        self.pool.lock().dealloc(idx);
        retval
    }

    /// Wait for thread `handle` of the calling process to exit
    ///
    /// Any thread may join any other thread of its process, not only the
    /// one that created it.
    ///
    /// # Returns
    /// The value the thread passed to `thread_exit`. `UnknownHandle` if no
    /// such thread exists (including the caller itself), `Killed` if the
    /// process was killed while waiting.
    pub fn thread_join(&'static self, handle: Tid) -> SchedResult<usize> {
        let mut table = self.table.lock();
        loop {
            let (pid, _, me) = table
                .current(self.platform.cpu_id())
                .ok_or(SchedError::NoCurrentThread)?;
            let t = &mut *table;
            let my_tid = t.slots.lwps[me].tid;

            let process = t.slots.proc(pid).ok_or(SchedError::UnknownHandle)?;
            if process.is_killed() {
                return Err(SchedError::Killed);
            }
            let Some((slot, idx)) = process
                .owned()
                .find(|&(_, idx)| idx != me && t.slots.lwps[idx].tid == handle)
            else {
                return Err(SchedError::UnknownHandle);
            };

            if t.slots.lwps[idx].state == LwpState::Zombie {
                let value = self.reclaim_lwp(t, pid, slot, idx);
                log::debug!("thread_join: pid {} tid {} -> {}", pid.0, handle.0, value);
                return Ok(value);
            }

            t.slots.lwps[me].joining = Some(handle);
            table = self.sleep_locked(table, me, Channel::Thread { pid, tid: my_tid });
            table.slots.lwps[me].joining = None;
        }
    }

    /// Terminate the calling thread with `value`
    ///
    /// The value is kept until a joiner collects it.
    pub fn thread_exit(&'static self, value: usize) -> ! {
        let mut table = self.table.lock();
        let Some((pid, _, me)) = table.current(self.platform.cpu_id()) else {
            panic!("thread_exit: no current thread");
        };
        let t = &mut *table;

        let lwp = &mut t.slots.lwps[me];
        lwp.retval = value;
        let (tid, parent) = (lwp.tid, lwp.parent);

        let threads: Vec<usize> = t
            .slots
            .proc(pid)
            .map(|p| p.owned().map(|(_, idx)| idx).collect())
            .unwrap_or_default();

        // every thread blocked joining us, plus the parent
        t.slots.wakeup(Channel::Thread { pid, tid: parent });
        for &idx in &threads {
            let waiter = &t.slots.lwps[idx];
            if waiter.joining == Some(tid) && waiter.tid != parent {
                let chan = Channel::Thread { pid, tid: waiter.tid };
                t.slots.wakeup(chan);
            }
        }

        // orphans go to the reaper
        let mut orphaned_zombie = false;
        for idx in threads.into_iter().filter(|&idx| idx != me) {
            let child = &mut t.slots.lwps[idx];
            if child.parent == tid {
                child.parent = Tid::REAPER;
                orphaned_zombie |= child.state == LwpState::Zombie;
            }
        }
        if orphaned_zombie {
            t.slots.wakeup(Channel::Reaper(pid));
        }

        t.slots.lwps[me].state = LwpState::Zombie;
        if t.slots.all_zombie(pid) {
            if let Some(process) = t.slots.proc_mut(pid) {
                process.state = ProcessState::Exited;
            }
            t.slots.wakeup(Channel::Reaper(pid));
            log::info!("thread_exit: pid {} exited", pid.0);
        }
        log::debug!("thread_exit: pid {} tid {} value {}", pid.0, tid.0, value);

        let table = self.relinquish(table, me);
        drop(table);
        panic!("thread_exit: zombie pid {} tid {} resumed", pid.0, tid.0);
    }

    // ========================================================================
    // Sleep and wakeup
    // ========================================================================

    /// Atomically release `guard` and sleep on `chan`
    ///
    /// A wakeup on `chan` issued after `guard` was taken cannot be missed.
    /// The lock is re-acquired before returning.
    ///
    /// # Panics
    /// If called outside of a thread.
    pub fn sleep<'a, T>(&'static self, chan: Channel, lock: &'a Mutex<T>, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let table = self.table.lock();
        drop(guard);

        let Some((_, _, me)) = table.current(self.platform.cpu_id()) else {
            panic!("sleep: no current thread");
        };
        let table = self.sleep_locked(table, me, chan);
        drop(table);

        lock.lock()
    }

    fn sleep_locked(&'static self, mut table: TableGuard<P>, me: usize, chan: Channel) -> TableGuard<P> {
        let lwp = &mut table.slots.lwps[me];
        lwp.chan = Some(chan);
        lwp.state = LwpState::Sleeping;

        let mut table = self.relinquish(table, me);
        table.slots.lwps[me].chan = None;
        table
    }

    /// Make every thread sleeping on `chan` runnable
    pub fn wakeup(&self, chan: Channel) -> usize {
        self.table.lock().slots.wakeup(chan)
    }

    /// Make one thread sleeping on `chan` runnable
    pub fn wakeup_one(&self, chan: Channel) -> bool {
        self.table.lock().slots.wakeup_one(chan)
    }

    /// Whether the calling thread's process has been killed
    pub fn killed(&self) -> bool {
        let table = self.table.lock();
        table
            .current(self.platform.cpu_id())
            .and_then(|(pid, _, _)| table.slots.proc(pid))
            .is_some_and(|p| p.is_killed())
    }

    // ========================================================================
    // Intra-process switching
    // ========================================================================

    /// Leave the CPU after the caller stopped being runnable
    ///
    /// Prefers a runnable sibling; otherwise returns to the scheduler and
    /// ends the process's turn.
    fn relinquish(&'static self, table: TableGuard<P>, me: usize) -> TableGuard<P> {
        let sibling = table.slots.lwps[me].owner.and_then(|pid| {
            let active = table.slots.proc(pid)?.active;
            table.slots.next_runnable(pid, active)
        });

        match sibling {
            Some((slot, next)) => self.switch_lwp(table, me, slot, next),
            None => self.sched(table, me),
        }
    }

    /// Switch from thread `from` to its sibling in `slot`
    ///
    /// The per-CPU kernel stack is updated to the sibling's; the address
    /// space stays as it is.
    pub(super) fn switch_lwp(&'static self, mut table: TableGuard<P>, from: usize, slot: usize, to: usize) -> TableGuard<P> {
        let cpu = self.platform.cpu_id();
        let Some(kstack) = table.slots.lwps[to].kstack else {
            panic!("switch_lwp: lwp {} has no kernel stack", to);
        };

        if let Some(process) = table.slots.lwps[to].owner.and_then(|pid| table.slots.proc_mut(pid)) {
            process.active = slot;
        }
        table.slots.lwps[to].state = LwpState::Running;
        self.platform.set_kernel_stack(cpu, kstack.top());

        log::trace!("switch_lwp: cpu {} lwp {} -> lwp {}", cpu.0, from, to);

        let from_ctx: *mut P::Context = &mut table.slots.lwps[from].context;
        let to_ctx: *const P::Context = &table.slots.lwps[to].context;
        self.handoff(table, from_ctx, to_ctx)
    }
}
