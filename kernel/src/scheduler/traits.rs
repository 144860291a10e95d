/*
 * Scheduler Trait Definitions
 *
 * This module defines the seams between the scheduling core and the rest of
 * the kernel:
 *
 * - SchedView: what the policies may ask about processes (mechanism side)
 * - UserMemory: the virtual-memory manager's per-process address space
 * - Platform: context switching, kernel stacks and physical pages
 *
 * Policies never see threads, contexts or address spaces. They read and
 * update per-process accounting through SchedView only, which keeps them
 * testable without a process table.
 */

use x86_64::{VirtAddr, structures::paging::PageTableFlags};

use crate::error::SchedResult;

use super::{
    ThreadStart,
    frame::KernelStack,
    process::Account,
    types::{CpuId, Pid},
};

/// Process-table queries used by the MLFQ and stride policies
pub trait SchedView {
    /// Whether the process has a thread that can be dispatched now
    fn has_runnable(&self, pid: Pid) -> bool;

    /// Whether the process is gone or all of its threads have exited
    fn is_terminated(&self, pid: Pid) -> bool;

    /// Scheduling accounting of a live process
    fn account(&mut self, pid: Pid) -> Option<&mut Account>;

    /// Visit the accounting of every live process
    fn for_each_account(&mut self, f: &mut dyn FnMut(Pid, &mut Account));
}

/// A user address space, as provided by the virtual-memory manager
pub trait UserMemory: Send {
    /// Map `pages` fresh zeroed pages starting at `start` with `flags`
    ///
    /// Must either map all pages or none.
    fn map(&mut self, start: VirtAddr, pages: u64, flags: PageTableFlags) -> SchedResult<()>;

    /// Change the flags of one mapped page
    fn set_flags(&mut self, page: VirtAddr, flags: PageTableFlags) -> SchedResult<()>;

    /// Unmap and free `pages` pages starting at `start`
    fn unmap(&mut self, start: VirtAddr, pages: u64);

    /// Copy kernel bytes to user address `dst`
    fn copy_out(&mut self, dst: VirtAddr, bytes: &[u8]) -> SchedResult<()>;

    /// Make this the active address space on the calling CPU
    fn activate(&self);
}

/// Hardware and allocator services the scheduler runs on
pub trait Platform: Sync + Sized + 'static {
    /// Saved callee-side execution context
    type Context: Default + Send + 'static;

    /// Per-process address space
    type Space: UserMemory + 'static;

    /// CPU executing the caller
    fn cpu_id(&self) -> CpuId;

    /// Allocate one physical page for a kernel stack
    fn alloc_page(&self) -> Option<VirtAddr>;

    /// Free a page returned by `alloc_page`
    fn free_page(&self, page: VirtAddr);

    /// Prepare `ctx` so that switching to it runs `start` on `stack`
    ///
    /// The bootstrap must call `ThreadStart::enter` and then return to user
    /// mode with the trap frame it yields.
    fn init_context(&self, ctx: &mut Self::Context, stack: &KernelStack, start: ThreadStart<Self>);

    /// Save the current context into `from` and resume `to`
    ///
    /// # Safety
    /// Both pointers must stay valid until the switch back to `from`, and
    /// `to` must hold a context saved by `switch` or built by `init_context`.
    unsafe fn switch(&self, from: *mut Self::Context, to: *const Self::Context);

    /// Set the stack used on interrupt entry for `cpu`
    fn set_kernel_stack(&self, cpu: CpuId, top: VirtAddr);

    /// Wait for the next interrupt when nothing is runnable
    fn idle(&self);
}
