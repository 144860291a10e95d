/*
 * Thread Frame Construction
 *
 * A new thread starts life as a copy of its creator's trap frame, patched so
 * that the return to user mode lands on the thread's entry point with its
 * own stack. Everything here is pure data manipulation; installing the frame
 * and switching to it is the platform's job.
 *
 * Stack layout for thread slot `s` (addresses grow upwards):
 *
 *   top   = USER_TOP - s * PAGES_PER_LWP * PAGE_SIZE
 *   usable page:  [top - PAGE_SIZE,     top)
 *   guard page:   [top - 2 * PAGE_SIZE, top - PAGE_SIZE)   (no user access)
 *
 * The entry function finds a two-word frame at the stack pointer:
 * a sentinel return address that faults if it is ever returned to,
 * followed by the argument.
 */

use x86_64::VirtAddr;

use crate::config::{LWP_STACK_PAGES, PAGE_SIZE, PAGES_PER_LWP, USER_TOP};

/// Return address pushed below a thread's argument; not a mapped address
pub const RETURN_SENTINEL: u64 = 0xffff_ffff_ffff_fff0;

/// Saved user register state
///
/// Restored by the platform's return-to-user path.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// A kernel stack page owned by one LWP
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KernelStack {
    pub base: VirtAddr,
    pub size: u64,
}

impl KernelStack {
    pub fn new(base: VirtAddr, size: u64) -> Self {
        Self { base, size }
    }

    /// Initial stack pointer (stacks grow down)
    pub fn top(&self) -> VirtAddr {
        self.base + self.size
    }
}

/// User stack region reserved for one thread slot
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StackRegion {
    /// Lowest mapped address: the guard page
    pub guard: VirtAddr,
    /// One past the highest usable byte
    pub top: VirtAddr,
}

impl StackRegion {
    /// Region for thread slot `slot`
    pub fn for_slot(slot: usize) -> Self {
        let top = USER_TOP - slot as u64 * PAGES_PER_LWP * PAGE_SIZE;
        Self {
            guard: VirtAddr::new(top - LWP_STACK_PAGES * PAGE_SIZE),
            top: VirtAddr::new(top),
        }
    }

    /// First byte of the usable stack page
    pub fn usable(&self) -> VirtAddr {
        self.guard + PAGE_SIZE
    }

    /// Mapped size in bytes, guard included
    pub fn size(&self) -> u64 {
        LWP_STACK_PAGES * PAGE_SIZE
    }
}

/// Result of building a new thread's initial user state
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ThreadFrame {
    /// Trap frame to return to user mode with
    pub frame: TrapFrame,
    /// Where the two stack words go
    pub stack_ptr: VirtAddr,
    /// Sentinel return address, then the argument
    pub stack_words: [u64; 2],
}

impl ThreadFrame {
    /// The stack words as little-endian bytes, ready for copy-out
    pub fn stack_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.stack_words[0].to_le_bytes());
        bytes[8..].copy_from_slice(&self.stack_words[1].to_le_bytes());
        bytes
    }
}

/// Build the initial user state of a thread
///
/// # Arguments
/// - `parent`: trap frame of the creating thread (segments and flags are kept)
/// - `entry`: user entry point
/// - `arg`: argument, passed in `rdi` and as the word above the return address
/// - `region`: the thread's stack region
///
/// The stack pointer is placed so the entry sees `rsp % 16 == 8`, the same
/// alignment as right after a `call`.
pub fn build_thread_frame(
    parent: &TrapFrame,
    entry: VirtAddr,
    arg: u64,
    region: &StackRegion,
) -> ThreadFrame {
    let stack_ptr = region.top - 24u64;

    let mut frame = *parent;
    frame.rip = entry.as_u64();
    frame.rsp = stack_ptr.as_u64();
    frame.rbp = stack_ptr.as_u64();
    frame.rdi = arg;
    frame.rax = 0;

    ThreadFrame {
        frame,
        stack_ptr,
        stack_words: [RETURN_SENTINEL, arg],
    }
}
