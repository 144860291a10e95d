/*
 * Lightweight Process (Thread) Control Block
 *
 * One Lwp per entry of the global LWP table. A process refers to its
 * threads by table index; a thread refers to its parent by thread id,
 * resolved by scanning the owning process.
 *
 * State machine:
 *
 *   Unused -> Embryo -> Runnable <-> {Running, Sleeping} -> Zombie
 *
 * Zombie is terminal. The entry goes back to Unused only when a join (or
 * the reaping of its process) reclaims it; a thread never frees itself.
 */

use core::fmt;

use super::{
    frame::{KernelStack, StackRegion, TrapFrame},
    types::{Channel, Pid, Tid},
};

/// Thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LwpState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl fmt::Display for LwpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LwpState::Unused => "unused",
            LwpState::Embryo => "embryo",
            LwpState::Sleeping => "sleep",
            LwpState::Runnable => "runble",
            LwpState::Running => "run",
            LwpState::Zombie => "zombie",
        };
        write!(f, "{}", name)
    }
}

/// Thread control block
///
/// `C` is the platform's saved hardware context.
pub struct Lwp<C> {
    pub tid: Tid,
    /// Creating thread, or `Tid::REAPER` once orphaned
    pub parent: Tid,
    pub owner: Option<Pid>,
    pub state: LwpState,

    /// Kernel stack; every dispatchable thread has one
    pub kstack: Option<KernelStack>,

    /// Private user stack, absent for a process's main thread
    pub ustack: Option<StackRegion>,

    pub context: C,
    pub frame: TrapFrame,

    pub chan: Option<Channel>,
    pub retval: usize,

    /// Thread this one is blocked joining
    pub joining: Option<Tid>,
}

impl<C: Default> Lwp<C> {
    pub fn unused() -> Self {
        Self {
            tid: Tid(0),
            parent: Tid::REAPER,
            owner: None,
            state: LwpState::Unused,
            kstack: None,
            ustack: None,
            context: C::default(),
            frame: TrapFrame::default(),
            chan: None,
            retval: 0,
            joining: None,
        }
    }

    /// Return the entry to the unused state
    pub fn clear(&mut self) {
        *self = Self::unused();
    }

    /// User stack size in bytes (zero for a main thread)
    pub fn stack_size(&self) -> u64 {
        self.ustack.map_or(0, |r| r.size())
    }

    pub fn is_sleeping_on(&self, chan: Channel) -> bool {
        self.state == LwpState::Sleeping && self.chan == Some(chan)
    }
}
