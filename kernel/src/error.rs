/*
 * Scheduler Error Types
 *
 * Every recoverable failure of the scheduling core and the LWP runtime is
 * reported as a SchedError. Broken internal invariants (a control block
 * outside the pool, a dispatched thread without a kernel stack) are not
 * represented here: they halt the core with a panic.
 */

/// Errors returned by scheduler, LWP and synchronization operations
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Fraction constructed with a zero denominator
    DivisionByZero,
    /// Fraction subtraction whose true result would be negative
    NegativeFraction,
    /// Pass arithmetic no longer fits the fraction representation
    PassOverflow,
    /// Share out of range or above the global ceiling
    InvalidShare,
    /// Process is not scheduled by the MLFQ
    NotMlfq,
    /// No free LWP, kernel stack, process slot or user stack page
    AllocationExhausted,
    /// Handle does not name a thread or process owned by the caller
    UnknownHandle,
    /// The owning process was marked for termination while blocked
    Killed,
    /// Operation needs a running thread but the CPU has none
    NoCurrentThread,
    /// Process still has live threads and cannot be reaped
    StillRunning,
    /// Ready level is at capacity
    QueueFull,
    /// Ready level is empty
    QueueEmpty,
    /// Process is already queued in this level
    AlreadyQueued,
    /// Scheduler parameters are inconsistent
    InvalidConfig,
}

impl core::fmt::Display for SchedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SchedError::DivisionByZero => write!(f, "Division by zero"),
            SchedError::NegativeFraction => write!(f, "Negative fraction result"),
            SchedError::PassOverflow => write!(f, "Pass value overflow"),
            SchedError::InvalidShare => write!(f, "Invalid CPU share"),
            SchedError::NotMlfq => write!(f, "Process not in MLFQ"),
            SchedError::AllocationExhausted => write!(f, "Allocation exhausted"),
            SchedError::UnknownHandle => write!(f, "Unknown handle"),
            SchedError::Killed => write!(f, "Process killed"),
            SchedError::NoCurrentThread => write!(f, "No current thread"),
            SchedError::StillRunning => write!(f, "Process still running"),
            SchedError::QueueFull => write!(f, "Ready queue full"),
            SchedError::QueueEmpty => write!(f, "Ready queue empty"),
            SchedError::AlreadyQueued => write!(f, "Process already queued"),
            SchedError::InvalidConfig => write!(f, "Invalid scheduler parameters"),
        }
    }
}

/// Result alias used across the crate
pub type SchedResult<T> = Result<T, SchedError>;
