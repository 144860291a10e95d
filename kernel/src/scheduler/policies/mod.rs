/*
 * Scheduling Policies Module
 *
 * The two policies of the two-tier scheduler:
 * - Stride: proportional-share heap deciding who gets the next turn
 * - Mlfq: multi-level feedback queue, one aggregate entrant of the stride heap
 */

pub mod mlfq;
pub mod stride;

pub use mlfq::Mlfq;
pub use stride::{Holder, ShareEntry, StrideQueue};
