/*
 * Debugging and Logging Utilities
 *
 * The scheduler logs through the `log` facade. `logger` provides the
 * backend: records are formatted into a byte ring that the platform drains
 * to whatever console it has.
 */

pub mod logger;
pub mod ring_buffer;

pub use logger::{drain, init};
