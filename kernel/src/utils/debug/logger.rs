/*
 * Kernel Logging System
 *
 * Backend for the `log` facade. Each record is formatted into a bounded
 * line buffer and appended to a byte ring; the platform drains the ring to
 * its console (serial port, host stderr) when it is convenient.
 *
 * Lines have the form `[LEVEL] target: message`. Output that does not fit
 * the line buffer is cut.
 */

use core::fmt::Write;

use heapless::String;
use log::{LevelFilter, Metadata, Record, SetLoggerError};
use spin::Mutex;

use super::ring_buffer::RingBuffer;

/// Longest formatted log line
const LINE_MAX: usize = 256;

/// Log backend writing into a byte ring
pub struct KernelLogger {
    ring: Mutex<RingBuffer>,
}

impl KernelLogger {
    pub const fn new() -> Self {
        Self {
            ring: Mutex::new(RingBuffer::new()),
        }
    }

    /// Hand everything logged so far to `sink`, oldest first
    pub fn drain(&self, mut sink: impl FnMut(&[u8])) {
        let mut chunk = [0u8; 128];
        loop {
            let n = self.ring.lock().read(&mut chunk);
            if n == 0 {
                break;
            }
            sink(&chunk[..n]);
        }
    }
}

impl Default for KernelLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut line: String<LINE_MAX> = String::new();
        // whatever does not fit in the line buffer is left out
        let _ = write!(line, "[{}] {}: {}", record.level(), record.target(), record.args());
        let _ = line.push('\n');

        self.ring.lock().write(line.as_bytes());
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger::new();

/// Install the kernel logger with `level` as the maximum level
///
/// # Returns
/// An error if a logger was already installed.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    log::info!("logger initialized at {}", level);
    Ok(())
}

/// Drain the kernel logger's ring into `sink`
pub fn drain(sink: impl FnMut(&[u8])) {
    LOGGER.drain(sink);
}
