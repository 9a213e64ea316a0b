//! Structured kernel log buffer
//!
//! A fixed-size, heap-free circular buffer of log entries installed as the
//! sink behind the [`log`] facade. Subsystems log through the ordinary
//! `log::{error, warn, info, debug, trace}` macros; an external console can
//! drain the buffer, and unit tests inspect it directly.
//!
//! Once full the buffer wraps around and silently overwrites the oldest
//! entries.

use core::fmt::Write as _;

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Maximum number of entries the circular buffer can hold
const LOG_BUFFER_CAPACITY: usize = 256;

/// Maximum stored length (in bytes) of a formatted message
const LOG_MESSAGE_MAX_LEN: usize = 120;

/// Maximum stored length (in bytes) of the module tag
const LOG_TARGET_MAX_LEN: usize = 24;

/// A single structured log entry. All fields are inline fixed-size arrays
/// so the entry never touches the heap.
#[derive(Clone, Copy)]
pub struct LogEntry {
    pub level: log::Level,
    target: [u8; LOG_TARGET_MAX_LEN],
    target_len: u8,
    message: [u8; LOG_MESSAGE_MAX_LEN],
    message_len: u8,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            level: log::Level::Trace,
            target: [0; LOG_TARGET_MAX_LEN],
            target_len: 0,
            message: [0; LOG_MESSAGE_MAX_LEN],
            message_len: 0,
        }
    }

    pub fn target(&self) -> &str {
        core::str::from_utf8(&self.target[..self.target_len as usize]).unwrap_or("?")
    }

    pub fn message(&self) -> &str {
        core::str::from_utf8(&self.message[..self.message_len as usize]).unwrap_or("?")
    }
}

struct RingBuffer {
    entries: [LogEntry; LOG_BUFFER_CAPACITY],
    /// Index of the next slot to write
    head: usize,
    /// Total entries ever written (wrapping accounted for by the reader)
    written: usize,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            entries: [LogEntry::empty(); LOG_BUFFER_CAPACITY],
            head: 0,
            written: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries[self.head] = entry;
        self.head = (self.head + 1) % LOG_BUFFER_CAPACITY;
        self.written += 1;
    }
}

static LOG_BUFFER: Mutex<RingBuffer> = Mutex::new(RingBuffer::new());

/// Bounded `fmt::Write` sink over a fixed byte array. Output past the
/// capacity is truncated.
struct FixedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl core::fmt::Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = self.buf.len() - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut entry = LogEntry::empty();
        entry.level = record.level();

        let target = record.target().as_bytes();
        let tlen = target.len().min(LOG_TARGET_MAX_LEN);
        entry.target[..tlen].copy_from_slice(&target[..tlen]);
        entry.target_len = tlen as u8;

        let mut writer = FixedWriter {
            buf: &mut entry.message,
            len: 0,
        };
        let _ = write!(writer, "{}", record.args());
        entry.message_len = writer.len as u8;

        LOG_BUFFER.lock().push(entry);
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the ring buffer as the global `log` sink.
///
/// Idempotent: a second call (e.g. from a test harness that already
/// installed a logger) is a no-op.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Number of entries written since boot (monotonic, not capped)
pub fn entries_written() -> usize {
    LOG_BUFFER.lock().written
}

/// Copy out the most recent entries, oldest first. Returns how many were
/// copied into `out`.
pub fn snapshot(out: &mut [LogEntry]) -> usize {
    let buf = LOG_BUFFER.lock();
    let available = buf.written.min(LOG_BUFFER_CAPACITY);
    let take = available.min(out.len());

    // Oldest retained entry sits at head when the buffer has wrapped
    let start = if buf.written >= LOG_BUFFER_CAPACITY {
        buf.head
    } else {
        0
    };
    let skip = available - take;
    for (i, slot) in out.iter_mut().take(take).enumerate() {
        let idx = (start + skip + i) % LOG_BUFFER_CAPACITY;
        *slot = buf.entries[idx];
    }
    take
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn push_message(msg: &str) {
        let mut entry = LogEntry::empty();
        entry.level = log::Level::Info;
        let bytes = msg.as_bytes();
        let len = bytes.len().min(LOG_MESSAGE_MAX_LEN);
        entry.message[..len].copy_from_slice(&bytes[..len]);
        entry.message_len = len as u8;
        LOG_BUFFER.lock().push(entry);
    }

    // Single test: the buffer is a process-wide global, and parallel test
    // threads would interleave pushes.
    #[test]
    fn ring_buffer_orders_and_truncates() {
        let before = entries_written();
        push_message("alpha");
        push_message("beta");

        let mut out = [LogEntry::empty(); LOG_BUFFER_CAPACITY];
        let n = snapshot(&mut out);
        assert!(n >= 2);
        assert_eq!(entries_written(), before + 2);
        let last_two: [&str; 2] = [out[n - 2].message(), out[n - 1].message()];
        assert_eq!(last_two, ["alpha", "beta"]);

        extern crate alloc;
        let long = alloc::string::String::from_utf8(
            alloc::vec![b'x'; LOG_MESSAGE_MAX_LEN * 2],
        )
        .unwrap();
        push_message(&long);
        let n = snapshot(&mut out);
        assert_eq!(out[n - 1].message().len(), LOG_MESSAGE_MAX_LEN);
    }
}
