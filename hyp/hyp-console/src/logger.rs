use crate::ring::RingBuffer;
use crate::{CONSOLE_BYTES, console_fmt};
use hyp_sync::SpinLock;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// The guardian console: a `log` sink the host reads back by draining it.
pub struct ConsoleLogger {
    max_level: LevelFilter,
    ring: SpinLock<RingBuffer<CONSOLE_BYTES>>,
}

impl ConsoleLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self {
            max_level,
            ring: SpinLock::new(RingBuffer::new()),
        }
    }

    /// Install as the global logger. Call once during early init.
    ///
    /// # Errors
    /// Fails if a logger is already installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }

    /// Copy the oldest buffered bytes into `out` and forget them.
    pub fn drain(&self, out: &mut [u8]) -> usize {
        self.ring.with_lock(|ring| ring.drain_into(out))
    }

    /// Bytes overwritten before they were drained.
    #[must_use]
    pub fn lost(&self) -> u64 {
        self.ring.with_lock(|ring| ring.lost())
    }

    /// Write preformatted arguments to the console, bypassing level filtering.
    pub fn write_fmt(&self, args: core::fmt::Arguments<'_>) {
        self.ring.with_lock(|ring| console_fmt::console_write(ring, args));
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::hyp_trace!(
            self,
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}
