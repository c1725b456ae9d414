//! Kernel logging mechanism.
use core::fmt::Write;

use log::info;
use spin::once::Once;

use kernel_core::logger::{GlobalValueReader, GlobalValues, LogSink, Logger};

/// A console reachable through a fixed, platform-provided MMIO byte
/// register. The actual address and write protocol belong to the board
/// bring-up code (out of scope here, alongside the trap vector and the
/// MIPS context-switch assembly); this is the seam that code plugs into.
pub struct MmioConsole {
    tx: *mut u8,
}

impl MmioConsole {
    /// Wraps a raw MMIO transmit register.
    ///
    /// # Safety
    /// `tx` must be a valid, live pointer to a one-byte MMIO transmit
    /// register for as long as this console is used.
    #[must_use]
    pub unsafe fn new(tx: *mut u8) -> Self {
        MmioConsole { tx }
    }
}

// SAFETY: the kernel runs cooperatively on a single core; the logger
// serializes access to its sink behind its own lock.
unsafe impl Send for MmioConsole {}

impl Write for MmioConsole {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for &b in s.as_bytes() {
            // SAFETY: see `MmioConsole::new`.
            unsafe {
                self.tx.write_volatile(b);
            }
        }
        Ok(())
    }
}

impl LogSink for MmioConsole {
    fn accept(&mut self, chunk: &[u8]) {
        for &b in chunk {
            // SAFETY: see `MmioConsole::new`.
            unsafe {
                self.tx.write_volatile(b);
            }
        }
    }
}

/// There is no per-core timer or multiprocessor id to read on this
/// single-core target, so every record is tagged core 0 with a zero
/// timestamp.
struct NoGlobalValues;

impl GlobalValueReader for NoGlobalValues {
    fn read() -> GlobalValues {
        GlobalValues {
            core_id: 0,
            timer_counter: 0,
        }
    }
}

/// The global kernel logger instance.
static LOGGER: Once<Logger<MmioConsole, NoGlobalValues>> = Once::new();

/// Installs the global logger backed by `console`.
pub fn init_logging(console: MmioConsole) {
    log::set_max_level(log::LevelFilter::max());
    log::set_logger(LOGGER.call_once(|| Logger::new(console, log::LevelFilter::max())) as _).unwrap();

    info!(
        "kernel v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_BUILD_TIMESTAMP"),
    );
}
