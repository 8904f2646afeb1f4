//! # Kernel Logging
//!
//! Wires the [`log`] crate's facade to whatever byte sink the platform
//! provides for early diagnostics (a UART, a semihosting channel, ...).
//! The sink itself is an external collaborator: this crate only owns the
//! `log::Log` implementation and the static-init dance needed to install
//! it once, before the first `log::info!`/`log::warn!` call from the
//! allocator.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]
#![cfg_attr(not(feature = "enabled"), allow(unused_variables))]

use core::fmt;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// A destination for formatted log text.
///
/// Implemented by whatever console the boot collaborator wires up (a
/// memory-mapped UART, a hypervisor debug port, ...). `write_str` must
/// not allocate and should tolerate being called with the PFA lock held
/// by the caller, i.e. it must not itself call back into the allocator.
pub trait LogSink: Sync {
    fn write_str(&self, s: &str);
}

#[cfg(feature = "enabled")]
struct SinkWriter<'a>(&'a dyn LogSink);

#[cfg(feature = "enabled")]
impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// A [`log::Log`] implementation that formats records into a [`LogSink`].
pub struct KernelLogger {
    sink: &'static dyn LogSink,
    max_level: LevelFilter,
}

impl KernelLogger {
    #[must_use]
    pub const fn new(sink: &'static dyn LogSink, max_level: LevelFilter) -> Self {
        Self { sink, max_level }
    }

    /// Installs this logger as the global `log` backend.
    ///
    /// Call once during early boot, before any other kernel component
    /// logs. Calling it twice returns [`SetLoggerError`].
    #[allow(clippy::missing_errors_doc)]
    pub fn init(self) -> Result<(), SetLoggerError> {
        static mut LOGGER: Option<KernelLogger> = None;
        let max_level = self.max_level;

        // SAFETY: `init` runs once on a single boot core before any other
        // thread observes `LOGGER`, and `log::set_logger` enforces the
        // single-install contract afterwards.
        unsafe {
            #[allow(static_mut_refs)]
            {
                LOGGER = Some(self);
                log::set_logger(LOGGER.as_ref().unwrap() as &'static dyn Log)?;
            }
        }
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    #[cfg(feature = "enabled")]
    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        use fmt::Write;
        let _ = write!(
            SinkWriter(self.sink),
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    #[cfg(not(feature = "enabled"))]
    fn log(&self, _record: &Record) {}

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::cell::RefCell;
    use std::string::String;

    struct RecordingSink(RefCell<String>);
    unsafe impl Sync for RecordingSink {}

    impl LogSink for RecordingSink {
        fn write_str(&self, s: &str) {
            self.0.borrow_mut().push_str(s);
        }
    }

    #[test]
    fn enabled_filters_by_level() {
        let sink = RecordingSink(RefCell::new(String::new()));
        // Leak the sink to obtain a 'static reference for the logger, mirroring
        // how the real boot path would wire up a statically-allocated UART sink.
        let sink: &'static RecordingSink = Box::leak(Box::new(sink));
        let logger = KernelLogger::new(sink, LevelFilter::Warn);
        assert!(logger.enabled(&log::Metadata::builder().level(log::Level::Warn).target("t").build()));
        assert!(!logger.enabled(&log::Metadata::builder().level(log::Level::Info).target("t").build()));
    }
}
