//! Kernel console and logger
//!
//! The console is a swappable `fmt::Write` sink: whatever serial or debug
//! port driver the kernel image brings registers itself with
//! [`Console::set_sink`]. Until then, output is dropped.
//!
//! [`KernelLogger`] backs the `log` facade with that console, so every
//! component logs with `log::info!` and friends.
//!
//! # Security Considerations
//! - Formatting never allocates, so logging is safe from the heap's own
//!   growth path
//! - The sink lock is held for one message at a time

use core::fmt;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::{Mutex, Once};

type Sink = &'static mut (dyn fmt::Write + Send);

/// A spin-locked output sink.
pub struct Console {
    sink: Mutex<Option<Sink>>,
}

impl Console {
    pub const fn new() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    /// Route output to `sink`, returning the previous one.
    pub fn set_sink(&self, sink: Sink) -> Option<Sink> {
        self.sink.lock().replace(sink)
    }

    pub fn has_sink(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub fn write_fmt(&self, args: fmt::Arguments<'_>) {
        if let Some(sink) = self.sink.lock().as_mut() {
            let _ = sink.write_fmt(args);
        }
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel console.
pub static CONSOLE: Console = Console::new();

/// Print to the kernel console.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::klog::CONSOLE.write_fmt(format_args!($($arg)*))
    };
}

/// Print a line to the kernel console.
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::klog::CONSOLE.write_fmt(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// `log` backend writing `[LEVEL] target: message` lines to a console.
pub struct KernelLogger {
    max_level: LevelFilter,
    console: &'static Console,
}

impl KernelLogger {
    pub const fn new(max_level: LevelFilter, console: &'static Console) -> Self {
        Self { max_level, console }
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.console.write_fmt(format_args!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

static LOGGER: Once<KernelLogger> = Once::new();

/// Install the kernel logger. Call once during early init.
pub fn init(max_level: LevelFilter) -> Result<(), SetLoggerError> {
    let logger = LOGGER.call_once(|| KernelLogger::new(max_level, &CONSOLE));
    log::set_logger(logger)?;
    log::set_max_level(max_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::string::String;
    use log::Level;

    struct Capture(&'static Mutex<String>);

    impl fmt::Write for Capture {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            self.0.lock().push_str(s);
            Ok(())
        }
    }

    fn captured() -> (&'static Console, &'static Mutex<String>) {
        let text: &'static Mutex<String> = Box::leak(Box::new(Mutex::new(String::new())));
        let console: &'static Console = Box::leak(Box::new(Console::new()));
        console.set_sink(Box::leak(Box::new(Capture(text))));
        (console, text)
    }

    #[test]
    fn console_drops_output_without_sink() {
        let console = Console::new();
        assert!(!console.has_sink());
        console.write_fmt(format_args!("nowhere {}", 1));
    }

    #[test]
    fn logger_formats_and_filters() {
        let (console, text) = captured();
        let logger = KernelLogger::new(LevelFilter::Info, console);

        logger.log(
            &Record::builder()
                .level(Level::Info)
                .target("pantheros_core::mm")
                .args(format_args!("{} frames", 1024))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Trace)
                .target("pantheros_core::mm")
                .args(format_args!("hidden"))
                .build(),
        );
        assert_eq!(&*text.lock(), "[INFO] pantheros_core::mm: 1024 frames\n");
    }

    #[test]
    fn print_macros_reach_the_global_console() {
        let text: &'static Mutex<String> = Box::leak(Box::new(Mutex::new(String::new())));
        CONSOLE.set_sink(Box::leak(Box::new(Capture(text))));
        crate::kprint!("{} frames, ", 3);
        crate::kprintln!("root at {:#x}", 0x1000);
        crate::kprintln!();
        assert!(CONSOLE.has_sink());
        assert_eq!(&*text.lock(), "3 frames, root at 0x1000\n\n");
    }

    #[test]
    fn sink_can_be_swapped() {
        let (console, first) = captured();
        console.write_fmt(format_args!("a"));
        let (_, second) = captured();
        let old = console.set_sink(Box::leak(Box::new(Capture(second))));
        assert!(old.is_some());
        console.write_fmt(format_args!("b"));
        assert_eq!(&*first.lock(), "a");
        assert_eq!(&*second.lock(), "b");
    }
}
