// Kernel-wide formatted output, serialized so that interleaved prints
// from different harts don't garble each other's lines.

use core::fmt::{self, Write};

use crate::console::CONSOLE;
use crate::spinlock::Spinlock;

pub struct Printer {
    lock: Spinlock,
    // Set once panic() has started unwinding: further prints skip
    // locking so a panic on the hart already holding the print lock
    // can still get its message out.
    panicked: core::sync::atomic::AtomicBool,
}

pub static mut PRINTER: Printer = Printer::create();

unsafe impl Sync for Printer {}

impl Printer {
    const fn create() -> Self {
        Printer {
            lock: Spinlock::init_lock("pr"),
            panicked: core::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn init() {
        // lock itself needs no separate init; kept for symmetry with
        // the rest of the subsystem init() calls main() makes.
    }

    pub fn set_panicked(&self) {
        self.panicked
            .store(true, core::sync::atomic::Ordering::SeqCst);
    }

    pub fn print_args(&self, args: fmt::Arguments) {
        let locking = !self.panicked.load(core::sync::atomic::Ordering::SeqCst);
        if locking {
            self.lock.acquire();
        }
        unsafe {
            let _ = CONSOLE.write_fmt(args);
        }
        if locking {
            self.lock.release();
        }
    }
}

#[macro_export]
macro_rules! printf {
    ($($arg:tt)*) => {
        unsafe { $crate::printf::PRINTER.print_args(format_args!($($arg)*)) }
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::printf!("\n") };
    ($($arg:tt)*) => {{
        $crate::printf!($($arg)*);
        $crate::printf!("\n");
    }};
}

/// Routes `log::{error,warn,info,debug,trace}!` through the same
/// serialized console path as `printf!`, so kernel logging and direct
/// prints never interleave garbled output.
struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        unsafe {
            PRINTER.print_args(format_args!(
                "[{:<5} {}] {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Installs the kernel logger and sets the compiled-in max level.
/// Call once from hart 0 during boot, before any `log::*!` macro use.
pub fn init_logger() {
    log::set_logger(&LOGGER).expect("init_logger: logger already set");
    log::set_max_level(if cfg!(debug_assertions) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
}
