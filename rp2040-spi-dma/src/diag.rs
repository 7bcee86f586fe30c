//! Failure reporting and the fail-halt path.
//!
//! A broken invariant is never returned to the caller. [`fatal_assert!`] and
//! [`fail!`] build a [`FailureReport`] and hand it to a [`FailHalt`]
//! implementation, which prints it and stops the system for good. The stock
//! implementation is [`Diagnostics`]:
//!
//! 1. raise the logic-analyser trigger pin, if one was given
//! 2. print the report, the offending buffer and the regenerated expected
//!    bytes to the [`Console`] while holding the console lock
//! 3. suspend the scheduler
//! 4. mask interrupts and park the core
//!
//! Only an external reset brings the system back.
//!
//! [`fatal_assert!`]: crate::fatal_assert
//! [`fail!`]: crate::fail

use core::cell::RefCell;
use core::convert::Infallible;
use core::fmt::{self, Write};

use critical_section::Mutex;
use embedded_hal::digital::{ErrorType, OutputPin};
use fugit::MillisDurationU32;

use crate::arch;
use crate::gate::LazyLock;
use crate::pattern;
use crate::rtos::{RecursiveLock, Rtos};

/// Size of one formatted console line. Longer output is cut off.
pub const LINE_CAPACITY: usize = 256;

/// Bytes per hex dump row.
const BYTES_PER_ROW: usize = 32;

/// How long a printer waits for another printer to finish.
const CONSOLE_LOCK_TIMEOUT: MillisDurationU32 = MillisDurationU32::millis(1000);

/// A buffer to dump alongside a failure.
#[derive(Debug, Clone, Copy)]
pub struct BufferSnapshot<'a> {
    /// Name printed in the dump header.
    pub name: &'a str,
    /// The bytes as they are now.
    pub bytes: &'a [u8],
    /// Pattern seed the buffer was filled from, if any. The expected bytes
    /// are regenerated from it.
    pub seed: Option<u32>,
}

/// Everything known about a fatal failure.
#[derive(Debug, Clone, Copy)]
pub struct FailureReport<'a> {
    /// Source file.
    pub file: &'static str,
    /// Source line.
    pub line: u32,
    /// Enclosing function.
    pub function: &'static str,
    /// Text of the violated predicate, for assertion failures.
    pub predicate: Option<&'static str>,
    /// Free-form explanation.
    pub message: Option<fmt::Arguments<'a>>,
    /// Buffer to dump.
    pub buffer: Option<BufferSnapshot<'a>>,
}

impl<'a> FailureReport<'a> {
    /// An assertion failure: `predicate` evaluated to false.
    pub fn assertion(
        file: &'static str,
        line: u32,
        function: &'static str,
        predicate: &'static str,
        message: Option<fmt::Arguments<'a>>,
    ) -> Self {
        FailureReport {
            file,
            line,
            function,
            predicate: Some(predicate),
            message,
            buffer: None,
        }
    }

    /// An explicit failure, optionally with a buffer to dump.
    pub fn failure(
        file: &'static str,
        line: u32,
        function: &'static str,
        message: fmt::Arguments<'a>,
        buffer: Option<BufferSnapshot<'a>>,
    ) -> Self {
        FailureReport {
            file,
            line,
            function,
            predicate: None,
            message: Some(message),
            buffer,
        }
    }
}

impl fmt::Display for FailureReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.predicate {
            Some(predicate) => {
                write!(
                    f,
                    "assertion \"{}\" failed: file \"{}\", line {}, function: {}",
                    predicate, self.file, self.line, self.function
                )?;
                if let Some(message) = self.message {
                    write!(f, ": {}", message)?;
                }
                f.write_char('\n')
            }
            None => {
                write!(f, "{}:{}: {}\n: ", self.file, self.line, self.function)?;
                if let Some(message) = self.message {
                    write!(f, "{}", message)?;
                }
                Ok(())
            }
        }
    }
}

/// Something that can report a fatal failure and stop the system.
pub trait FailHalt: Sync {
    /// Report `report` and never return.
    fn halt_with_report(&self, report: &FailureReport<'_>) -> !;
}

/// `fmt::Write` adapter that silently drops whatever does not fit.
struct Truncating<'s, const N: usize>(&'s mut heapless::String<N>);

impl<const N: usize> Write for Truncating<'_, N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

type Line = heapless::String<LINE_CAPACITY>;

fn format_line(args: fmt::Arguments<'_>) -> Line {
    let mut line = Line::new();
    let _ = Truncating(&mut line).write_fmt(args);
    line
}

/// Shared, task-aware console.
///
/// Every message is formatted into a [`LINE_CAPACITY`] byte buffer first and
/// then written to `W` in one go, so concurrent printers never interleave
/// within a line. Multi-line output (dumps, reports) is kept together by
/// [`Console::lock`], a recursive lock created on first use. A printer that
/// cannot get the lock within a second prints anyway.
pub struct Console<'a, R: Rtos, W> {
    rtos: &'a R,
    lock: LazyLock<R::Lock>,
    out: Mutex<RefCell<W>>,
}

/// Holds the console lock until dropped.
pub struct ConsoleGuard<'c, L: RecursiveLock> {
    lock: &'c L,
    held: bool,
}

impl<L: RecursiveLock> Drop for ConsoleGuard<'_, L> {
    fn drop(&mut self) {
        if self.held {
            self.lock.unlock();
        }
    }
}

impl<'a, R: Rtos, W: Write> Console<'a, R, W> {
    /// Console writing to `out`, prefixing lines with names from `rtos`.
    pub const fn new(rtos: &'a R, out: W) -> Self {
        Console {
            rtos,
            lock: LazyLock::new(),
            out: Mutex::new(RefCell::new(out)),
        }
    }

    /// The scheduler this console asks for task names.
    pub fn rtos(&self) -> &'a R {
        self.rtos
    }

    /// Keep other tasks from printing until the guard is dropped.
    pub fn lock(&self) -> ConsoleGuard<'_, R::Lock> {
        let lock = self.lock.get_or_init(|| self.rtos.create_recursive_lock());
        let held = lock.lock(Some(CONSOLE_LOCK_TIMEOUT));
        if !held {
            warn!("console: lock timed out after {} ms", CONSOLE_LOCK_TIMEOUT.ticks());
        }
        ConsoleGuard { lock, held }
    }

    fn emit(&self, text: &str) {
        critical_section::with(|cs| {
            let _ = self.out.borrow(cs).borrow_mut().write_str(text);
        });
    }

    /// Print `args` as is.
    pub fn print(&self, args: fmt::Arguments<'_>) {
        let line = format_line(args);
        let _guard = self.lock();
        self.emit(&line);
    }

    /// Print `args` prefixed with the name of the calling task.
    pub fn task_print(&self, args: fmt::Arguments<'_>) {
        let name = self.rtos.task_name(self.rtos.current_task());
        let line = format_line(format_args!("{}: {}", name, args));
        let _guard = self.lock();
        self.emit(&line);
    }

    fn dump_rows(&self, bytes: impl Iterator<Item = u8>) {
        let mut row = Line::new();
        let mut col = 0;
        for byte in bytes {
            let _ = write!(Truncating(&mut row), "{:02x} ", byte);
            col += 1;
            if col == BYTES_PER_ROW {
                let _ = row.push('\n');
                self.emit(&row);
                row.clear();
                col = 0;
            }
        }
        if col > 0 {
            let _ = row.push('\n');
            self.emit(&row);
        }
    }

    /// Dump `bytes` in hex, 32 per row, under a header naming the buffer.
    pub fn hexdump_8(&self, name: &str, bytes: &[u8]) {
        let _guard = self.lock();
        self.emit("\n");
        self.task_print(format_args!(
            "hexdump_8({}, {:p}, {})\n",
            name,
            bytes.as_ptr(),
            bytes.len()
        ));
        self.dump_rows(bytes.iter().copied());
    }

    /// Dump the first `len` pattern bytes for `seed`, formatted like
    /// [`Console::hexdump_8`].
    pub fn dump_expected(&self, seed: u32, len: usize) {
        let _guard = self.lock();
        self.emit("Expected:\n");
        self.dump_rows(pattern::expected(seed).take(len));
    }

    /// Compare two buffers; on mismatch dump both and return `false`.
    pub fn compare_buffers_8(&self, name0: &str, bytes0: &[u8], name1: &str, bytes1: &[u8]) -> bool {
        if bytes0 == bytes1 {
            return true;
        }
        let _guard = self.lock();
        self.hexdump_8(name0, bytes0);
        self.hexdump_8(name1, bytes1);
        false
    }
}

/// Print through a [`Console`] with the calling task's name as prefix.
#[macro_export]
macro_rules! task_print {
    ($console:expr, $($arg:tt)+) => {
        $console.task_print(::core::format_args!($($arg)+))
    };
}

/// Trigger pin stand-in for boards without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTrigger;

impl ErrorType for NoTrigger {
    type Error = Infallible;
}

impl OutputPin for NoTrigger {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// The fail-halt path: console report, trigger pin, scheduler stop, halt.
pub struct Diagnostics<'a, R: Rtos, W, P = NoTrigger> {
    console: Console<'a, R, W>,
    trigger: Mutex<RefCell<Option<P>>>,
}

impl<'a, R: Rtos, W: Write> Diagnostics<'a, R, W, NoTrigger> {
    /// Report to `console`, no trigger pin.
    pub const fn new(console: Console<'a, R, W>) -> Self {
        Diagnostics {
            console,
            trigger: Mutex::new(RefCell::new(None)),
        }
    }
}

impl<'a, R: Rtos, W: Write, P: OutputPin> Diagnostics<'a, R, W, P> {
    /// Report to `console` and drive `trigger` high before anything else.
    pub const fn with_trigger(console: Console<'a, R, W>, trigger: P) -> Self {
        Diagnostics {
            console,
            trigger: Mutex::new(RefCell::new(Some(trigger))),
        }
    }

    /// The console reports go to.
    pub fn console(&self) -> &Console<'a, R, W> {
        &self.console
    }

    fn raise_trigger(&self) {
        critical_section::with(|cs| {
            if let Some(pin) = self.trigger.borrow(cs).borrow_mut().as_mut() {
                let _ = pin.set_high();
            }
        });
    }

    fn stop(&self) -> ! {
        self.console.rtos().suspend_all();
        arch::halt_system()
    }

    /// A task ran out of stack.
    pub fn stack_overflow(&self, task_name: &str) -> ! {
        self.raise_trigger();
        error!("stack overflow in {}", task_name);
        self.console
            .print(format_args!("\nOut of stack space! Task: {}\n", task_name));
        self.stop()
    }

    /// The kernel could not allocate memory.
    pub fn allocation_failed(&self) -> ! {
        self.raise_trigger();
        error!("allocation failed");
        let rtos = self.console.rtos();
        self.console.print(format_args!(
            "\nAllocation failed! Task: {}\n",
            rtos.task_name(rtos.current_task())
        ));
        self.stop()
    }
}

impl<'a, R, W, P> FailHalt for Diagnostics<'a, R, W, P>
where
    R: Rtos,
    W: Write + Send,
    P: OutputPin + Send,
{
    fn halt_with_report(&self, report: &FailureReport<'_>) -> ! {
        self.raise_trigger();
        error!("fatal failure at {}:{}", report.file, report.line);
        {
            let _guard = self.console.lock();
            self.console.task_print(format_args!("{}", report));
            if let Some(buffer) = report.buffer {
                self.console.hexdump_8(buffer.name, buffer.bytes);
                if let Some(seed) = buffer.seed {
                    self.console.dump_expected(seed, buffer.bytes.len());
                }
            }
        }
        self.stop()
    }
}

/// Name of the enclosing function.
#[doc(hidden)]
#[macro_export]
macro_rules! __function_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            ::core::any::type_name::<T>()
        }
        let path = type_name_of(f);
        let path = path.strip_suffix("::f").unwrap_or(path);
        let path = path.trim_end_matches("::{{closure}}");
        match path.rfind("::") {
            Some(at) => &path[at + 2..],
            None => path,
        }
    }};
}

/// Halt through a [`FailHalt`] unless `cond` holds.
///
/// ```ignore
/// fatal_assert!(diag, owner == Some(me));
/// fatal_assert!(diag, len <= max, "{} bytes requested", len);
/// ```
#[macro_export]
macro_rules! fatal_assert {
    ($diag:expr, $cond:expr $(,)?) => {
        if !$cond {
            $crate::diag::FailHalt::halt_with_report(
                $diag,
                &$crate::diag::FailureReport::assertion(
                    ::core::file!(),
                    ::core::line!(),
                    $crate::__function_name!(),
                    ::core::stringify!($cond),
                    ::core::option::Option::None,
                ),
            )
        }
    };
    ($diag:expr, $cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::diag::FailHalt::halt_with_report(
                $diag,
                &$crate::diag::FailureReport::assertion(
                    ::core::file!(),
                    ::core::line!(),
                    $crate::__function_name!(),
                    ::core::stringify!($cond),
                    ::core::option::Option::Some(::core::format_args!($($arg)+)),
                ),
            )
        }
    };
}

/// Report a failure through a [`FailHalt`] and halt.
///
/// With a `(name, bytes, seed)` tuple the buffer is dumped, followed by the
/// pattern bytes regenerated from `seed` when it is `Some`.
///
/// ```ignore
/// fail!(diag, ("rxbuf", &rx, Some(seed)), "Mismatch at {}/{}\n", i, rx.len());
/// fail!(diag, "unexpected state\n");
/// ```
#[macro_export]
macro_rules! fail {
    ($diag:expr, ($name:expr, $bytes:expr, $seed:expr), $($arg:tt)+) => {
        $crate::diag::FailHalt::halt_with_report(
            $diag,
            &$crate::diag::FailureReport::failure(
                ::core::file!(),
                ::core::line!(),
                $crate::__function_name!(),
                ::core::format_args!($($arg)+),
                ::core::option::Option::Some($crate::diag::BufferSnapshot {
                    name: $name,
                    bytes: $bytes,
                    seed: $seed,
                }),
            ),
        )
    };
    ($diag:expr, $($arg:tt)+) => {
        $crate::diag::FailHalt::halt_with_report(
            $diag,
            &$crate::diag::FailureReport::failure(
                ::core::file!(),
                ::core::line!(),
                $crate::__function_name!(),
                ::core::format_args!($($arg)+),
                ::core::option::Option::None,
            ),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConsole, SimPin, SimRtos};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::string::String;

    fn halted(f: impl FnOnce()) -> bool {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => false,
            Err(payload) => payload
                .downcast_ref::<&str>()
                .map_or(false, |msg| *msg == "system halted"),
        }
    }

    #[test]
    fn task_print_prefixes_task_name() {
        let rtos = SimRtos::new();
        let out = SimConsole::new();
        let console = Console::new(&rtos, out.clone());
        crate::task_print!(console, "value {}\n", 42);
        assert_eq!(out.contents(), "main: value 42\n");
    }

    #[test]
    fn long_lines_are_truncated() {
        let rtos = SimRtos::new();
        let out = SimConsole::new();
        let console = Console::new(&rtos, out.clone());
        let long: String = core::iter::repeat('x').take(400).collect();
        console.print(format_args!("{}", long));
        assert_eq!(out.contents().len(), LINE_CAPACITY);
    }

    #[test]
    fn hexdump_wraps_at_32_bytes() {
        let rtos = SimRtos::new();
        let out = SimConsole::new();
        let console = Console::new(&rtos, out.clone());
        let bytes: Vec<u8> = (0..40).collect();
        console.hexdump_8("buf", &bytes);

        let text = out.contents();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "");
        assert!(lines[1].starts_with("main: hexdump_8(buf, 0x"));
        assert!(lines[1].ends_with(", 40)"));
        assert_eq!(lines[2].split_whitespace().count(), 32);
        assert!(lines[2].starts_with("00 01 02 "));
        assert_eq!(lines[3], "20 21 22 23 24 25 26 27 ");
    }

    #[test]
    fn compare_buffers_dumps_both_on_mismatch() {
        let rtos = SimRtos::new();
        let out = SimConsole::new();
        let console = Console::new(&rtos, out.clone());
        assert!(console.compare_buffers_8("a", &[1, 2, 3], "b", &[1, 2, 3]));
        assert!(out.contents().is_empty());

        assert!(!console.compare_buffers_8("a", &[1, 2, 3], "b", &[1, 9, 3]));
        let text = out.contents();
        assert!(text.contains("hexdump_8(a, "));
        assert!(text.contains("hexdump_8(b, "));
        assert!(text.contains("01 09 03 "));
    }

    #[test]
    fn assertion_report_format() {
        let report = FailureReport::assertion("src/x.rs", 12, "transfer", "owner == me", None);
        assert_eq!(
            std::format!("{}", report),
            "assertion \"owner == me\" failed: file \"src/x.rs\", line 12, function: transfer\n"
        );
    }

    #[test]
    fn failure_report_format() {
        assert_eq!(
            std::format!(
                "{}",
                FailureReport::failure("src/x.rs", 7, "check", format_args!("bad {}\n", 1), None)
            ),
            "src/x.rs:7: check\n: bad 1\n"
        );
    }

    #[test]
    fn function_name_is_enclosing_fn() {
        assert_eq!(crate::__function_name!(), "function_name_is_enclosing_fn");
    }

    #[test]
    fn fatal_assert_passes_when_true() {
        let rtos = SimRtos::new();
        let out = SimConsole::new();
        let diag = Diagnostics::new(Console::new(&rtos, out.clone()));
        crate::fatal_assert!(&diag, 1 + 1 == 2);
        assert!(out.contents().is_empty());
        assert!(!rtos.is_suspended());
    }

    #[test]
    #[should_panic(expected = "system halted")]
    fn fatal_assert_halts_when_false() {
        let rtos = SimRtos::new();
        let diag = Diagnostics::new(Console::new(&rtos, SimConsole::new()));
        let depth = 3;
        crate::fatal_assert!(&diag, depth == 0, "depth {}", depth);
    }

    #[test]
    fn fail_reports_buffer_and_expected_pattern() {
        let rtos = SimRtos::new();
        let out = SimConsole::new();
        let pin = SimPin::new();
        let diag = Diagnostics::with_trigger(Console::new(&rtos, out.clone()), pin.clone());

        let mut buf = [0u8; 4];
        pattern::fill(&mut buf, 1);
        buf[2] = 0x00;
        assert!(halted(|| {
            crate::fail!(
                &diag,
                ("rxbuf", &buf[..], Some(1)),
                "Mismatch at {}/{}: expected {:02x}, got {:02x}\n",
                2,
                4,
                0xd9,
                0x00
            )
        }));

        let text = out.contents();
        assert!(text.contains("src/diag.rs:"));
        assert!(text.contains(": fail_reports_buffer_and_expected_pattern\n"));
        assert!(text.contains(": Mismatch at 2/4: expected d9, got 00\n"));
        assert!(text.contains("main: hexdump_8(rxbuf, "));
        assert!(text.contains("a7 f1 00 2a \n"));
        assert!(text.contains("Expected:\na7 f1 d9 2a \n"));
        assert!(pin.is_high());
        assert!(rtos.is_suspended());
    }

    #[test]
    fn fail_without_buffer_only_prints_message() {
        let rtos = SimRtos::new();
        let out = SimConsole::new();
        let diag = Diagnostics::new(Console::new(&rtos, out.clone()));
        assert!(halted(|| crate::fail!(&diag, "lost track of owner\n")));
        let text = out.contents();
        assert!(text.ends_with(": lost track of owner\n"));
        assert!(!text.contains("hexdump_8"));
    }

    #[test]
    fn fatal_hooks_halt() {
        let rtos = SimRtos::new();
        let out = SimConsole::new();
        let diag = Diagnostics::new(Console::new(&rtos, out.clone()));
        assert!(halted(|| diag.stack_overflow("T1")));
        assert!(out.contents().contains("Out of stack space! Task: T1"));
        assert!(halted(|| diag.allocation_failed()));
        assert!(out.contents().contains("Allocation failed! Task: main"));
    }
}
