// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (level filtering, line format)
//! PUBLIC API: log_* macros, emit(level,target,args), set_sink(), set_max_level(), Record
//! DEPENDS_ON: spin::RwLock
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; no allocation on the emit path

use core::fmt::{self, Arguments, Write};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::RwLock;

/// Logging severity used by the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn compiled_in(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// One log line handed to the sink.
pub struct Record<'a> {
    pub level: Level,
    pub target: &'static str,
    pub args: Arguments<'a>,
}

impl Record<'_> {
    /// Writes `[LEVEL target] message` without a trailing newline.
    pub fn write_line(&self, out: &mut dyn Write) -> fmt::Result {
        write!(out, "[{} {}] ", self.level.tag(), self.target)?;
        out.write_fmt(self.args)
    }
}

/// Destination for log lines (UART on bare metal, a capture buffer in tests).
pub type Sink = fn(&Record<'_>);

static SINK: RwLock<Option<Sink>> = RwLock::new(None);
static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Trace as u8);

/// Installs the sink receiving every enabled line. Replaces any previous sink.
pub fn set_sink(sink: Sink) {
    *SINK.write() = Some(sink);
}

/// Drops lines more verbose than `level`.
pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Returns true if a line at `level` would reach the sink.
pub fn enabled(level: Level) -> bool {
    level.compiled_in() && (level as u8) <= MAX_LEVEL.load(Ordering::Relaxed)
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let sink = *SINK.read();
    if let Some(sink) = sink {
        sink(&Record { level, target, args });
    }
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    fn render(level: Level, target: &'static str, args: Arguments<'_>) -> String {
        let mut out = String::new();
        Record { level, target, args }.write_line(&mut out).unwrap();
        out
    }

    #[test]
    fn record_formats_single_line() {
        let line = render(Level::Warn, "vm", format_args!("fixed {:#x} busy", 0x1000));
        assert_eq!(line, "[WARN vm] fixed 0x1000 busy");
    }

    #[test]
    fn errors_always_compiled_in() {
        assert!(Level::Error.compiled_in());
        assert_eq!(Level::Trace.compiled_in(), cfg!(debug_assertions));
        assert!(Level::Error < Level::Trace);
    }
}
