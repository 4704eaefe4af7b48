//
// Copyright 2018 yvt, all rights reserved.
//
// Licensed under the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>. This file may
// not be copied, modified,or distributed except
// according to those terms.
//
//! Diagnostics sink the allocators report to.
//!
//! The allocators describe every state transition (arena acquisition and
//! release, each allocation attempt and its outcome, splits, coalesces,
//! fit-mode changes, and a snapshot of the block layout after each
//! mutation) to an optional [`DiagnosticSink`]. When no sink is attached
//! nothing is formatted or emitted.
//!
//! [`LogSink`] bridges the records into the [`log`] facade so the host
//! application's chosen logger implementation receives them; [`MemorySink`]
//! collects them for assertions in tests.
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Severity of a diagnostic record.
///
/// `Critical` has no direct counterpart in the [`log`] facade and folds
/// into [`log::Level::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// The closest [`log`] level.
    pub fn level(self) -> log::Level {
        match self {
            Severity::Trace => log::Level::Trace,
            Severity::Debug => log::Level::Debug,
            Severity::Information => log::Level::Info,
            Severity::Warning => log::Level::Warn,
            Severity::Error | Severity::Critical => log::Level::Error,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Information => "information",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Receiver of allocator diagnostics.
pub trait DiagnosticSink: Send + Sync {
    fn log(&self, severity: Severity, message: &str);
}

/// Sink that forwards every record to the [`log`] crate macros.
#[derive(Debug, Clone, Copy)]
pub struct LogSink {
    target: &'static str,
}

impl LogSink {
    /// Forward records under the given target string.
    pub fn with_target(target: &'static str) -> Self {
        Self { target }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self { target: "fitalloc" }
    }
}

impl DiagnosticSink for LogSink {
    fn log(&self, severity: Severity, message: &str) {
        if severity == Severity::Critical {
            log::log!(target: self.target, log::Level::Error, "critical: {}", message);
        } else {
            log::log!(target: self.target, severity.level(), "{}", message);
        }
    }
}

/// Sink that collects records in memory, for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<(Severity, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out everything recorded so far.
    pub fn records(&self) -> Vec<(Severity, String)> {
        self.records.lock().clone()
    }

    /// Return `true` if any record contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.records.lock().iter().any(|(_, m)| m.contains(needle))
    }

    /// Number of records at exactly `severity`.
    pub fn count_at(&self, severity: Severity) -> usize {
        self.records.lock().iter().filter(|(s, _)| *s == severity).count()
    }
}

impl DiagnosticSink for MemorySink {
    fn log(&self, severity: Severity, message: &str) {
        self.records.lock().push((severity, message.to_owned()));
    }
}

/// Nullable handle to a sink, as stored in an allocator header.
#[derive(Clone, Default)]
pub(crate) struct SinkHandle(Option<Arc<dyn DiagnosticSink>>);

impl SinkHandle {
    pub(crate) fn new(sink: Option<Arc<dyn DiagnosticSink>>) -> Self {
        Self(sink)
    }

    /// Format and deliver a record, unless the handle is null.
    pub(crate) fn emit(&self, severity: Severity, args: fmt::Arguments<'_>) {
        if let Some(sink) = &self.0 {
            sink.log(severity, &args.to_string());
        }
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.0.is_some()
    }
}

impl fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("SinkHandle")
            .field(&self.0.as_ref().map(|_| "..."))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_collects() {
        let sink = MemorySink::new();
        sink.log(Severity::Debug, "split block");
        sink.log(Severity::Error, "no suitable block");
        assert!(sink.contains("split"));
        assert_eq!(sink.count_at(Severity::Error), 1);
        assert_eq!(sink.records().len(), 2);
    }

    #[test]
    fn null_handle_is_silent() {
        let handle = SinkHandle::default();
        assert!(!handle.is_attached());
        // Must not panic or format anything.
        handle.emit(Severity::Critical, format_args!("{}", "unused"));
    }

    #[test]
    fn log_sink_is_callable_without_a_global_logger() {
        LogSink::default().log(Severity::Debug, "no logger installed");
        LogSink::with_target("fitalloc::buddy").log(Severity::Critical, "still fine");
    }

    #[test]
    fn severity_mapping() {
        assert_eq!(Severity::Information.level(), log::Level::Info);
        assert_eq!(Severity::Critical.level(), log::Level::Error);
        assert_eq!(Severity::Warning.to_string(), "warning");
    }
}
