//! Diagnostic trace sinks.
//!
//! Every revision, fetch and batch call takes a `&mut dyn TraceSink` and
//! appends human-readable lines explaining what it matched and why it did
//! nothing. Callers that do not care pass [`NoTrace`].

use std::fmt;

/// Write-only, ordered text log.
pub trait TraceSink {
    fn append(&mut self, line: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTrace;

impl TraceSink for NoTrace {
    fn append(&mut self, _line: &str) {}
}

/// Collects lines into a text buffer and mirrors each one as a `tracing` event.
#[derive(Debug, Default, Clone)]
pub struct TraceBuffer {
    text: String,
}

impl TraceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}

impl TraceSink for TraceBuffer {
    fn append(&mut self, line: &str) {
        tracing::trace!(target: "query_revisor::trace", "{}", line);
        self.text.push_str(line);
        self.text.push('\n');
    }
}

impl fmt::Display for TraceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Formats and appends one line, e.g. `trace_line!(trace, "Form: {}", index)`.
#[macro_export]
macro_rules! trace_line {
    ($sink:expr, $($arg:tt)*) => {
        $crate::trace::TraceSink::append(&mut *$sink, &format!($($arg)*))
    };
}
