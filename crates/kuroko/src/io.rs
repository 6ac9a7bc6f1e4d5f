//! Print output plumbing.
//!
//! Managed `print()` never touches stdout directly; it writes through a
//! `PrintWriter` chosen when the VM is built. Hosts capture or suppress
//! output by swapping the writer.

use std::io::{self, Write as _};

/// Trait for handling output from the `print()` builtin.
pub trait PrintWriter {
    /// Writes one formatted argument, without separators or terminator.
    fn write_str(&mut self, output: &str);

    /// Writes a single separator or terminator character.
    fn write_char(&mut self, c: char);
}

/// Default writer: line-buffered stdout.
#[derive(Debug, Default)]
pub struct StdPrint {
    buffer: String,
}

impl PrintWriter for StdPrint {
    fn write_str(&mut self, output: &str) {
        self.buffer.push_str(output);
    }

    fn write_char(&mut self, c: char) {
        self.buffer.push(c);
        if c == '\n' {
            let _ = io::stdout().write_all(self.buffer.as_bytes());
            let _ = io::stdout().flush();
            self.buffer.clear();
        }
    }
}

impl Drop for StdPrint {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            let _ = io::stdout().write_all(self.buffer.as_bytes());
            let _ = io::stdout().flush();
        }
    }
}

/// Collects all output into a string. Useful for tests and for capturing
/// print output programmatically.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_str(&mut self, output: &str) {
        self.0.push_str(output);
    }

    fn write_char(&mut self, c: char) {
        self.0.push(c);
    }
}

/// Ignores all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write_str(&mut self, _output: &str) {}

    fn write_char(&mut self, _c: char) {}
}
