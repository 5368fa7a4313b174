//! Output-on-failure reporting for captured process output.
//!
//! A scenario takes a [`ReportGuard`] as soon as its process is running and
//! hands the guard its final result with [`ReportGuard::conclude`]. The
//! captured output is written only when that result is an error, or when the
//! guard is dropped without ever being concluded (early return, panic).

use crate::supervisor::OutputBuffer;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tracing::warn;

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writes captured process output to a sink when a scenario fails.
#[derive(Clone)]
pub struct DiagnosticReporter {
    sink: Sink,
}

impl fmt::Debug for DiagnosticReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticReporter").finish_non_exhaustive()
    }
}

impl Default for DiagnosticReporter {
    fn default() -> Self {
        Self::stderr()
    }
}

impl DiagnosticReporter {
    /// Reporter writing to standard error.
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// Reporter writing to an arbitrary sink.
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    /// Starts watching `output`; report-on-exit is armed until concluded.
    pub fn watch(&self, label: impl Into<String>, output: OutputBuffer) -> ReportGuard {
        ReportGuard {
            reporter: self.clone(),
            label: label.into(),
            output,
            pending: true,
        }
    }

    fn emit(&self, label: &str, output: &OutputBuffer, reason: &str) {
        let contents = output.contents();
        let mut sink = self.sink.lock().unwrap_or_else(|err| err.into_inner());
        let result = write_report(&mut **sink, label, &contents, reason);
        if let Err(err) = result {
            warn!(label, error = %err, "failed to write captured output");
        }
    }
}

fn write_report(sink: &mut dyn Write, label: &str, contents: &str, reason: &str) -> io::Result<()> {
    writeln!(sink, "==== {label} output ({reason}) ====")?;
    sink.write_all(contents.as_bytes())?;
    if !contents.is_empty() && !contents.ends_with('\n') {
        writeln!(sink)?;
    }
    writeln!(sink, "==== end of {label} output ====")?;
    sink.flush()
}

/// Scoped report-on-exit for one captured output.
#[must_use = "dropping the guard immediately reports the output"]
pub struct ReportGuard {
    reporter: DiagnosticReporter,
    label: String,
    output: OutputBuffer,
    pending: bool,
}

impl fmt::Debug for ReportGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportGuard")
            .field("label", &self.label)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl ReportGuard {
    /// Settles the guard with the scenario's outcome.
    ///
    /// Emits the captured output if `outcome` is an error. Returns whether
    /// anything was emitted.
    pub fn conclude<T, E: fmt::Display>(mut self, outcome: &Result<T, E>) -> bool {
        self.pending = false;
        match outcome {
            Ok(_) => false,
            Err(err) => {
                self.reporter
                    .emit(&self.label, &self.output, &format!("failed: {err}"));
                true
            }
        }
    }
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        if self.pending {
            self.reporter
                .emit(&self.label, &self.output, "scenario did not complete");
        }
    }
}
