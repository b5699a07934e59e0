use std::fmt;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Runtime,
}

/// One diagnostic. The message arrives fully formatted (`[line N] Error
/// ...` for compile errors, the message plus the frame trace for runtime
/// errors), so a sink only decides where it goes.
#[derive(Debug)]
pub struct Report {
    pub phase: Phase,
    pub message: String,
}

impl Report {
    pub fn new(phase: Phase, message: String) -> Self {
        Self { phase, message }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub trait Reporter {
    fn error(&mut self, report: Report);
}

/// Writes every diagnostic to stderr, the driver's reporter.
pub struct CliReporter;

impl Reporter for CliReporter {
    fn error(&mut self, report: Report) {
        if report.phase == Phase::Runtime {
            // Keep the program's own output ahead of the trace.
            let _ = std::io::stdout().flush();
        }
        eprintln!("{report}");
    }
}
