//! Monitoring plugin status vocabulary.
//!
//! The supervisor reads the exit code and the single `<STATUS> - <message>`
//! line on stdout. Codes follow the usual plugin convention.

use std::fmt;

use crate::error::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl Status {
    pub fn exit_code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Warning => 1,
            Status::Critical => 2,
            Status::Unknown => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::Critical => "CRITICAL",
            Status::Unknown => "UNKNOWN",
        }
    }
}

/// Final result of one probe run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: Status,
    pub message: String,
}

impl Outcome {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(Status::Ok, message)
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(Status::Critical, message)
    }

    /// Print the status line and exit the process.
    pub fn terminate(&self) -> ! {
        println!("{}", self);
        std::process::exit(self.status.exit_code());
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.status.label(), self.message)
    }
}

impl From<ProbeError> for Outcome {
    fn from(e: ProbeError) -> Self {
        Outcome::critical(e.to_string())
    }
}
