//! Error types for the acquisition pipeline.
//!
//! Every failure is fatal to the operation that raised it. Nothing here is
//! retried; recovery means calling `init`/`setup` again.

use thiserror::Error;

use crate::discovery::ModuleRole;
use crate::instrument::Phase;
use crate::transport::Status;

#[derive(Debug, Error)]
pub enum Error {
    // Transport faults
    #[error("transport error {status} during {operation}")]
    Transport { operation: String, status: Status },

    #[error("short write for {command:?}: {written} of {expected} bytes accepted")]
    ShortWrite {
        command: String,
        written: usize,
        expected: usize,
    },

    #[error("transfer aborted with status {status} after {received} bytes")]
    Transfer { status: Status, received: usize },

    // Discovery and resolution
    #[error("no instrument matching {pattern:?} among {scanned} resources")]
    DeviceNotFound { pattern: String, scanned: usize },

    #[error("no {role} module installed (modules: {installed})")]
    MissingModule { role: ModuleRole, installed: String },

    // Configuration
    #[error("sample period {requested_s}s is below the {floor_s}s hardware minimum")]
    SamplePeriodTooLow { requested_s: f64, floor_s: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{operation} is not allowed while the driver is {phase:?}")]
    InvalidState {
        operation: &'static str,
        phase: Phase,
    },

    // Instrument replies and files
    #[error("unexpected response to {command:?}: {response:?}")]
    Response { command: String, response: String },

    #[error("malformed dlog file: {0}")]
    MalformedFile(String),

    #[error("sample region of {len} bytes is not a whole number of 4-byte words ({trailing} trailing)")]
    Framing { len: usize, trailing: usize },
}

impl Error {
    pub(crate) fn transport(operation: impl Into<String>, status: Status) -> Self {
        Self::Transport {
            operation: operation.into(),
            status,
        }
    }

    pub(crate) fn response(command: impl Into<String>, response: impl Into<String>) -> Self {
        Self::Response {
            command: command.into(),
            response: response.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
