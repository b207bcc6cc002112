//! Message-based instrument transport.
//!
//! The acquisition core only ever talks to an instrument through the
//! [`Transport`] trait: a VISA-shaped set of primitives (open the default
//! resource manager, enumerate, open, close, write, read) that each report a
//! [`Status`] word. Concrete backends live in the submodules.

pub mod mock;
pub mod vxi11;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Completion code reported by every transport primitive.
///
/// Bit 31 marks a hard error. Any other non-zero value is informational:
/// it must not abort the caller, but it is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    /// The last read ended because a terminator character was seen.
    pub const SUCCESS_TERM_CHAR: Status = Status(0x3FFF_0005);
    /// The last read filled the requested byte count; more data is pending.
    pub const SUCCESS_MAX_CNT: Status = Status(0x3FFF_0006);

    pub const ERROR_INV_OBJECT: Status = Status(0xBFFF_000E);
    pub const ERROR_RSRC_NFOUND: Status = Status(0xBFFF_0011);
    pub const ERROR_INV_RSRC_NAME: Status = Status(0xBFFF_0012);
    pub const ERROR_TMO: Status = Status(0xBFFF_0015);
    pub const ERROR_IO: Status = Status(0xBFFF_003E);

    const ERROR_BIT: u32 = 0x8000_0000;

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR_BIT != 0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Non-zero, non-error completion codes.
    pub fn is_informational(self) -> bool {
        !self.is_error() && !self.is_success()
    }

    /// Classify the status of a read for a multi-chunk transfer.
    pub fn read_outcome(self) -> ReadOutcome {
        if self.is_error() {
            ReadOutcome::Error(self)
        } else if self == Self::SUCCESS_MAX_CNT {
            ReadOutcome::More
        } else {
            ReadOutcome::End
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Three-way result of one read in a draining loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The transport has more bytes queued for this response.
    More,
    /// The response is complete.
    End,
    /// The read failed with a hard error.
    Error(Status),
}

/// Opaque handle to a resource manager or an open instrument session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Primitive operations of an instrument transport driver.
///
/// Every call returns the raw completion [`Status`]; interpreting it is the
/// job of [`crate::protocol::Scpi`] and the discovery helpers. A session is
/// owned by exactly one driver and never shared across tasks, so futures
/// are not required to be `Send`.
#[async_trait(?Send)]
pub trait Transport {
    /// Open the process-wide resource manager.
    async fn open_default_rm(&mut self) -> (Status, SessionId);

    /// List the resource addresses matching a VISA-style wildcard expression.
    async fn find_resources(&mut self, rm: SessionId, expr: &str) -> (Status, Vec<String>);

    /// Open a session to one resource address.
    async fn open(&mut self, rm: SessionId, address: &str, timeout: Duration) -> (Status, SessionId);

    /// Close a session or resource manager handle.
    async fn close(&mut self, handle: SessionId) -> Status;

    /// Write raw bytes; returns the number of bytes accepted.
    async fn write(&mut self, session: SessionId, data: &[u8]) -> (Status, usize);

    /// Read at most `max` bytes.
    async fn read(&mut self, session: SessionId, max: usize) -> (Status, Vec<u8>);
}

/// Translate a VISA resource expression into an anchored regular expression.
///
/// `?` matches any single character and `*` repeats the previous token, so
/// `?*INSTR` selects every instrument resource.
pub(crate) fn resource_expr(expr: &str) -> Result<regex::Regex, regex::Error> {
    let mut pattern = String::from("(?i)^");
    for c in expr.chars() {
        match c {
            '?' => pattern.push('.'),
            '*' => pattern.push('*'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    regex::Regex::new(&pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(Status::SUCCESS.is_success());
        assert!(!Status::SUCCESS.is_informational());
        assert!(Status::SUCCESS_MAX_CNT.is_informational());
        assert!(Status::ERROR_TMO.is_error());
        assert!(!Status::ERROR_TMO.is_informational());
    }

    #[test]
    fn read_outcome_is_three_way() {
        assert_eq!(Status::SUCCESS_MAX_CNT.read_outcome(), ReadOutcome::More);
        assert_eq!(Status::SUCCESS.read_outcome(), ReadOutcome::End);
        assert_eq!(Status::SUCCESS_TERM_CHAR.read_outcome(), ReadOutcome::End);
        assert_eq!(
            Status::ERROR_IO.read_outcome(),
            ReadOutcome::Error(Status::ERROR_IO)
        );
    }

    #[test]
    fn status_display_is_hex() {
        assert_eq!(Status::ERROR_TMO.to_string(), "0xBFFF0015");
    }

    #[test]
    fn wildcard_expression() {
        let re = resource_expr("?*INSTR").unwrap();
        assert!(re.is_match("TCPIP0::192.168.0.10::inst0::INSTR"));
        assert!(re.is_match("USB0::0x0957::0x0F07::MY53004564::INSTR"));
        assert!(!re.is_match("ASRL1::INSTR::EXTRA"));
        assert!(!re.is_match("TCPIP0::10.0.0.1::5025::SOCKET"));
    }
}
