//! SCPI command layer over a [`Transport`] session.

use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{ReadOutcome, SessionId, Status, Transport};

/// Byte budget for a single query reply.
const MAX_READ: usize = 4096;

/// One piece of a multi-read response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub bytes: Vec<u8>,
    pub outcome: ReadOutcome,
}

/// Strictly sequential request/response access to one session.
///
/// Holding the `&mut` borrow of the transport for the whole exchange is what
/// keeps commands from overlapping on a session.
pub struct Scpi<'t, T: Transport + ?Sized> {
    transport: &'t mut T,
    session: SessionId,
}

impl<'t, T: Transport + ?Sized> Scpi<'t, T> {
    pub fn new(transport: &'t mut T, session: SessionId) -> Self {
        Self { transport, session }
    }

    /// Send one command; the whole text must be accepted.
    pub async fn write(&mut self, command: &str) -> Result<()> {
        debug!("SCPI write  -> {}", command);
        let (status, written) = self.transport.write(self.session, command.as_bytes()).await;
        check(status, || format!("write {command:?}"))?;
        if written != command.len() {
            return Err(Error::ShortWrite {
                command: command.to_string(),
                written,
                expected: command.len(),
            });
        }
        Ok(())
    }

    /// Send a command and read a single reply, trimmed of whitespace and NULs.
    ///
    /// Only one read is issued: compound replies longer than the read budget
    /// are not reassembled.
    pub async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        let (status, resp) = self.transport.read(self.session, MAX_READ).await;
        check(status, || format!("read reply to {command:?}"))?;
        let raw = String::from_utf8_lossy(&resp);
        let trimmed = raw.trim_matches(char::from(0)).trim().to_string();

        debug!("SCPI result <- {}", trimmed);

        if trimmed.is_empty() {
            return Err(Error::response(command, ""));
        }
        Ok(trimmed)
    }

    /// Send a query and parse the reply as a float.
    pub async fn query_f64(&mut self, command: &str) -> Result<f64> {
        let resp = self.query(command).await?;
        parse_f64(command, &resp)
    }

    /// Read up to `max` bytes of an in-flight response.
    ///
    /// Hard errors are reported through [`ReadOutcome::Error`] rather than
    /// as `Err`, so a draining loop can decide what to do with its buffer.
    pub async fn read_chunk(&mut self, max: usize) -> Chunk {
        let (status, bytes) = self.transport.read(self.session, max).await;
        let outcome = status.read_outcome();
        if status.is_informational() && outcome != ReadOutcome::More {
            debug!(status = %status, "informational read status");
        }
        Chunk { bytes, outcome }
    }
}

/// Fail on a hard error; log informational codes and carry on.
pub(crate) fn check(status: Status, operation: impl FnOnce() -> String) -> Result<()> {
    if status.is_error() {
        return Err(Error::transport(operation(), status));
    }
    if status.is_informational() {
        debug!(status = %status, "{}", operation());
    }
    Ok(())
}

pub(crate) fn parse_f64(command: &str, input: &str) -> Result<f64> {
    input
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::response(command, input))
}
