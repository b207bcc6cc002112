//! Scripted in-memory transport.
//!
//! Simulates a set of resources, per-command replies, a chunked file
//! transfer and injected faults, and records every primitive call so tests
//! can assert on command ordering.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use super::{SessionId, Status, Transport, resource_expr};

/// One recorded primitive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    OpenDefaultRm,
    FindResources(String),
    Open(String),
    Close(SessionId),
    Write(SessionId, String),
    Read(SessionId, usize),
}

#[derive(Debug, Clone, Copy)]
enum WriteFault {
    Status(Status),
    Short,
}

#[derive(Debug, Default)]
pub struct MockTransport {
    resources: Vec<(String, String)>,
    replies: HashMap<String, String>,
    settings: HashMap<String, String>,
    transfer: Vec<(Status, Vec<u8>)>,
    write_faults: HashMap<String, WriteFault>,
    open_faults: HashMap<String, Status>,
    next_handle: u32,
    rms: HashSet<SessionId>,
    sessions: HashMap<SessionId, String>,
    pending: HashMap<SessionId, VecDeque<(Status, Vec<u8>)>>,
    calls: Vec<Call>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mainframe with an N6781A in slot 1 and an N6731B in slot 2 whose
    /// log holds `samples` current readings.
    pub fn simulated_n6705b(samples: &[f32]) -> Self {
        Self::new()
            .with_resource(
                "TCPIP0::192.168.0.40::inst0::INSTR",
                "Keysight Technologies,34465A,MY57500000,A.03.01",
            )
            .with_resource(
                "USB0::0x0957::0x0F07::MY53004564::INSTR",
                "Agilent Technologies,N6705B,MY53004564,D.01.09",
            )
            .with_reply("SYST:CHAN?", "+4")
            .with_reply(
                "SYST:CHAN:MOD? (@1, 2, 3, 4)",
                "N6781A,N6731B,NONE,NONE",
            )
            .with_reply("SENS:DLOG:PER?", "+2.048000E-05")
            .with_file(&synthetic_dlog(samples))
    }

    pub fn with_resource(mut self, address: &str, idn: &str) -> Self {
        self.resources.push((address.to_string(), idn.to_string()));
        self
    }

    /// Reply sent for an exact query text on every session.
    pub fn with_reply(mut self, command: &str, reply: &str) -> Self {
        self.replies.insert(command.to_string(), format!("{reply}\n"));
        self
    }

    /// Serve `file` in response to `MMEM:DATA:DEF?`, split by the caller's
    /// read budget. `MMEM:ATTR?` reports its size unless overridden.
    pub fn with_file(mut self, file: &[u8]) -> Self {
        self.transfer = vec![(Status::SUCCESS, file.to_vec())];
        self.replies
            .entry(format!("MMEM:ATTR? \"{}\",\"FileSize\"", crate::dlog::DEFAULT_LOG_PATH))
            .or_insert_with(|| format!("\"{}\"\n", file.len()));
        self
    }

    /// Serve exactly these reads, with these statuses, for `MMEM:DATA:DEF?`.
    pub fn with_transfer(mut self, reads: Vec<(Status, Vec<u8>)>) -> Self {
        self.transfer = reads;
        self
    }

    pub fn fail_write(mut self, command: &str, status: Status) -> Self {
        self.write_faults
            .insert(command.to_string(), WriteFault::Status(status));
        self
    }

    /// Accept one byte less than sent for `command`.
    pub fn short_write(mut self, command: &str) -> Self {
        self.write_faults.insert(command.to_string(), WriteFault::Short);
        self
    }

    /// Complete `command` with a non-error status.
    pub fn write_status(self, command: &str, status: Status) -> Self {
        self.fail_write(command, status)
    }

    pub fn fail_open(mut self, address: &str, status: Status) -> Self {
        self.open_faults.insert(address.to_string(), status);
        self
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// Every command text written, in order, across all sessions.
    pub fn commands(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Write(_, text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Handles closed so far, in order.
    pub fn closed(&self) -> Vec<SessionId> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Close(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Address of every session still open.
    pub fn open_sessions(&self) -> Vec<String> {
        let mut open: Vec<String> = self.sessions.values().cloned().collect();
        open.sort();
        open
    }

    pub fn address_of(&self, session: SessionId) -> Option<&str> {
        self.sessions.get(&session).map(String::as_str)
    }

    fn allocate(&mut self) -> SessionId {
        self.next_handle += 1;
        SessionId(self.next_handle)
    }

    fn queue_reply(&mut self, session: SessionId, command: &str) {
        let queue = self.pending.entry(session).or_default();
        if command == "*IDN?" {
            let address = self.sessions.get(&session);
            let idn = self
                .resources
                .iter()
                .find(|(a, _)| Some(a) == address)
                .map(|(_, idn)| idn.clone())
                .unwrap_or_default();
            queue.push_back((Status::SUCCESS, format!("{idn}\n").into_bytes()));
        } else if command.starts_with("MMEM:DATA:DEF?") {
            queue.extend(self.transfer.iter().cloned());
        } else if let Some(reply) = self.replies.get(command) {
            queue.push_back((Status::SUCCESS, reply.clone().into_bytes()));
        } else if let Some(value) = echo(&self.settings, command) {
            queue.push_back((Status::SUCCESS, format!("{value}\n").into_bytes()));
        }
    }

    fn remember_setting(&mut self, command: &str) {
        if let Some((header, value)) = command.split_once(' ') {
            self.settings
                .insert(header.to_string(), value.trim().to_string());
        }
    }
}

/// Reply to `HEADER? ...` with the value last written by `HEADER value`.
fn echo(settings: &HashMap<String, String>, command: &str) -> Option<String> {
    let header = command.split(' ').next()?.strip_suffix('?')?;
    let value = settings.get(header)?;
    Some(value.split(',').next().unwrap_or(value).trim().to_string())
}

#[async_trait(?Send)]
impl Transport for MockTransport {
    async fn open_default_rm(&mut self) -> (Status, SessionId) {
        self.calls.push(Call::OpenDefaultRm);
        let rm = self.allocate();
        self.rms.insert(rm);
        (Status::SUCCESS, rm)
    }

    async fn find_resources(&mut self, rm: SessionId, expr: &str) -> (Status, Vec<String>) {
        self.calls.push(Call::FindResources(expr.to_string()));
        if !self.rms.contains(&rm) {
            return (Status::ERROR_INV_OBJECT, Vec::new());
        }
        let Ok(re) = resource_expr(expr) else {
            return (Status::ERROR_INV_RSRC_NAME, Vec::new());
        };
        let found: Vec<String> = self
            .resources
            .iter()
            .map(|(address, _)| address.clone())
            .filter(|address| re.is_match(address))
            .collect();
        if found.is_empty() {
            (Status::ERROR_RSRC_NFOUND, found)
        } else {
            (Status::SUCCESS, found)
        }
    }

    async fn open(&mut self, rm: SessionId, address: &str, _timeout: Duration) -> (Status, SessionId) {
        self.calls.push(Call::Open(address.to_string()));
        if !self.rms.contains(&rm) {
            return (Status::ERROR_INV_OBJECT, SessionId(0));
        }
        if let Some(status) = self.open_faults.get(address) {
            return (*status, SessionId(0));
        }
        if !self.resources.iter().any(|(a, _)| a == address) {
            return (Status::ERROR_RSRC_NFOUND, SessionId(0));
        }
        let vi = self.allocate();
        self.sessions.insert(vi, address.to_string());
        (Status::SUCCESS, vi)
    }

    async fn close(&mut self, handle: SessionId) -> Status {
        self.calls.push(Call::Close(handle));
        if self.sessions.remove(&handle).is_some() || self.rms.remove(&handle) {
            self.pending.remove(&handle);
            Status::SUCCESS
        } else {
            Status::ERROR_INV_OBJECT
        }
    }

    async fn write(&mut self, session: SessionId, data: &[u8]) -> (Status, usize) {
        let command = String::from_utf8_lossy(data).into_owned();
        self.calls.push(Call::Write(session, command.clone()));
        if !self.sessions.contains_key(&session) {
            return (Status::ERROR_INV_OBJECT, 0);
        }
        match self.write_faults.get(&command) {
            Some(WriteFault::Status(status)) if status.is_error() => return (*status, 0),
            Some(WriteFault::Short) => return (Status::SUCCESS, data.len().saturating_sub(1)),
            _ => {}
        }
        if command.contains('?') {
            self.queue_reply(session, &command);
        } else {
            self.remember_setting(&command);
        }
        let status = match self.write_faults.get(&command) {
            Some(WriteFault::Status(status)) => *status,
            _ => Status::SUCCESS,
        };
        (status, data.len())
    }

    async fn read(&mut self, session: SessionId, max: usize) -> (Status, Vec<u8>) {
        self.calls.push(Call::Read(session, max));
        if !self.sessions.contains_key(&session) {
            return (Status::ERROR_INV_OBJECT, Vec::new());
        }
        let Some(queue) = self.pending.get_mut(&session) else {
            return (Status::ERROR_TMO, Vec::new());
        };
        let Some((status, mut bytes)) = queue.pop_front() else {
            return (Status::ERROR_TMO, Vec::new());
        };
        if bytes.len() > max {
            let rest = bytes.split_off(max);
            queue.push_front((status, rest));
            return (Status::SUCCESS_MAX_CNT, bytes);
        }
        (status, bytes)
    }
}

/// Build a dlog file as the instrument sends it: an IEEE 488.2 definite
/// length block holding the XML header, an 8-byte prologue and big-endian
/// float samples, followed by a newline terminator.
pub fn synthetic_dlog(samples: &[f32]) -> Vec<u8> {
    let mut file = b"<?xml version=\"1.0\"?>\n<dlog>\n<frame>\n<sense_curr>1</sense_curr>\n</frame>\n</dlog>\n".to_vec();
    file.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x04]);
    for sample in samples {
        file.extend_from_slice(&sample.to_be_bytes());
    }
    let len = file.len().to_string();
    let mut block = format!("#{}{}", len.len(), len).into_bytes();
    block.extend_from_slice(&file);
    block.push(b'\n');
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_are_split_by_budget() {
        let mut mock = MockTransport::new()
            .with_resource("USB0::1::INSTR", "x")
            .with_file(&[7u8; 1100]);
        let (_, rm) = mock.open_default_rm().await;
        let (_, vi) = mock.open(rm, "USB0::1::INSTR", Duration::from_secs(1)).await;
        mock.write(vi, b"MMEM:DATA:DEF? \"x\"").await;

        let (s1, b1) = mock.read(vi, 512).await;
        let (s2, b2) = mock.read(vi, 512).await;
        let (s3, b3) = mock.read(vi, 512).await;
        assert_eq!((s1, b1.len()), (Status::SUCCESS_MAX_CNT, 512));
        assert_eq!((s2, b2.len()), (Status::SUCCESS_MAX_CNT, 512));
        assert_eq!((s3, b3.len()), (Status::SUCCESS, 76));
    }

    #[tokio::test]
    async fn settings_are_echoed_by_queries() {
        let mut mock = MockTransport::new().with_resource("USB0::1::INSTR", "x");
        let (_, rm) = mock.open_default_rm().await;
        let (_, vi) = mock.open(rm, "USB0::1::INSTR", Duration::from_secs(1)).await;
        mock.write(vi, b"VOLT:LEV 3,(@1,2)").await;
        mock.write(vi, b"VOLT:LEV? (@1)").await;
        let (_, reply) = mock.read(vi, 64).await;
        assert_eq!(reply, b"3\n");
    }

    #[test]
    fn synthetic_dlog_is_a_definite_length_block() {
        let block = synthetic_dlog(&[1.0, 2.0]);
        assert!(block.starts_with(b"#2"));
        let declared: usize = std::str::from_utf8(&block[2..4]).unwrap().parse().unwrap();
        assert_eq!(block.len(), 4 + declared + 1);
    }
}
