//! VXI-11 (LXI / `TCPIP::INSTR`) backend built on `tokio-vxi11`.
//!
//! VXI-11 has no broadcast discovery here, so the transport is given the
//! hosts to consider and "enumerates" exactly those.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_vxi11::DeviceClient;
use tracing::{debug, warn};

use super::{SessionId, Status, Transport, resource_expr};

/// A host plus its VXI-11 logical device name (usually `inst0`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub device: String,
}

impl Endpoint {
    pub fn new(host: &str, device: &str) -> Self {
        Self {
            host: host.to_string(),
            device: device.to_string(),
        }
    }

    /// VISA resource string for this endpoint.
    pub fn address(&self) -> String {
        format!("TCPIP0::{}::{}::INSTR", self.host, self.device)
    }

    /// Parse `TCPIP[n]::host[::device]::INSTR`.
    pub fn from_address(address: &str) -> Option<Self> {
        let parts: Vec<&str> = address.split("::").collect();
        let board = parts.first()?;
        if !board.to_uppercase().starts_with("TCPIP") {
            return None;
        }
        match parts.as_slice() {
            [_, host, class] if class.eq_ignore_ascii_case("INSTR") => {
                Some(Self::new(host, "inst0"))
            }
            [_, host, device, class] if class.eq_ignore_ascii_case("INSTR") => {
                Some(Self::new(host, device))
            }
            _ => None,
        }
    }
}

/// `host` or `host/device`, as accepted on the command line.
impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, device) = s.split_once('/').unwrap_or((s, "inst0"));
        if host.is_empty() || device.is_empty() {
            return Err(format!("invalid endpoint {s:?}, expected HOST or HOST/DEVICE"));
        }
        Ok(Self::new(host, device))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.device)
    }
}

pub struct Vxi11Transport {
    endpoints: Vec<Endpoint>,
    next_handle: u32,
    rms: HashSet<SessionId>,
    clients: HashMap<SessionId, DeviceClient>,
    /// Sessions whose last read filled the request.
    filled: HashSet<SessionId>,
}

impl Vxi11Transport {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            next_handle: 0,
            rms: HashSet::new(),
            clients: HashMap::new(),
            filled: HashSet::new(),
        }
    }

    fn allocate(&mut self) -> SessionId {
        self.next_handle += 1;
        SessionId(self.next_handle)
    }
}

#[async_trait(?Send)]
impl Transport for Vxi11Transport {
    async fn open_default_rm(&mut self) -> (Status, SessionId) {
        let rm = self.allocate();
        self.rms.insert(rm);
        (Status::SUCCESS, rm)
    }

    async fn find_resources(&mut self, rm: SessionId, expr: &str) -> (Status, Vec<String>) {
        if !self.rms.contains(&rm) {
            return (Status::ERROR_INV_OBJECT, Vec::new());
        }
        let Ok(re) = resource_expr(expr) else {
            return (Status::ERROR_INV_RSRC_NAME, Vec::new());
        };
        let found: Vec<String> = self
            .endpoints
            .iter()
            .map(Endpoint::address)
            .filter(|address| re.is_match(address))
            .collect();
        if found.is_empty() {
            (Status::ERROR_RSRC_NFOUND, found)
        } else {
            (Status::SUCCESS, found)
        }
    }

    async fn open(&mut self, rm: SessionId, address: &str, timeout: Duration) -> (Status, SessionId) {
        if !self.rms.contains(&rm) {
            return (Status::ERROR_INV_OBJECT, SessionId(0));
        }
        let Some(endpoint) = Endpoint::from_address(address) else {
            return (Status::ERROR_INV_RSRC_NAME, SessionId(0));
        };
        debug!("connecting to {} (timeout {:?})", endpoint, timeout);
        match DeviceClient::connect_with_timeout(&endpoint.host, &endpoint.device, timeout).await {
            Ok(client) => {
                let vi = self.allocate();
                self.clients.insert(vi, client);
                (Status::SUCCESS, vi)
            }
            Err(e) => {
                warn!("cannot open {}: {}", address, e);
                (Status::ERROR_RSRC_NFOUND, SessionId(0))
            }
        }
    }

    async fn close(&mut self, handle: SessionId) -> Status {
        if self.rms.remove(&handle) {
            return Status::SUCCESS;
        }
        self.filled.remove(&handle);
        let Some(mut client) = self.clients.remove(&handle) else {
            return Status::ERROR_INV_OBJECT;
        };
        match client.close().await {
            Ok(_) => Status::SUCCESS,
            Err(e) => {
                warn!("error closing session {}: {}", handle, e);
                Status::ERROR_IO
            }
        }
    }

    async fn write(&mut self, session: SessionId, data: &[u8]) -> (Status, usize) {
        let Some(client) = self.clients.get_mut(&session) else {
            return (Status::ERROR_INV_OBJECT, 0);
        };
        self.filled.remove(&session);
        match client.write(data).await {
            Ok(_) => (Status::SUCCESS, data.len()),
            Err(e) => {
                warn!("write on session {} failed: {}", session, e);
                (Status::ERROR_IO, 0)
            }
        }
    }

    async fn read(&mut self, session: SessionId, max: usize) -> (Status, Vec<u8>) {
        let Some(client) = self.clients.get_mut(&session) else {
            return (Status::ERROR_INV_OBJECT, Vec::new());
        };
        let request = u32::try_from(max).unwrap_or(u32::MAX);
        let after_fill = self.filled.remove(&session);
        let result = client.read(request).await.map(|bytes| bytes.to_vec());
        let (status, bytes) = read_status(session, max, after_fill, result);
        if status == Status::SUCCESS_MAX_CNT {
            self.filled.insert(session);
        }
        (status, bytes)
    }
}

/// Map a client read onto a VISA status.
///
/// The client does not surface the END reason, so a read that fills the
/// request is reported as having more data pending. When that guess was
/// wrong the next read finds nothing queued and fails once the device
/// times out; that failure is the end of the message, not an I/O error.
fn read_status<E: fmt::Display>(
    session: SessionId,
    max: usize,
    after_fill: bool,
    result: Result<Vec<u8>, E>,
) -> (Status, Vec<u8>) {
    match result {
        Ok(bytes) if bytes.len() >= max => (Status::SUCCESS_MAX_CNT, bytes),
        Ok(bytes) => (Status::SUCCESS, bytes),
        Err(e) if after_fill => {
            debug!("read on session {} ended after a full chunk: {}", session, e);
            (Status::SUCCESS, Vec::new())
        }
        Err(e) => {
            warn!("read on session {} failed: {}", session, e);
            (Status::ERROR_IO, Vec::new())
        }
    }
}
