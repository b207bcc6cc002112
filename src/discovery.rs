//! Instrument discovery and module-slot resolution.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{Scpi, check};
use crate::transport::{SessionId, Status, Transport};

/// Wildcard expression selecting every instrument resource.
pub const ALL_INSTRUMENTS: &str = "?*INSTR";

/// 1-based slot index of a module in the mainframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(pub u8);

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleRole {
    /// Two-quadrant source/measure unit (N6781A).
    Source,
    /// Supply module used as the meter-side rail (N6731B).
    Meter,
}

impl fmt::Display for ModuleRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleRole::Source => f.write_str("source"),
            ModuleRole::Meter => f.write_str("meter"),
        }
    }
}

/// Slots assigned to each logical role for one initialized session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleMap {
    pub source: Slot,
    pub meter: Slot,
}

/// Name patterns used to recognise the two modules.
#[derive(Debug, Clone)]
pub struct ModulePatterns {
    pub source: Regex,
    pub meter: Regex,
}

impl ModulePatterns {
    /// Case-insensitive patterns from plain model fragments.
    pub fn new(source: &str, meter: &str) -> Result<Self> {
        Ok(Self {
            source: case_insensitive(source)?,
            meter: case_insensitive(meter)?,
        })
    }
}

impl Default for ModulePatterns {
    fn default() -> Self {
        Self {
            source: Regex::new("(?i)n6781").expect("static regex"),
            meter: Regex::new("(?i)n6731").expect("static regex"),
        }
    }
}

pub(crate) fn case_insensitive(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("(?i){pattern}"))
        .map_err(|e| Error::InvalidConfig(format!("bad pattern {pattern:?}: {e}")))
}

/// Enumerate the resources known to `rm`, treating "nothing found" as an
/// empty list rather than an error.
pub async fn list_resources<T: Transport + ?Sized>(
    transport: &mut T,
    rm: SessionId,
    expr: &str,
) -> Result<Vec<String>> {
    let (status, found) = transport.find_resources(rm, expr).await;
    if status == Status::ERROR_RSRC_NFOUND {
        return Ok(Vec::new());
    }
    check(status, || format!("find resources {expr:?}"))?;
    Ok(found)
}

/// Open each resource in enumeration order and keep the first whose
/// `*IDN?` reply matches `model`. Non-matching sessions are closed before
/// the next address is tried.
pub async fn discover<T: Transport + ?Sized>(
    transport: &mut T,
    rm: SessionId,
    model: &Regex,
    open_timeout: Duration,
) -> Result<(SessionId, String)> {
    let addresses = list_resources(transport, rm, ALL_INSTRUMENTS).await?;
    for address in &addresses {
        let (status, vi) = transport.open(rm, address, open_timeout).await;
        check(status, || format!("open {address}"))?;

        let idn = match Scpi::new(transport, vi).query("*IDN?").await {
            Ok(idn) => idn,
            Err(e) => {
                transport.close(vi).await;
                return Err(e);
            }
        };
        debug!("Address {} -> {}", address, idn);

        if model.is_match(&idn) {
            info!("Using the first {} found at {}", model, address);
            return Ok((vi, address.clone()));
        }
        let status = transport.close(vi).await;
        check(status, || format!("close {address}"))?;
    }
    Err(Error::DeviceNotFound {
        pattern: model.to_string(),
        scanned: addresses.len(),
    })
}

/// Map the installed modules of the mainframe onto the source and meter
/// roles. When several entries match a pattern the last one wins.
pub async fn resolve_modules<T: Transport + ?Sized>(
    scpi: &mut Scpi<'_, T>,
    patterns: &ModulePatterns,
) -> Result<ModuleMap> {
    let count_reply = scpi.query("SYST:CHAN?").await?;
    let count = count_reply
        .trim()
        .parse::<u8>()
        .map_err(|_| Error::response("SYST:CHAN?", count_reply.clone()))?;
    let channels = (1..=count)
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let installed = scpi.query(&format!("SYST:CHAN:MOD? (@{channels})")).await?;
    let map = assign_modules(&installed, patterns)?;
    debug!("{} module is in slot {}", ModuleRole::Source, map.source);
    debug!("{} module is in slot {}", ModuleRole::Meter, map.meter);
    Ok(map)
}

fn assign_modules(installed: &str, patterns: &ModulePatterns) -> Result<ModuleMap> {
    static SEPARATORS: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[,\s]+").expect("static regex"));
    let mut source = None;
    let mut meter = None;
    for (index, name) in SEPARATORS.split(installed.trim()).enumerate() {
        let slot = Slot(u8::try_from(index + 1).unwrap_or(u8::MAX));
        if patterns.source.is_match(name) {
            source = Some(slot);
        } else if patterns.meter.is_match(name) {
            meter = Some(slot);
        }
    }
    match (source, meter) {
        (Some(source), Some(meter)) => Ok(ModuleMap { source, meter }),
        (None, _) => Err(Error::MissingModule {
            role: ModuleRole::Source,
            installed: installed.trim().to_string(),
        }),
        (_, None) => Err(Error::MissingModule {
            role: ModuleRole::Meter,
            installed: installed.trim().to_string(),
        }),
    }
}

/// Identify every reachable resource, closing each session afterwards.
pub async fn scan<T: Transport + ?Sized>(
    transport: &mut T,
    rm: SessionId,
    open_timeout: Duration,
) -> Result<Vec<(String, String)>> {
    let mut found = Vec::new();
    for address in list_resources(transport, rm, ALL_INSTRUMENTS).await? {
        let (status, vi) = transport.open(rm, &address, open_timeout).await;
        check(status, || format!("open {address}"))?;
        let idn = Scpi::new(transport, vi).query("*IDN?").await;
        transport.close(vi).await;
        found.push((address, idn?));
    }
    Ok(found)
}
