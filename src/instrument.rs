use regex::Regex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::discovery::{self, ModuleMap, ModulePatterns, case_insensitive};
use crate::dlog::{self, DEFAULT_LOG_PATH, RawLog, SampleStream};
use crate::error::{Error, Result};
use crate::protocol::{Scpi, check};
use crate::transport::{SessionId, Transport};

/// Shortest sample period the data logger supports.
pub const MIN_PERIOD_S: f64 = 20e-6;

/// Wait after switching the outputs off before reconfiguring the modules.
pub const OUTPUT_OFF_SETTLE: Duration = Duration::from_secs(3);
/// Wait after programming levels and protection, before enabling outputs.
pub const PROTECTION_SETTLE: Duration = Duration::from_secs(1);
/// Wait after programming the log period, before reading back the voltage.
pub const PERIOD_SETTLE: Duration = Duration::from_millis(500);

/// Requested operating point for one acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionConfig {
    pub voltage_v: f64,
    pub rate_hz: f64,
    /// Current limit programmed on the source module.
    pub source_current_limit_a: f64,
    /// Current level programmed on the meter module.
    pub meter_current_level_a: f64,
    /// Remote over-voltage protection on the source module.
    pub source_ovp_v: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            voltage_v: 3.0,
            rate_hz: 1000.0,
            source_current_limit_a: 0.2,
            meter_current_level_a: 0.5,
            source_ovp_v: 3.3,
        }
    }
}

impl AcquisitionConfig {
    pub fn new(voltage_v: f64, rate_hz: f64) -> Self {
        Self {
            voltage_v,
            rate_hz,
            ..Self::default()
        }
    }

    pub fn period_s(&self) -> f64 {
        1.0 / self.rate_hz
    }

    /// Check every requested value before anything is sent to the
    /// instrument.
    pub fn validate(&self) -> Result<()> {
        if !(self.rate_hz > 0.0 && self.rate_hz.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "sample rate must be positive, got {} Hz",
                self.rate_hz
            )));
        }
        let period = self.period_s();
        if period < MIN_PERIOD_S {
            return Err(Error::SamplePeriodTooLow {
                requested_s: period,
                floor_s: MIN_PERIOD_S,
            });
        }
        for (name, value) in [
            ("voltage", self.voltage_v),
            ("source current limit", self.source_current_limit_a),
            ("meter current level", self.meter_current_level_a),
            ("over-voltage protection", self.source_ovp_v),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Operating point confirmed by the instrument after `setup`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveConfig {
    pub voltage_v: f64,
    pub period_s: f64,
    /// Relative error of the voltage read back, in percent.
    pub voltage_deviation_pct: f64,
    /// Relative error of the period read back, in percent.
    pub period_deviation_pct: f64,
}

/// Driver-level settings that stay fixed across acquisitions.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Matched against each resource's `*IDN?` reply.
    pub model: Regex,
    pub modules: ModulePatterns,
    pub open_timeout: Duration,
    pub log_path: String,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            model: Regex::new("N6705B").expect("static regex"),
            modules: ModulePatterns::default(),
            open_timeout: Duration::from_millis(2000),
            log_path: DEFAULT_LOG_PATH.to_string(),
        }
    }
}

impl DriverOptions {
    pub fn with_model(mut self, model: &str) -> Result<Self> {
        self.model = case_insensitive(model)?;
        Ok(self)
    }

    /// Recognise the source and meter modules by these model fragments.
    pub fn with_modules(mut self, source: &str, meter: &str) -> Result<Self> {
        self.modules = ModulePatterns::new(source, meter)?;
        Ok(self)
    }
}

/// The instrument session a driver holds once discovery has succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub session: SessionId,
    pub address: String,
    pub modules: ModuleMap,
}

/// Externally visible lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Discovered,
    Configured,
    Acquiring,
    Stopped,
    Closed,
}

#[derive(Debug, Clone)]
enum State {
    Uninitialized,
    Discovered(Link),
    Configured(Link, EffectiveConfig),
    Acquiring(Link, EffectiveConfig, f64),
    Stopped(Link, Option<EffectiveConfig>),
    Closed,
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Uninitialized => Phase::Uninitialized,
            State::Discovered(_) => Phase::Discovered,
            State::Configured(..) => Phase::Configured,
            State::Acquiring(..) => Phase::Acquiring,
            State::Stopped(..) => Phase::Stopped,
            State::Closed => Phase::Closed,
        }
    }

    fn link(&self) -> Option<&Link> {
        match self {
            State::Discovered(link)
            | State::Configured(link, _)
            | State::Acquiring(link, _, _)
            | State::Stopped(link, _) => Some(link),
            State::Uninitialized | State::Closed => None,
        }
    }

    fn effective(&self) -> Option<EffectiveConfig> {
        match self {
            State::Configured(_, eff) | State::Acquiring(_, eff, _) => Some(*eff),
            State::Stopped(_, eff) => *eff,
            _ => None,
        }
    }

    fn window_s(&self) -> Option<f64> {
        match self {
            State::Acquiring(_, _, window) => Some(*window),
            _ => None,
        }
    }
}

/// Keysight N6705B mainframe driving an N6781A source/measure unit and an
/// N6731B supply for data-logged energy measurements.
///
/// Calls must be serialized by the caller: every method takes `&mut self`
/// and completes its write/read exchange before returning.
pub struct N6705b<T: Transport> {
    transport: T,
    options: DriverOptions,
    rm: Option<SessionId>,
    state: State,
}

impl<T: Transport> N6705b<T> {
    pub fn new(transport: T) -> Self {
        Self::with_options(transport, DriverOptions::default())
    }

    pub fn with_options(transport: T, options: DriverOptions) -> Self {
        Self {
            transport,
            options,
            rm: None,
            state: State::Uninitialized,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn link(&self) -> Option<&Link> {
        self.state.link()
    }

    pub fn modules(&self) -> Option<ModuleMap> {
        self.state.link().map(|link| link.modules)
    }

    pub fn effective(&self) -> Option<EffectiveConfig> {
        self.state.effective()
    }

    /// Acquisition window confirmed by `time_acquire`, while armed.
    pub fn window_s(&self) -> Option<f64> {
        self.state.window_s()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Find the mainframe and its two modules.
    ///
    /// Any session held from a previous `init` is torn down first, so
    /// calling this again starts from a clean slate.
    pub async fn init(&mut self) -> Result<&Link> {
        debug!("init");
        self.teardown().await?;

        let rm = match self.rm {
            Some(rm) => rm,
            None => {
                let (status, rm) = self.transport.open_default_rm().await;
                check(status, || "open default resource manager".to_string())?;
                self.rm = Some(rm);
                rm
            }
        };

        let (session, address) = discovery::discover(
            &mut self.transport,
            rm,
            &self.options.model,
            self.options.open_timeout,
        )
        .await?;

        let resolved = {
            let mut scpi = Scpi::new(&mut self.transport, session);
            discovery::resolve_modules(&mut scpi, &self.options.modules).await
        };
        let modules = match resolved {
            Ok(modules) => modules,
            Err(e) => {
                self.transport.close(session).await;
                return Err(e);
            }
        };

        self.state = State::Discovered(Link {
            session,
            address,
            modules,
        });
        self.link().ok_or(Error::InvalidState {
            operation: "init",
            phase: Phase::Uninitialized,
        })
    }

    /// Program the modules and the data logger, then read back what the
    /// instrument actually applied.
    ///
    /// The requested configuration is validated before any command is sent.
    /// Includes three fixed settle delays totalling 4.5 s.
    pub async fn setup(&mut self, config: &AcquisitionConfig) -> Result<EffectiveConfig> {
        debug!("setup");
        config.validate()?;
        let link = self.require_link("setup")?;
        let ModuleMap { source, meter } = link.modules;
        // *RST discards any earlier configuration.
        self.state = State::Discovered(link.clone());
        let mut scpi = Scpi::new(&mut self.transport, link.session);

        scpi.write("*RST;*CLS").await?;
        scpi.write("OUTP OFF,(@1,2)").await?;
        sleep(OUTPUT_OFF_SETTLE).await;

        scpi.write(&format!("EMUL PS2Q,(@{source})")).await?;
        scpi.write(&format!("FUNC VOLT,(@{source})")).await?;
        scpi.write(&format!("VOLT:LEV {},(@1,2)", config.voltage_v)).await?;
        // The source module is limited, the meter module is levelled.
        scpi.write(&format!("CURR:LIM {},(@{source})", config.source_current_limit_a)).await?;
        scpi.write(&format!("CURR:LEV {},(@{meter})", config.meter_current_level_a)).await?;
        scpi.write(&format!("VOLT:PROT:REM {},(@{source})", config.source_ovp_v)).await?;
        sleep(PROTECTION_SETTLE).await;

        scpi.write("OUTP ON,(@1,2)").await?;

        // Log current on the combined rail only.
        scpi.write("SENS:DLOG:FUNC:CURR ON,(@1)").await?;
        scpi.write("SENS:DLOG:FUNC:VOLT OFF,(@1)").await?;
        scpi.write("SENS:DLOG:FUNC:CURR OFF,(@2)").await?;
        scpi.write("SENS:DLOG:FUNC:VOLT OFF,(@2)").await?;
        scpi.write("SENS:DLOG:CURR:RANG:AUTO ON,(@1)").await?;
        scpi.write("SENS:DLOG:VOLT:RANG:AUTO ON,(@1)").await?;

        let requested_period = format!("{:.5}", config.period_s());
        scpi.write(&format!("SENS:DLOG:PER {requested_period}")).await?;
        let period_s = scpi.query_f64("SENS:DLOG:PER?").await?;
        let requested_period_s: f64 = requested_period.parse().unwrap_or(config.period_s());
        let period_deviation_pct = deviation_pct(period_s, requested_period_s);
        info!(
            "Requested period {}s, actual period {}s {:.3}%",
            requested_period, period_s, period_deviation_pct
        );

        sleep(PERIOD_SETTLE).await;

        let voltage_v = scpi.query_f64("VOLT:LEV? (@1)").await?;
        let voltage_deviation_pct = deviation_pct(voltage_v, config.voltage_v);
        info!(
            "Requested voltage {}V, actual voltage {}V {:.3}%",
            config.voltage_v, voltage_v, voltage_deviation_pct
        );

        let effective = EffectiveConfig {
            voltage_v,
            period_s,
            voltage_deviation_pct,
            period_deviation_pct,
        };
        self.state = State::Configured(link, effective);
        Ok(effective)
    }

    /// Arm a bus-triggered timed acquisition into the log file.
    ///
    /// Returns the duration the instrument accepted.
    pub async fn time_acquire(&mut self, duration_s: f64) -> Result<f64> {
        debug!("time_acquire");
        if !(duration_s > 0.0 && duration_s.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "acquisition time must be positive, got {duration_s} s"
            )));
        }
        let State::Configured(link, effective) = self.state.clone() else {
            return Err(self.invalid("time_acquire"));
        };
        let mut scpi = Scpi::new(&mut self.transport, link.session);

        scpi.write("TRIG:DLOG:SOUR BUS").await?;
        scpi.write(&format!("SENS:DLOG:TIME {duration_s}")).await?;
        let actual_s = scpi.query_f64("SENS:DLOG:TIME?").await?;
        if actual_s != duration_s {
            debug!("Requested duration {}s, actual duration {}s", duration_s, actual_s);
        }
        scpi.write(&format!("INIT:DLOG \"{}\"", self.options.log_path)).await?;

        self.state = State::Acquiring(link, effective, actual_s);
        Ok(actual_s)
    }

    /// Start the armed acquisition window.
    ///
    /// The driver does not wait for the window to elapse; the caller must
    /// let at least the confirmed duration pass before calling [`off`] or
    /// [`download`].
    ///
    /// [`off`]: Self::off
    /// [`download`]: Self::download
    pub async fn self_trigger(&mut self) -> Result<()> {
        debug!("self_trigger");
        let State::Acquiring(link, ..) = &self.state else {
            return Err(self.invalid("self_trigger"));
        };
        let session = link.session;
        Scpi::new(&mut self.transport, session).write("*TRG").await
    }

    /// Switch both outputs off. Does nothing when no session is held.
    pub async fn off(&mut self) -> Result<()> {
        debug!("off");
        let Some(link) = self.state.link().cloned() else {
            debug!("off: no session, nothing to do");
            return Ok(());
        };
        Scpi::new(&mut self.transport, link.session)
            .write("OUTP OFF,(@1,2)")
            .await?;
        self.state = match std::mem::replace(&mut self.state, State::Uninitialized) {
            State::Configured(link, eff) | State::Acquiring(link, eff, _) => {
                State::Stopped(link, Some(eff))
            }
            other => other,
        };
        Ok(())
    }

    /// Retrieve the raw log file. Outputs are switched off first.
    pub async fn download(&mut self) -> Result<RawLog> {
        debug!("download");
        if self.state.link().is_none() {
            return Err(self.invalid("download"));
        }
        self.off().await?;
        let link = self.require_link("download")?;
        let mut scpi = Scpi::new(&mut self.transport, link.session);
        let raw = dlog::download(&mut scpi, &self.options.log_path).await?;
        if raw.len() as i64 > i64::from(raw.reported_size) {
            debug!(
                "received {} bytes, {} more than the reported file size",
                raw.len(),
                raw.len() as i64 - i64::from(raw.reported_size)
            );
        }
        Ok(raw)
    }

    /// Download the log and decode its sample words.
    pub async fn download_samples(&mut self) -> Result<SampleStream> {
        let raw = self.download().await?;
        dlog::parse(raw.payload())
    }

    /// Switch the outputs off and release the session and the resource
    /// manager. Safe to call in any phase, including before `init`.
    pub async fn close(&mut self) -> Result<()> {
        debug!("close");
        let result = self.teardown().await;
        if let Some(rm) = self.rm.take() {
            let status = self.transport.close(rm).await;
            if status.is_error() {
                warn!("closing resource manager returned {}", status);
            }
        }
        self.state = State::Closed;
        result
    }

    /// Release the instrument session, if any. Outputs are forced off
    /// first; the session is closed even when that fails.
    async fn teardown(&mut self) -> Result<()> {
        let Some(link) = self.state.link().cloned() else {
            self.state = State::Uninitialized;
            return Ok(());
        };
        let off = self.off().await;
        let status = self.transport.close(link.session).await;
        self.state = State::Uninitialized;
        off?;
        check(status, || format!("close {}", link.address))
    }

    fn require_link(&self, operation: &'static str) -> Result<Link> {
        self.state.link().cloned().ok_or_else(|| self.invalid(operation))
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            phase: self.phase(),
        }
    }
}

fn deviation_pct(actual: f64, requested: f64) -> f64 {
    (actual / requested - 1.0) * 100.0
}
