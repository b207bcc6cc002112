use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use n6705b_control::discovery;
use n6705b_control::dlog;
use n6705b_control::transport::mock::MockTransport;
use n6705b_control::transport::vxi11::{Endpoint, Vxi11Transport};
use n6705b_control::{AcquisitionConfig, DriverOptions, N6705b, SampleFormat, Transport};
use tokio::time::{sleep, timeout};
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, about = "Data-logged energy measurement with a Keysight N6705B")]
struct Cli {
    /// Instrument endpoint to consider; repeat for several instruments.
    #[arg(long = "host", value_name = "HOST[/DEVICE]", default_value = "192.168.0.232")]
    hosts: Vec<Endpoint>,

    /// Pattern matched against each instrument's *IDN? reply.
    #[arg(long, default_value = "N6705B")]
    model: String,

    /// Model fragment identifying the source module.
    #[arg(long, default_value = "N6781")]
    source_module: String,

    /// Model fragment identifying the meter module.
    #[arg(long, default_value = "N6731")]
    meter_module: String,

    /// Give up on discovery after this many seconds.
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,

    /// Talk to a simulated mainframe instead of the network.
    #[arg(long)]
    simulate: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every reachable instrument with its identity.
    Scan,
    /// Run one timed acquisition and summarise the logged current.
    Acquire(AcquireArgs),
}

#[derive(Debug, Args)]
struct AcquireArgs {
    /// Output voltage in volts.
    #[arg(long, default_value_t = 3.0)]
    voltage: f64,

    /// Sample rate in Hz (at most 50 kHz).
    #[arg(long, default_value_t = 1000.0)]
    rate: f64,

    /// Acquisition window in seconds.
    #[arg(long, default_value_t = 10.0)]
    duration: f64,

    /// Extra wait after the window before stopping, in seconds.
    #[arg(long, default_value_t = 1.0)]
    margin: f64,

    /// Also save the raw transfer to this file.
    #[arg(long, value_name = "FILE")]
    raw: Option<PathBuf>,

    /// How to print the leading samples.
    #[arg(long, value_enum, default_value_t = SampleFormat::Float)]
    format: SampleFormat,

    /// Number of leading samples to print.
    #[arg(long, default_value_t = 10)]
    show: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if cli.simulate {
        run(MockTransport::simulated_n6705b(&simulated_current(4000)), &cli).await
    } else {
        run(Vxi11Transport::new(cli.hosts.clone()), &cli).await
    }
}

async fn run<T: Transport>(mut transport: T, cli: &Cli) -> Result<()> {
    let connect_timeout = Duration::from_secs(cli.connect_timeout);
    match &cli.command {
        Command::Scan => {
            let (status, rm) = transport.open_default_rm().await;
            if status.is_error() {
                bail!("cannot open the resource manager: {status}");
            }
            let found = discovery::scan(&mut transport, rm, connect_timeout).await;
            transport.close(rm).await;
            let found = found?;
            if found.is_empty() {
                println!("No instruments found.");
            }
            for (address, idn) in found {
                println!("{idn}  {address}");
            }
            Ok(())
        }
        Command::Acquire(args) => {
            let options = DriverOptions::default()
                .with_model(&cli.model)?
                .with_modules(&cli.source_module, &cli.meter_module)?;
            let mut inst = N6705b::with_options(transport, options);

            let link = match timeout(connect_timeout, inst.init()).await {
                Ok(Ok(link)) => link.clone(),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => bail!(
                    "no {} answered within {} s; check power and network",
                    cli.model,
                    cli.connect_timeout
                ),
            };
            info!(
                "Using {} (source module in slot {}, meter module in slot {})",
                link.address, link.modules.source, link.modules.meter
            );

            let result = acquire(&mut inst, args).await;
            // Always leave the instrument with outputs off.
            let closed = inst.close().await;
            result?;
            closed.context("failed to close the instrument session")?;
            Ok(())
        }
    }
}

async fn acquire<T: Transport>(inst: &mut N6705b<T>, args: &AcquireArgs) -> Result<()> {
    let config = AcquisitionConfig::new(args.voltage, args.rate);
    let effective = inst.setup(&config).await.context("setup failed")?;
    let window_s = inst.time_acquire(args.duration).await?;

    inst.self_trigger().await?;
    let wait = Duration::try_from_secs_f64(window_s + args.margin)
        .with_context(|| format!("cannot wait {window_s} s + {} s", args.margin))?;
    info!("Acquiring for {:.3} s", wait.as_secs_f64());
    sleep(wait).await;
    inst.off().await?;

    let raw = inst.download().await.context("download failed")?;
    if let Some(path) = &args.raw {
        tokio::fs::write(path, &raw.bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Raw log saved to {}", path.display());
    }

    let samples = dlog::parse(raw.payload())?;
    println!("Total bytes sampled {}", samples.sample_bytes().len());
    println!("Total samples {}", samples.len());
    println!(
        "Voltage {} V, Period {} usec",
        effective.voltage_v,
        effective.period_s * 1e6
    );

    for index in 0..args.show.min(samples.len()) {
        if let Some(text) = samples.format_sample(index, args.format) {
            println!("{:>6} {:>12.8} s  {}", index, index as f64 * effective.period_s, text);
        }
    }

    let energy_j = energy_joules(samples.floats(), effective.voltage_v, effective.period_s);
    println!(
        "Energy {:.3} uJ over {:.3} s",
        energy_j * 1e6,
        samples.len() as f64 * effective.period_s
    );
    Ok(())
}

/// Rectangle-rule integral of V·I over the logged current samples.
fn energy_joules(current_a: impl Iterator<Item = f32>, voltage_v: f64, period_s: f64) -> f64 {
    current_a.map(|i| voltage_v * f64::from(i) * period_s).sum()
}

fn simulated_current(count: usize) -> Vec<f32> {
    (0..count)
        .map(|i| 2.0e-3 + 5.0e-4 * (i as f32 * 0.05).sin())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_is_voltage_current_time() {
        let energy = energy_joules([1.0f32, 1.0, 2.0].into_iter(), 3.0, 0.5);
        assert!((energy - 6.0).abs() < 1e-12);
    }

    #[test]
    fn cli_parses_repeated_hosts() {
        let cli = Cli::try_parse_from([
            "n6705b_control",
            "--host",
            "10.0.0.7",
            "--host",
            "10.0.0.8/hislip0",
            "--source-module",
            "N6762",
            "acquire",
            "--rate",
            "50000",
            "--format",
            "hex",
        ])
        .unwrap();
        assert_eq!(cli.hosts.len(), 2);
        assert_eq!(cli.hosts[1].device, "hislip0");
        assert_eq!(cli.source_module, "N6762");
        assert_eq!(cli.meter_module, "N6731");
        match cli.command {
            Command::Acquire(args) => {
                assert_eq!(args.rate, 50_000.0);
                assert_eq!(args.format, SampleFormat::Hex);
            }
            Command::Scan => panic!("expected acquire"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
