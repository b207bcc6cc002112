use std::time::Duration;

use anyhow::{Result, bail};
use n6705b_control::Transport;
use n6705b_control::discovery;
use n6705b_control::transport::vxi11::{Endpoint, Vxi11Transport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut hosts = std::env::args()
        .skip(1)
        .map(|arg| arg.parse::<Endpoint>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;
    if hosts.is_empty() {
        hosts.push(Endpoint::new("192.168.0.232", "inst0"));
    }

    let mut transport = Vxi11Transport::new(hosts);
    let (status, rm) = transport.open_default_rm().await;
    if status.is_error() {
        bail!("cannot open the resource manager: {status}");
    }
    let found = discovery::scan(&mut transport, rm, Duration::from_secs(2)).await;
    transport.close(rm).await;

    for (address, idn) in found? {
        println!("{idn}  {address}");
    }
    Ok(())
}
