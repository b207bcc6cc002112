use std::time::Duration;

use anyhow::Result;
use n6705b_control::transport::vxi11::{Endpoint, Vxi11Transport};
use n6705b_control::{AcquisitionConfig, N6705b};
use tokio::time::{sleep, timeout};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let host = args.get(1).map(String::as_str).unwrap_or("192.168.0.232");
    let device = args.get(2).map(String::as_str).unwrap_or("inst0");

    let mut inst = N6705b::new(Vxi11Transport::new(vec![Endpoint::new(host, device)]));
    match timeout(Duration::from_secs(5), inst.init()).await {
        Ok(Ok(link)) => println!("Found {}", link.address),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            eprintln!("No N6705B answered within 5 s; check power and network.");
            return Ok(());
        }
    }

    // 3 V at 1 kHz for two seconds.
    let effective = inst.setup(&AcquisitionConfig::new(3.0, 1000.0)).await?;
    let window_s = inst.time_acquire(2.0).await?;
    inst.self_trigger().await?;
    sleep(Duration::from_secs_f64(window_s + 1.0)).await;
    inst.off().await?;

    let samples = inst.download_samples().await?;
    println!("Total samples {}", samples.len());
    for (index, amps) in samples.floats().take(5).enumerate() {
        println!("{:>4} {:>10.6} s  {:e} A", index, index as f64 * effective.period_s, amps);
    }

    inst.close().await?;
    Ok(())
}
