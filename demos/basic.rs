//! Example: connect, authenticate and inspect the daemon
//!
//! Reads endpoints and credentials from TOR_CONTROL_ADDR, TOR_CONTROL_PASSWORD
//! and TOR_COOKIE_PATH. With no credentials the cookie is discovered.
//!
//! Run with: cargo run --example basic

use torwire::{ClientConfig, Result, TorClient};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let client = TorClient::new(ClientConfig::from_env())?;

    println!("Connecting to {}...", client.config().control_addr);
    let session = client.session().await?;
    println!("Authenticated!");

    let version = session.get_version().await?;
    println!("\nTor version: {}", version);

    if let Ok(read) = session.get_info("traffic/read").await {
        println!("Traffic read: {} bytes", read);
    }
    if let Ok(written) = session.get_info("traffic/written").await {
        println!("Traffic written: {} bytes", written);
    }

    let circuits = session.circuit_status().await?;
    println!("\nActive circuits: {}", circuits.len());
    for circuit in circuits.iter().take(5) {
        println!(
            "  Circuit {}: {} ({} hops)",
            circuit.id,
            circuit.status,
            circuit.path.len()
        );
    }

    let streams = session.stream_status().await?;
    println!("Open streams: {}", streams.len());

    client.shutdown().await;
    println!("\nDisconnected.");
    Ok(())
}
