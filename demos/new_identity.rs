//! Example: manual and scheduled circuit rotation
//!
//! Run with: cargo run --example new_identity

use std::time::Duration;
use torwire::{ClientConfig, Result, TorClient};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ClientConfig::from_env().rotation_interval(Duration::from_secs(15));
    let client = TorClient::new(config)?;
    let session = client.session().await?;

    let before = session.circuit_status().await?;
    println!("Current circuits: {}", before.len());

    // The daemon coalesces NEWNYM requests arriving within ~10 seconds.
    println!("\nRequesting new identity...");
    client.new_identity().await?;

    tokio::time::sleep(Duration::from_secs(2)).await;
    let after = session.circuit_status().await?;
    println!("Circuits after NEWNYM: {}", after.len());
    for circuit in after.iter().take(5) {
        let path: Vec<String> = circuit.path.iter().map(|hop| hop.to_string()).collect();
        println!("  Circuit {}: {}", circuit.id, circuit.status);
        if !path.is_empty() {
            println!("    Path: {}", path.join(" -> "));
        }
    }

    println!("\nRotating every 15 seconds for one minute...");
    client.start_rotation()?;
    tokio::time::sleep(Duration::from_secs(60)).await;

    client.shutdown().await;
    println!("Done!");
    Ok(())
}
