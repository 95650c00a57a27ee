//! Example: provision and remove an onion service
//!
//! Run with: cargo run --example onion_service

use torwire::{ClientConfig, OnionServiceConfig, Result, TorClient};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let client = TorClient::new(ClientConfig::from_env())?;
    let services = client.hidden_services().await?;

    println!("Creating onion service...");
    let config = OnionServiceConfig::new().port(80, 8080).port(443, 8443);
    let service = services.provision(&config).await?;

    println!("Onion service created!");
    println!("  Address: {}", service.address());
    println!("  URL: http://{}", service.address());
    if service.private_key().is_some() {
        println!("  Private key returned (keep it to recreate the service)");
    }
    println!("  Active services: {:?}", services.status().await);

    println!("\nMake sure something listens on 127.0.0.1:8080");
    println!("Press Enter to delete the service and exit...");
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    services.deprovision(&service).await?;
    println!("Onion service deleted.");

    client.shutdown().await;
    Ok(())
}
