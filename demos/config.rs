//! Example: read and modify the daemon's live configuration
//!
//! Uses GETCONF, SETCONF, RESETCONF and MAPADDRESS over the shared session.
//!
//! Run with: cargo run --example config

use torwire::{ClientConfig, Result, TorClient};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("torwire=debug"))
        .init();

    let client = TorClient::new(ClientConfig::from_env())?;
    let session = client.session().await?;

    println!("=== Reading Configuration ===\n");
    for key in ["SocksPort", "ControlPort", "DataDirectory"] {
        println!("{}: {:?}", key, session.get_conf(key).await?);
    }

    println!("\n=== Modifying Configuration ===\n");
    let original = session.get_conf("MaxCircuitDirtiness").await?;
    println!("Original MaxCircuitDirtiness: {:?}", original);

    session.set_conf("MaxCircuitDirtiness", "600").await?;
    println!(
        "New MaxCircuitDirtiness: {:?}",
        session.get_conf("MaxCircuitDirtiness").await?
    );

    session.reset_conf("MaxCircuitDirtiness").await?;
    println!(
        "Default MaxCircuitDirtiness: {:?}",
        session.get_conf("MaxCircuitDirtiness").await?
    );

    println!("\n=== Address Mapping ===\n");
    let (from, to) = session.map_address("0.0.0.0", "example.com").await?;
    println!("{} -> {}", from, to);

    println!("\n=== Runtime Information ===\n");
    for key in ["uptime", "status/bootstrap-phase", "config-file"] {
        match session.get_info(key).await {
            Ok(value) => println!("{}: {}", key, value),
            Err(e) => println!("{}: unavailable ({})", key, e),
        }
    }

    // SAVECONF rewrites torrc on disk:
    // session.save_conf(false).await?;

    println!(
        "\n{} malformed reply lines skipped",
        session.skipped_lines()
    );
    client.shutdown().await;
    Ok(())
}
