//! Example: fetch a page through the SOCKS endpoint
//!
//! Run with: cargo run --example socks_dial -- check.torproject.org

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use torwire::{ClientConfig, Result, TorClient};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "check.torproject.org".to_string());

    let client = TorClient::new(ClientConfig::from_env())?;
    println!("Dialing {}:80 via {}...", host, client.config().socks_addr);
    let mut stream = client.dial(&host, 80).await?;

    let request = format!("GET / HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n", host);
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    let text = String::from_utf8_lossy(&response);
    for line in text.lines().take_while(|l| !l.is_empty()) {
        println!("{}", line);
    }
    println!("\n{} bytes received", response.len());

    client.shutdown().await;
    Ok(())
}
