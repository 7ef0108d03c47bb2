//! Echo server.
//!
//! Run with: cargo run --bin echo-server [config.json]
//! Then talk to it with one JSON object per line, e.g. `nc 127.0.0.1 3563`
//! and `{"type":"say","text":"hello"}`.

use module_kit_runtime::{logging, Registry, ServerConfig};

const DEFAULT_ADDR: &str = "127.0.0.1:3563";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    logging::init(&config.log_level)?;
    config.apply();

    let addr = std::env::var("ECHO_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());

    let registry = Registry::new();
    let local_addr = echo_server::start(&registry, &config, &addr).await?;

    println!("Echo server listening on {}", local_addr);
    println!("  send: {{\"type\":\"say\",\"text\":\"...\"}}");
    println!("        {{\"type\":\"rename\",\"name\":\"...\"}}");
    println!("        {{\"type\":\"who\"}}");
    println!();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    registry.destroy().await;

    Ok(())
}
