//! Example: Running a relay node
//!
//! Loads configuration from `BDN_RELAY_*` environment variables, or from the
//! TOML file named by `BDN_RELAY_CONFIG`, and serves until Ctrl-C.
//!
//! Run with: `cargo run --example relay_node`

use bdn_relay::config::RelayConfig;
use bdn_relay::service::RelayNode;
use bdn_relay::utils::logging::init_logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var("BDN_RELAY_CONFIG") {
        Ok(path) => RelayConfig::from_file(path)?,
        Err(_) => RelayConfig::from_env()?,
    };
    init_logging(&config.logging)?;

    let (node, handle) = RelayNode::bind(config).await?;
    println!(
        "Relay node {} listening on {}",
        handle.node_id(),
        handle.local_addr()
    );

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown.shutdown().await;
        }
    });

    node.run().await?;
    Ok(())
}
