//! chat-relay server binary.

use chat_relay::config::Config;
use chat_relay::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        announce_departures = config.announce_departures,
        "Starting chat-relay server"
    );

    // Bind/listen failures end the process with a non-zero status
    let server = Server::bind(config)?;
    server.run().await?;

    Ok(())
}
