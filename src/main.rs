//! quorum-gate: client-facing network front-end of a coordination service.
//!
//! Standalone, the front-end binds the client port, answers the four-letter
//! diagnostic probes, and refuses session handshakes. An embedding process
//! attaches a request-execution core through [`ReactorHandle::set_server`] to
//! serve real traffic.
//!
//! [`ReactorHandle::set_server`]: quorum_gate::ReactorHandle::set_server

use quorum_gate::config::Config;
use quorum_gate::{AuthRegistry, Reactor};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        host = %config.host,
        port = config.port,
        max_client_cnxns = config.max_client_cnxns,
        max_frame = config.max_frame,
        "Starting quorum-gate front-end"
    );

    let mut reactor = Reactor::bind(&config, AuthRegistry::new())?;
    reactor.run()?;
    Ok(())
}
