//! drop-box server.
//!
//! Binds the configured address, serves uploads on a dispatcher thread and
//! terminates when a line (or end of input) is read from stdin. Shutdown
//! then waits for every open session to drain.

use drop_box::config::Config;
use drop_box::runtime::Server;
use std::io::BufRead;
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
        upload_dir = ?config.upload_dir,
        shutdown_policy = ?config.shutdown_policy,
        "Starting drop-box server"
    );

    let server = Server::bind(config)?;
    let handle = server.spawn()?;

    info!("Terminate with ENTER");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    handle.shutdown()?;
    Ok(())
}
