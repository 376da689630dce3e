//! tcp-engines: line echo server with a selectable engine.
//!
//! Usage: `tcp-engines <threaded|select|poll|epoll|iouring> [port]`
//!
//! SIGINT and SIGTERM stop the running engine; the final counters are logged
//! before the process exits.

use std::sync::Arc;
use std::time::Instant;
use tcp_engines::config::Config;
use tcp_engines::Server;
use tracing::{error, info};
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
        engine = %config.engine,
        port = config.port,
        stats_interval_secs = config.stats_interval.as_secs(),
        "Starting tcp-engines server"
    );

    let server = Arc::new(Server::with_report_interval(
        config.engine,
        config.stats_interval,
    ));
    install_signal_handler(Arc::clone(&server))?;

    let started = Instant::now();
    if let Err(e) = server.run(config.port) {
        error!(engine = server.name(), error = %e, "Server failed");
        std::process::exit(1);
    }

    info!(
        engine = server.name(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Server stopped"
    );
    info!(
        active = server.active_connections(),
        messages = server.total_messages(),
        "Final stats"
    );
    Ok(())
}

/// Forward SIGINT/SIGTERM to `stop()` on the given server.
fn install_signal_handler(server: Arc<Server>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!(engine = server.name(), "Received shutdown signal, stopping");
        server.stop();
    })
}
