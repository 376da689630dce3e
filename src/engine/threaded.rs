//! Thread-per-connection engine with blocking I/O.
//!
//! The accept loop blocks in `accept`; each connection is served by its own
//! detached thread. `stop()` shuts the listener down, which fails the
//! pending `accept` and ends the loop. Connection threads are not joined:
//! they finish when their peer disconnects or the process exits.

use super::echo_once;
use crate::listener;
use crate::protocol::BUFFER_SIZE;
use crate::server::Engine;
use crate::socket::Socket;
use crate::stats::ServerStats;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

const NAME: &str = "ThreadedServer";

pub struct ThreadedServer {
    stats: Arc<ServerStats>,
}

impl ThreadedServer {
    pub fn new(stats: Arc<ServerStats>) -> Self {
        Self { stats }
    }
}

impl Engine for ThreadedServer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    fn run(&self, port: u16) -> io::Result<()> {
        let listener = listener::listen(port, NAME, &self.stats)?;

        while self.stats.is_running() {
            let client = match listener.accept() {
                Ok(client) => client,
                Err(e) => {
                    if self.stats.is_running() {
                        error!(engine = NAME, error = %e, "Failed to accept connection");
                    }
                    continue;
                }
            };

            let fd = client.as_raw_fd();
            let stats = Arc::clone(&self.stats);
            // On spawn failure the closure, and with it the socket, is dropped.
            if let Err(e) = thread::Builder::new()
                .name(format!("conn-{fd}"))
                .spawn(move || handle_client(client, &stats))
            {
                error!(engine = NAME, fd, error = %e, "Failed to spawn connection thread");
            }
        }

        drop(listener);
        info!(engine = NAME, "Server stopped");
        Ok(())
    }
}

fn handle_client(client: Socket, stats: &ServerStats) {
    stats.connection_opened();
    let mut buf = [0u8; BUFFER_SIZE];

    while stats.is_running() && echo_once(&client, stats, &mut buf) {}

    stats.connection_closed();
    debug!(fd = client.as_raw_fd(), "Connection closed");
}
