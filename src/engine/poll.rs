//! Single-threaded `poll` engine.
//!
//! Same shape as the select engine, but readiness interest lives in a
//! growable `pollfd` list, so there is no descriptor ceiling. Entry 0 is the
//! listener; entry `i > 0` belongs to `clients[i - 1]`. Removal is
//! `swap_remove` on both vectors, so order is not preserved across removals.

use super::echo_once;
use crate::listener;
use crate::protocol::BUFFER_SIZE;
use crate::server::Engine;
use crate::socket::Socket;
use crate::stats::ServerStats;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use tracing::{debug, error, info};

const NAME: &str = "PollServer";

/// Events that end a connection before any read is attempted.
const HANGUP: libc::c_short = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

pub struct PollServer {
    stats: Arc<ServerStats>,
}

impl PollServer {
    pub fn new(stats: Arc<ServerStats>) -> Self {
        Self { stats }
    }
}

impl Engine for PollServer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    fn run(&self, port: u16) -> io::Result<()> {
        let listener = listener::listen(port, NAME, &self.stats)?;

        let mut fds = vec![interest(listener.as_raw_fd())];
        let mut clients: Vec<Socket> = Vec::new();
        let mut buf = [0u8; BUFFER_SIZE];

        while self.stats.is_running() {
            // SAFETY: `fds` is a live, correctly sized pollfd array.
            let nready =
                unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if nready < 0 {
                let err = io::Error::last_os_error();
                if self.stats.is_running() && err.kind() != io::ErrorKind::Interrupted {
                    error!(engine = NAME, error = %err, "poll failed");
                }
                continue;
            }

            if fds[0].revents & libc::POLLIN != 0 {
                match listener.accept() {
                    Ok(client) => {
                        fds.push(interest(client.as_raw_fd()));
                        clients.push(client);
                        self.stats.connection_opened();
                    }
                    Err(e) => {
                        if self.stats.is_running() {
                            error!(engine = NAME, error = %e, "Failed to accept connection");
                        }
                    }
                }
            }

            let mut i = 1;
            while i < fds.len() {
                let revents = fds[i].revents;
                let keep = if revents & HANGUP != 0 {
                    false
                } else if revents & libc::POLLIN != 0 {
                    echo_once(&clients[i - 1], &self.stats, &mut buf)
                } else {
                    true
                };

                if keep {
                    i += 1;
                    continue;
                }

                // The swapped-in tail entry keeps its revents and is visited next.
                fds.swap_remove(i);
                let client = clients.swap_remove(i - 1);
                self.stats.connection_closed();
                debug!(fd = client.as_raw_fd(), "Connection closed");
            }
        }

        self.stats.connections_closed(clients.len());
        clients.clear();
        drop(listener);
        info!(engine = NAME, "Server stopped");
        Ok(())
    }
}

fn interest(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}
