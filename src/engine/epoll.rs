//! Single-threaded edge-triggered readiness engine.
//!
//! Built on mio, which is epoll on Linux (kqueue on macOS). Every
//! registration is edge-triggered, so a readiness event must be consumed
//! completely: the listener accepts until `WouldBlock`, and clients are
//! drained until `WouldBlock` before the accumulated bytes are answered as
//! one message.
//!
//! Known constraint: a client that has more than `BUFFER_SIZE` bytes
//! readable at once is only drained up to the buffer size; the remainder is
//! served on the next readiness edge.

use crate::listener::{self, Listener};
use crate::protocol::{echo_response, BUFFER_SIZE};
use crate::server::Engine;
use crate::socket::Socket;
use crate::stats::ServerStats;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const NAME: &str = "EpollServer";

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Readiness events fetched per wait.
const EVENT_CAPACITY: usize = 1024;

pub struct EpollServer {
    stats: Arc<ServerStats>,
}

impl EpollServer {
    pub fn new(stats: Arc<ServerStats>) -> Self {
        Self { stats }
    }
}

impl Engine for EpollServer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    fn run(&self, port: u16) -> io::Result<()> {
        let listener = listener::listen(port, NAME, &self.stats)?;
        listener
            .set_nonblocking(true)
            .inspect_err(|e| error!(engine = NAME, error = %e, "Failed to set listener non-blocking"))?;

        let mut poll = Poll::new()
            .inspect_err(|e| error!(engine = NAME, error = %e, "Failed to create epoll instance"))?;
        let listen_fd = listener.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&listen_fd), LISTENER_TOKEN, Interest::READABLE)
            .inspect_err(|e| error!(engine = NAME, error = %e, "Failed to register listener"))?;

        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let mut clients: Slab<Socket> = Slab::new();
        let mut buf = [0u8; BUFFER_SIZE];

        while self.stats.is_running() {
            if let Err(e) = poll.poll(&mut events, None) {
                if self.stats.is_running() && e.kind() != io::ErrorKind::Interrupted {
                    error!(engine = NAME, error = %e, "Failed to wait for events");
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => {
                        accept_connections(&listener, &poll, &mut clients, &self.stats);
                    }
                    Token(conn_id) => {
                        let Some(client) = clients.get(conn_id) else {
                            continue;
                        };
                        if !serve_client(client, &self.stats, &mut buf) {
                            close_connection(&poll, &mut clients, conn_id, &self.stats);
                        }
                    }
                }
            }
        }

        for conn_id in clients.iter().map(|(id, _)| id).collect::<Vec<_>>() {
            close_connection(&poll, &mut clients, conn_id, &self.stats);
        }
        drop(listener);
        info!(engine = NAME, "Server stopped");
        Ok(())
    }
}

fn accept_connections(
    listener: &Listener,
    poll: &Poll,
    clients: &mut Slab<Socket>,
    stats: &ServerStats,
) {
    loop {
        let client = match listener.accept() {
            Ok(client) => client,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                if stats.is_running() {
                    error!(engine = NAME, error = %e, "Failed to accept new connection");
                }
                break;
            }
        };

        let fd = client.as_raw_fd();
        if let Err(e) = client.set_nonblocking(true) {
            warn!(fd, error = %e, "Failed to set client non-blocking, closing");
            continue;
        }

        let entry = clients.vacant_entry();
        if let Err(e) = poll
            .registry()
            .register(&mut SourceFd(&fd), Token(entry.key()), Interest::READABLE)
        {
            warn!(fd, error = %e, "Failed to register client, closing");
            continue;
        }
        entry.insert(client);
        stats.connection_opened();
        debug!(fd, "Accepted connection");
    }
}

/// Outcome of draining one readiness edge.
struct Drained {
    len: usize,
    peer_closed: bool,
}

/// Read until `WouldBlock`, peer close or a full buffer.
fn drain(client: &Socket, buf: &mut [u8]) -> io::Result<Drained> {
    let mut len = 0;
    while len < buf.len() {
        match client.recv(&mut buf[len..]) {
            Ok(0) => {
                return Ok(Drained {
                    len,
                    peer_closed: true,
                })
            }
            Ok(n) => len += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(Drained {
        len,
        peer_closed: false,
    })
}

/// Handle one readiness edge. Returns `false` when the connection must close.
fn serve_client(client: &Socket, stats: &ServerStats, buf: &mut [u8]) -> bool {
    let fd = client.as_raw_fd();
    let drained = match drain(client, buf) {
        Ok(drained) => drained,
        Err(e) => {
            debug!(fd, error = %e, "Receive failed");
            return false;
        }
    };

    if drained.len > 0 {
        let response = echo_response(stats.total_messages(), &buf[..drained.len]);
        if let Err(e) = client.send_all(&response) {
            warn!(fd, error = %e, "Failed to send response");
            return false;
        }
        stats.message_echoed();
    }

    !drained.peer_closed
}

fn close_connection(poll: &Poll, clients: &mut Slab<Socket>, conn_id: usize, stats: &ServerStats) {
    if let Some(client) = clients.try_remove(conn_id) {
        let fd = client.as_raw_fd();
        let _ = poll.registry().deregister(&mut SourceFd(&fd));
        stats.connection_closed();
        debug!(fd, "Connection closed");
    }
}
