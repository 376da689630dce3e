//! Listening socket setup shared by every engine.
//!
//! `listen` creates an IPv4 TCP socket with `SO_REUSEADDR`, binds it to
//! `0.0.0.0:<port>` and listens with the platform's maximum backlog. On
//! success the engine is marked running (unless a stop was already requested,
//! in which case the engine's loop never starts) and its statistics reporter
//! starts.
//! Dropping the returned `Listener` undoes all of that in order: the wake
//! slot is cleared, the reporter is joined and the descriptor is closed.

use crate::socket::Socket;
use crate::stats::{ServerStats, StatsReporter};
use socket2::{Domain, Protocol, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::Deref;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use tracing::{error, info};

/// A bound, listening socket plus the reporter tied to its lifetime.
pub struct Listener {
    stats: Arc<ServerStats>,
    reporter: StatsReporter,
    socket: Socket,
    port: u16,
}

impl Listener {
    /// Port actually bound (differs from the requested one when that was 0).
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Deref for Listener {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        // Withdraw the descriptor from `request_stop` before `socket` closes it.
        self.stats.finish_serving();
        self.reporter.join();
    }
}

/// Create, bind and listen; start the reporter for `name`.
pub fn listen(port: u16, name: &'static str, stats: &Arc<ServerStats>) -> io::Result<Listener> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .inspect_err(|e| error!(engine = name, error = %e, "Failed to create socket"))?;

    socket
        .set_reuse_address(true)
        .inspect_err(|e| error!(engine = name, error = %e, "Failed to set SO_REUSEADDR"))?;

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket
        .bind(&addr.into())
        .inspect_err(|e| error!(engine = name, port, error = %e, "Failed to bind"))?;

    socket
        .listen(libc::SOMAXCONN)
        .inspect_err(|e| error!(engine = name, port, error = %e, "Failed to listen"))?;

    let bound = socket
        .local_addr()
        .ok()
        .and_then(|a| a.as_socket())
        .map_or(port, |a| a.port());

    let socket = Socket::from(socket);
    let serving = stats.start_serving(socket.as_raw_fd(), bound);

    let reporter = match StatsReporter::spawn(name, Arc::clone(stats)) {
        Ok(reporter) => reporter,
        Err(e) => {
            stats.finish_serving();
            error!(engine = name, error = %e, "Failed to start statistics reporter");
            return Err(e);
        }
    };

    if serving {
        info!(engine = name, port = bound, "Listening");
    } else {
        info!(engine = name, port = bound, "Stop requested before serving, not accepting");
    }

    Ok(Listener {
        stats: Arc::clone(stats),
        reporter,
        socket,
        port: bound,
    })
}
