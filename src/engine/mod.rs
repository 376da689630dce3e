//! The five connection-handling engines.
//!
//! - `threaded`: one blocking OS thread per connection
//! - `select`: single thread, fixed-capacity `fd_set`
//! - `poll`: single thread, growable `pollfd` list
//! - `epoll`: single thread, edge-triggered readiness via mio
//! - `uring`: single thread, completion-based io_uring ring
//!
//! Each engine owns its listener and every accepted socket, and shares only
//! its `ServerStats` with the outside world.

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod epoll;
mod poll;
mod select;
mod threaded;
mod uring;

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use epoll::EpollServer;
pub use poll::PollServer;
pub use select::SelectServer;
pub use threaded::ThreadedServer;
pub use uring::{uring_supported, IoUringServer};

use crate::protocol::echo_response;
use crate::socket::Socket;
use crate::stats::ServerStats;
use std::os::unix::io::AsRawFd;
use tracing::{debug, warn};

/// Receive once and reply with the synchronous response format.
///
/// Returns `false` when the connection is finished: orderly close, receive
/// error or send error. The caller tears it down.
fn echo_once(client: &Socket, stats: &ServerStats, buf: &mut [u8]) -> bool {
    let n = match client.recv(buf) {
        Ok(0) => return false,
        Ok(n) => n,
        Err(e) => {
            debug!(fd = client.as_raw_fd(), error = %e, "Receive failed");
            return false;
        }
    };

    let response = echo_response(stats.total_messages(), &buf[..n]);
    if let Err(e) = client.send_all(&response) {
        warn!(fd = client.as_raw_fd(), error = %e, "Failed to send response");
        return false;
    }
    stats.message_echoed();
    true
}
