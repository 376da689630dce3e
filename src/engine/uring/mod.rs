//! Completion-based engine on Linux io_uring.
//!
//! A single ring replaces readiness polling: accepts, receives and sends are
//! submitted as operations and their completions drive a per-client state
//! machine. Responses use the `Echo: <text>(Msg #<n>)\n` format.

#[cfg(target_os = "linux")]
mod client;
#[cfg(target_os = "linux")]
mod event_loop;
#[cfg(target_os = "linux")]
mod token;

use crate::server::Engine;
use crate::stats::ServerStats;
use std::io;
use std::sync::Arc;

pub(crate) const NAME: &str = "IOUringServer";

pub struct IoUringServer {
    stats: Arc<ServerStats>,
}

impl IoUringServer {
    pub fn new(stats: Arc<ServerStats>) -> Self {
        Self { stats }
    }
}

impl Engine for IoUringServer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    #[cfg(target_os = "linux")]
    fn run(&self, port: u16) -> io::Result<()> {
        event_loop::run(port, &self.stats)
    }

    #[cfg(not(target_os = "linux"))]
    fn run(&self, _port: u16) -> io::Result<()> {
        tracing::error!(engine = NAME, "io_uring is only available on Linux");
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "io_uring is only available on Linux",
        ))
    }
}

/// Whether this kernel lets the process create an io_uring instance.
pub fn uring_supported() -> bool {
    #[cfg(target_os = "linux")]
    {
        io_uring::IoUring::new(8).is_ok()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
