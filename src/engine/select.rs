//! Single-threaded `select` engine.
//!
//! A master `fd_set` holds the listener and every client. Each pass copies
//! it, blocks in `select` without a timeout, accepts at most one connection
//! and serves one receive for every ready client.
//!
//! Capacity is bounded by `FD_SETSIZE`. A connection whose descriptor does
//! not fit is closed immediately.

use super::echo_once;
use crate::listener;
use crate::protocol::BUFFER_SIZE;
use crate::server::Engine;
use crate::socket::Socket;
use crate::stats::ServerStats;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const NAME: &str = "SelectServer";

pub struct SelectServer {
    stats: Arc<ServerStats>,
}

impl SelectServer {
    pub fn new(stats: Arc<ServerStats>) -> Self {
        Self { stats }
    }
}

impl Engine for SelectServer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    fn run(&self, port: u16) -> io::Result<()> {
        let listener = listener::listen(port, NAME, &self.stats)?;
        let listen_fd = listener.as_raw_fd();

        let mut master = FdSet::new();
        if !master.insert(listen_fd) {
            error!(engine = NAME, fd = listen_fd, "Listener does not fit in fd_set");
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "listener descriptor exceeds FD_SETSIZE",
            ));
        }
        let mut max_fd = listen_fd;
        let mut clients: Vec<Socket> = Vec::new();
        let mut buf = [0u8; BUFFER_SIZE];

        while self.stats.is_running() {
            let mut ready = master;
            // SAFETY: `ready` is a valid fd_set and the other sets are null.
            let nready = unsafe {
                libc::select(
                    max_fd + 1,
                    ready.as_mut_ptr(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                )
            };
            if nready < 0 {
                let err = io::Error::last_os_error();
                if self.stats.is_running() && err.kind() != io::ErrorKind::Interrupted {
                    error!(engine = NAME, error = %err, "select failed");
                }
                continue;
            }

            if ready.contains(listen_fd) {
                match listener.accept() {
                    Ok(client) => {
                        let fd = client.as_raw_fd();
                        if master.insert(fd) {
                            max_fd = max_fd.max(fd);
                            clients.push(client);
                            self.stats.connection_opened();
                        } else {
                            warn!(
                                engine = NAME,
                                fd,
                                capacity = FdSet::capacity(),
                                "Descriptor exceeds select capacity, closing connection"
                            );
                        }
                    }
                    Err(e) => {
                        if self.stats.is_running() {
                            error!(engine = NAME, error = %e, "Failed to accept connection");
                        }
                    }
                }
            }

            clients.retain(|client| {
                let fd = client.as_raw_fd();
                if !ready.contains(fd) || echo_once(client, &self.stats, &mut buf) {
                    return true;
                }
                master.remove(fd);
                self.stats.connection_closed();
                debug!(fd, "Connection closed");
                false
            });
        }

        self.stats.connections_closed(clients.len());
        clients.clear();
        drop(listener);
        info!(engine = NAME, "Server stopped");
        Ok(())
    }
}

/// Safe wrapper over `libc::fd_set`.
///
/// Descriptors outside `0..FD_SETSIZE` are never written into the set.
#[derive(Clone, Copy)]
struct FdSet(libc::fd_set);

impl FdSet {
    fn new() -> Self {
        let mut raw = MaybeUninit::<libc::fd_set>::uninit();
        // SAFETY: FD_ZERO fully initializes the set.
        unsafe {
            libc::FD_ZERO(raw.as_mut_ptr());
            FdSet(raw.assume_init())
        }
    }

    fn capacity() -> usize {
        libc::FD_SETSIZE as usize
    }

    fn fits(fd: RawFd) -> bool {
        fd >= 0 && (fd as usize) < Self::capacity()
    }

    /// Add `fd`; returns `false` if it is outside the set's range.
    fn insert(&mut self, fd: RawFd) -> bool {
        if !Self::fits(fd) {
            return false;
        }
        // SAFETY: fd is within 0..FD_SETSIZE.
        unsafe { libc::FD_SET(fd, &mut self.0) };
        true
    }

    fn remove(&mut self, fd: RawFd) {
        if Self::fits(fd) {
            // SAFETY: fd is within 0..FD_SETSIZE.
            unsafe { libc::FD_CLR(fd, &mut self.0) };
        }
    }

    fn contains(&self, fd: RawFd) -> bool {
        // SAFETY: fd is within 0..FD_SETSIZE.
        Self::fits(fd) && unsafe { libc::FD_ISSET(fd, &self.0) }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.0
    }
}
