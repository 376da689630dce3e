//! io_uring event loop.
//!
//! Completion-based model: operations are pushed to the submission queue,
//! the loop waits for at least one completion and then handles a batch,
//! dispatching on the `OpType` stored under each completion's token.
//!
//! Per client the loop enforces read -> write -> read; exactly one operation
//! is in flight for a client at any time, so tearing a client down on that
//! operation's completion never frees memory the kernel still uses.

use super::client::{ClientContext, ClientTable};
use super::token::{OpType, TokenAllocator};
use super::NAME;
use crate::listener;
use crate::socket::Socket;
use crate::stats::ServerStats;
use io_uring::{cqueue, opcode, squeue, types, IoUring};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Submission queue depth.
const RING_ENTRIES: u32 = 2048;

/// Completions handled per wake-up.
const CQE_BATCH: usize = 2048;

/// Upper bound on tracked clients.
const MAX_CLIENTS: usize = 65536;

/// Pause when a pass submitted nothing.
const IDLE_BACKOFF: Duration = Duration::from_micros(100);

/// How long shutdown waits for in-flight operations to complete.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Ring, listener and client state owned by the loop thread.
struct EventLoop<'a> {
    stats: &'a ServerStats,
    listen_fd: RawFd,
    accept_armed: bool,
    tokens: TokenAllocator,
    clients: ClientTable,
    ring: IoUring,
}

pub(super) fn run(port: u16, stats: &Arc<ServerStats>) -> io::Result<()> {
    let ring = IoUring::new(RING_ENTRIES)
        .inspect_err(|e| error!(engine = NAME, error = %e, "Failed to initialize io_uring"))?;

    let listener = listener::listen(port, NAME, stats)?;
    listener
        .set_nonblocking(true)
        .inspect_err(|e| error!(engine = NAME, error = %e, "Failed to set listener non-blocking"))?;

    let mut event_loop = EventLoop {
        stats,
        listen_fd: listener.as_raw_fd(),
        accept_armed: false,
        tokens: TokenAllocator::new(RING_ENTRIES as usize),
        clients: ClientTable::new(MAX_CLIENTS),
        ring,
    };

    event_loop.arm_accept();
    let result = event_loop.serve();
    event_loop.shutdown();

    drop(listener);
    info!(engine = NAME, "Server stopped");
    result
}

impl EventLoop<'_> {
    fn serve(&mut self) -> io::Result<()> {
        let mut completions: Vec<cqueue::Entry> = Vec::with_capacity(CQE_BATCH);

        while self.stats.is_running() {
            if !self.accept_armed {
                self.arm_accept();
            }

            let submitted = match self.ring.submit() {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(engine = NAME, error = %e, "Failed to submit io_uring requests");
                    return Err(e);
                }
            };
            if submitted == 0 {
                thread::sleep(IDLE_BACKOFF);
            }

            if let Err(e) = self.ring.submit_and_wait(1) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!(engine = NAME, error = %e, "Failed to wait for io_uring completions");
                }
                continue;
            }

            completions.clear();
            completions.extend(self.ring.completion().take(CQE_BATCH));

            for cqe in completions.drain(..) {
                let Some(op) = self.tokens.free(cqe.user_data()) else {
                    warn!(token = cqe.user_data(), "Completion for unknown token");
                    continue;
                };
                match op {
                    OpType::Accept => self.on_accept(cqe.result()),
                    OpType::Recv { fd } => self.on_recv(fd, cqe.result()),
                    OpType::Send { fd } => self.on_send(fd, cqe.result()),
                }
            }
        }

        Ok(())
    }

    fn on_accept(&mut self, result: i32) {
        self.accept_armed = false;

        if result < 0 {
            if self.stats.is_running() {
                let err = io::Error::from_raw_os_error(-result);
                warn!(engine = NAME, error = %err, "Accept failed, resubmitting");
                self.arm_accept();
            }
            return;
        }

        // SAFETY: a successful accept completion hands over a new descriptor.
        let socket = unsafe { Socket::from_raw_fd(result) };
        match self.clients.insert(ClientContext::new(socket)) {
            Ok(()) => {
                self.stats.connection_opened();
                debug!(fd = result, "Accepted connection");
                self.start_read(result);
            }
            Err(ctx) => {
                warn!(fd = ctx.fd(), "Connection table full, closing connection");
            }
        }

        if self.stats.is_running() {
            self.arm_accept();
        }
    }

    fn on_recv(&mut self, fd: RawFd, result: i32) {
        if result <= 0 {
            if result < 0 {
                let err = io::Error::from_raw_os_error(-result);
                debug!(fd, error = %err, "Receive failed");
            }
            self.teardown(fd);
            return;
        }

        let Some(ctx) = self.clients.get_mut(fd) else {
            return;
        };
        let seq = self.stats.message_echoed() + 1;
        ctx.complete_read(result as usize, seq);
        self.start_write(fd);
    }

    fn on_send(&mut self, fd: RawFd, result: i32) {
        if result <= 0 {
            if result < 0 {
                let err = io::Error::from_raw_os_error(-result);
                debug!(fd, error = %err, "Send failed");
            }
            self.teardown(fd);
            return;
        }

        let Some(ctx) = self.clients.get_mut(fd) else {
            return;
        };
        if ctx.complete_write(result as usize) {
            self.start_read(fd);
        } else {
            self.start_write(fd);
        }
    }

    fn arm_accept(&mut self) {
        let entry = opcode::Accept::new(
            types::Fd(self.listen_fd),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .build();

        match self.push(OpType::Accept, entry) {
            Ok(()) => self.accept_armed = true,
            Err(e) => error!(engine = NAME, error = %e, "Failed to queue accept after retry"),
        }
    }

    fn start_read(&mut self, fd: RawFd) {
        let Some(ctx) = self.clients.get_mut(fd) else {
            return;
        };
        if !ctx.begin_read() {
            return;
        }
        let (ptr, len) = ctx.read_target();
        let entry = opcode::Recv::new(types::Fd(fd), ptr, len).build();

        if let Err(e) = self.push(OpType::Recv { fd }, entry) {
            error!(fd, error = %e, "Failed to queue receive after retry, closing client");
            self.teardown(fd);
        }
    }

    fn start_write(&mut self, fd: RawFd) {
        let Some(ctx) = self.clients.get_mut(fd) else {
            return;
        };
        if !ctx.begin_write() {
            return;
        }
        let (ptr, len) = ctx.write_source();
        let entry = opcode::Send::new(types::Fd(fd), ptr, len).build();

        if let Err(e) = self.push(OpType::Send { fd }, entry) {
            error!(fd, error = %e, "Failed to queue send after retry, closing client");
            self.teardown(fd);
        }
    }

    /// Queue `entry` under a fresh token, flushing the queue once if it is full.
    fn push(&mut self, op: OpType, entry: squeue::Entry) -> io::Result<()> {
        let token = self.tokens.alloc(op);
        let entry = entry.user_data(token);

        // SAFETY: every buffer an entry points at is a boxed client buffer
        // that stays alive until the entry's completion has been handled.
        if unsafe { self.ring.submission().push(&entry) }.is_ok() {
            return Ok(());
        }

        if let Err(e) = self.ring.submit() {
            self.tokens.free(token);
            return Err(e);
        }

        // SAFETY: as above.
        if unsafe { self.ring.submission().push(&entry) }.is_err() {
            self.tokens.free(token);
            return Err(io::Error::other("submission queue full"));
        }
        Ok(())
    }

    fn teardown(&mut self, fd: RawFd) {
        if self.clients.remove(fd) {
            self.stats.connection_closed();
            debug!(fd, "Connection closed");
        }
    }

    /// Wake every pending operation and wait for its completion so no client
    /// buffer is released while the kernel may still write into it.
    fn shutdown(&mut self) {
        for fd in self.clients.fds().chain([self.listen_fd]) {
            // SAFETY: shutdown(2) on descriptors that stay open until this returns.
            unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.tokens.is_empty() && Instant::now() < deadline {
            let ts = types::Timespec::new().nsec(10_000_000);
            let args = types::SubmitArgs::new().timespec(&ts);
            if let Err(e) = self.ring.submitter().submit_with_args(1, &args) {
                let timed_out = e.raw_os_error() == Some(libc::ETIME);
                if !timed_out && e.kind() != io::ErrorKind::Interrupted {
                    warn!(engine = NAME, error = %e, "Failed to drain io_uring");
                    break;
                }
            }
            for cqe in self.ring.completion() {
                self.tokens.free(cqe.user_data());
            }
        }

        let remaining = self.clients.len();
        let clients = std::mem::replace(&mut self.clients, ClientTable::new(0));
        if self.tokens.is_empty() {
            drop(clients);
        } else {
            warn!(
                engine = NAME,
                in_flight = self.tokens.len(),
                "Operations still pending at shutdown, leaking their buffers"
            );
            std::mem::forget(clients);
        }
        self.stats.connections_closed(remaining);
    }
}
