//! Per-connection state for the io_uring engine.
//!
//! A client alternates strictly between one pending receive and one pending
//! send, so its buffer is never shared by two operations at once.

use crate::protocol::{uring_response, BUFFER_SIZE};
use crate::socket::Socket;
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};

/// Which operation, if any, is pending for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Reading,
    Writing,
}

/// One accepted connection and its fixed-size buffer.
///
/// The buffer is boxed so its address stays put while the kernel owns it,
/// even when the table rehashes.
pub struct ClientContext {
    socket: Socket,
    buffer: Box<[u8; BUFFER_SIZE]>,
    /// Valid bytes in `buffer`.
    len: usize,
    /// Bytes of the response already sent.
    sent: usize,
    phase: Phase,
}

impl ClientContext {
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            buffer: Box::new([0u8; BUFFER_SIZE]),
            len: 0,
            sent: 0,
            phase: Phase::Idle,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_reading(&self) -> bool {
        self.phase == Phase::Reading
    }

    pub fn is_writing(&self) -> bool {
        self.phase == Phase::Writing
    }

    /// Enter the read phase. Returns `false` if a receive is already pending.
    pub fn begin_read(&mut self) -> bool {
        if self.is_reading() {
            return false;
        }
        self.phase = Phase::Reading;
        self.len = 0;
        true
    }

    /// Destination of the pending receive.
    pub fn read_target(&mut self) -> (*mut u8, u32) {
        (self.buffer.as_mut_ptr(), BUFFER_SIZE as u32)
    }

    /// Record a completed receive of `n` bytes and rewrite the buffer into
    /// the response for message number `seq`.
    pub fn complete_read(&mut self, n: usize, seq: u64) {
        self.phase = Phase::Idle;
        let n = n.min(BUFFER_SIZE);
        self.len = uring_response(seq, &mut self.buffer[..], n);
        self.sent = 0;
    }

    /// Enter the write phase. Returns `false` if a send is already pending.
    pub fn begin_write(&mut self) -> bool {
        if self.is_writing() {
            return false;
        }
        self.phase = Phase::Writing;
        true
    }

    /// Unsent part of the response.
    pub fn write_source(&self) -> (*const u8, u32) {
        let pending = &self.buffer[self.sent..self.len];
        (pending.as_ptr(), pending.len() as u32)
    }

    /// Record a completed send of `n` bytes. Returns `true` once the whole
    /// response has gone out.
    pub fn complete_write(&mut self, n: usize) -> bool {
        self.phase = Phase::Idle;
        self.sent = (self.sent + n).min(self.len);
        self.sent == self.len
    }

    #[cfg(test)]
    pub fn response(&self) -> &[u8] {
        &self.buffer[..self.len]
    }
}

/// Live clients keyed by descriptor.
pub struct ClientTable {
    clients: HashMap<RawFd, ClientContext>,
    max_clients: usize,
}

impl ClientTable {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    /// Insert a client. Gives it back when the table is full or its
    /// descriptor is already tracked.
    pub fn insert(&mut self, ctx: ClientContext) -> Result<(), ClientContext> {
        if self.clients.len() >= self.max_clients || self.clients.contains_key(&ctx.fd()) {
            return Err(ctx);
        }
        self.clients.insert(ctx.fd(), ctx);
        Ok(())
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut ClientContext> {
        self.clients.get_mut(&fd)
    }

    /// Remove and close a client.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        self.clients.remove(&fd).is_some()
    }

    pub fn fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.clients.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::FromRawFd;

    fn client() -> (ClientContext, Socket) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe {
            (
                ClientContext::new(Socket::from_raw_fd(fds[0])),
                Socket::from_raw_fd(fds[1]),
            )
        }
    }

    #[test]
    fn test_phase_transitions() {
        let (mut ctx, _peer) = client();
        assert_eq!(ctx.phase(), Phase::Idle);

        assert!(ctx.begin_read());
        assert!(!ctx.begin_read());
        assert!(ctx.is_reading());

        let (ptr, _) = ctx.read_target();
        unsafe { std::ptr::copy_nonoverlapping(b"hello\n".as_ptr(), ptr, 6) };
        ctx.complete_read(6, 1);
        assert_eq!(ctx.phase(), Phase::Idle);
        assert_eq!(ctx.response(), b"Echo: hello(Msg #1)\n");

        assert!(ctx.begin_write());
        assert!(!ctx.begin_write());
        assert!(ctx.is_writing());
        assert!(!ctx.is_reading());
    }

    #[test]
    fn test_partial_write_tracking() {
        let (mut ctx, _peer) = client();
        ctx.begin_read();
        ctx.complete_read(0, 5);
        let total = ctx.response().len();

        ctx.begin_write();
        assert!(!ctx.complete_write(4));
        let (_, remaining) = ctx.write_source();
        assert_eq!(remaining as usize, total - 4);

        ctx.begin_write();
        assert!(ctx.complete_write(total - 4));
    }

    #[test]
    fn test_table_capacity_and_duplicates() {
        let mut table = ClientTable::new(1);
        let (a, _pa) = client();
        let (b, _pb) = client();
        let fd = a.fd();

        assert!(table.insert(a).is_ok());
        assert!(table.insert(b).is_err());
        assert_eq!(table.len(), 1);
        assert_eq!(table.fds().collect::<Vec<_>>(), vec![fd]);

        assert!(table.remove(fd));
        assert!(!table.remove(fd));
        assert!(table.is_empty());
    }
}
