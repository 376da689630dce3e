//! Scoped ownership of a raw socket descriptor.
//!
//! `Socket` closes its descriptor exactly once: when it is dropped while
//! still holding a valid descriptor. Moving out of it (`take`, `into_raw_fd`)
//! leaves the source holding the invalid sentinel so its drop is a no-op.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

/// Sentinel for "no descriptor".
const INVALID_FD: RawFd = -1;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// Owned socket descriptor.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Whether this value currently owns a descriptor.
    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    /// Close whatever is owned now and take ownership of `fd`.
    pub fn reset(&mut self, fd: RawFd) {
        let old = mem::replace(&mut self.fd, fd);
        close_fd(old);
    }

    /// Move the descriptor out, leaving `self` invalid.
    pub fn take(&mut self) -> Socket {
        Socket {
            fd: mem::replace(&mut self.fd, INVALID_FD),
        }
    }

    /// Accept one pending connection.
    ///
    /// Interrupted calls are retried; every other failure is returned as-is
    /// (including `WouldBlock` for non-blocking listeners).
    pub fn accept(&self) -> io::Result<Socket> {
        loop {
            // SAFETY: null address pointers are allowed by accept(2) when the
            // peer address is not needed.
            let fd =
                unsafe { libc::accept(self.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd >= 0 {
                return Ok(Socket { fd });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Single `recv` into `buf`. `Ok(0)` is an orderly close by the peer.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: the pointer and length describe `buf`, which outlives the call.
            let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Send all of `buf`, looping over short writes.
    pub fn send_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            // SAFETY: the pointer and length describe `buf`, which outlives the call.
            let n = unsafe { libc::send(self.fd, buf.as_ptr().cast(), buf.len(), SEND_FLAGS) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "send returned 0"));
            }
            buf = &buf[n as usize..];
        }
        Ok(())
    }

    /// Toggle `O_NONBLOCK`.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        // SAFETY: fcntl on an owned descriptor with integer arguments.
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        // SAFETY: as above.
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Default for Socket {
    fn default() -> Self {
        Socket { fd: INVALID_FD }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        close_fd(self.fd);
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(mut self) -> RawFd {
        mem::replace(&mut self.fd, INVALID_FD)
    }
}

impl FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Socket { fd }
    }
}

impl From<socket2::Socket> for Socket {
    fn from(socket: socket2::Socket) -> Self {
        Socket {
            fd: socket.into_raw_fd(),
        }
    }
}

fn close_fd(fd: RawFd) {
    if fd >= 0 {
        // SAFETY: the descriptor is owned and is never used again after this call.
        unsafe { libc::close(fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_pair() -> (Socket, Socket) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe { (Socket::from_raw_fd(fds[0]), Socket::from_raw_fd(fds[1])) }
    }

    fn peer_closed(peer: &Socket) -> bool {
        let mut buf = [0u8; 8];
        matches!(peer.recv(&mut buf), Ok(0))
    }

    #[test]
    fn test_default_is_invalid() {
        let socket = Socket::default();
        assert!(!socket.is_valid());
        assert_eq!(socket.as_raw_fd(), -1);
    }

    #[test]
    fn test_drop_closes() {
        let (a, b) = socket_pair();
        assert!(a.is_valid());
        drop(a);
        assert!(peer_closed(&b));
    }

    #[test]
    fn test_take_leaves_source_invalid() {
        let (mut a, b) = socket_pair();
        let fd = a.as_raw_fd();
        let moved = a.take();
        assert!(!a.is_valid());
        assert_eq!(moved.as_raw_fd(), fd);

        // Dropping the emptied source must not close the moved descriptor.
        drop(a);
        moved.send_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(b.recv(&mut buf).unwrap(), 1);

        drop(moved);
        assert!(peer_closed(&b));
    }

    #[test]
    fn test_reset_closes_previous() {
        let (mut a, a_peer) = socket_pair();
        let (c, c_peer) = socket_pair();
        let new = c.into_raw_fd();
        a.reset(new);
        assert!(peer_closed(&a_peer));
        assert_eq!(a.as_raw_fd(), new);

        a.send_all(b"y").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(c_peer.recv(&mut buf).unwrap(), 1);
    }

    #[test]
    fn test_into_raw_fd_releases_ownership() {
        let (a, b) = socket_pair();
        let fd = a.into_raw_fd();
        let rc = unsafe { libc::send(fd, b"z".as_ptr().cast(), 1, 0) };
        assert_eq!(rc, 1);
        drop(unsafe { Socket::from_raw_fd(fd) });
        let mut buf = [0u8; 1];
        assert_eq!(b.recv(&mut buf).unwrap(), 1);
        assert!(peer_closed(&b));
    }

    #[test]
    fn test_send_and_recv() {
        let (a, b) = socket_pair();
        a.send_all(b"hello\n").unwrap();
        let mut buf = [0u8; 16];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");

        drop(a);
        assert_eq!(b.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_nonblocking_recv_would_block() {
        let (a, _b) = socket_pair();
        a.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 4];
        let err = a.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
