//! Engine selection.
//!
//! `Server` is a closed union over the five engines. The variant is fixed at
//! construction from an `EngineKind`; every call is dispatched with a plain
//! `match`, so there is no boxing and no vtable between the caller and the
//! engine loop.

use crate::engine::{IoUringServer, PollServer, SelectServer, ThreadedServer};
#[cfg(any(target_os = "linux", target_os = "macos"))]
use crate::engine::EpollServer;
use crate::stats::{ServerStats, DEFAULT_REPORT_INTERVAL};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Capability set shared by every engine.
pub trait Engine {
    /// Human-readable engine name used in logs.
    fn name(&self) -> &'static str;

    /// Shared counters and running flag.
    fn stats(&self) -> &Arc<ServerStats>;

    /// Listen on `port` and serve until stopped.
    ///
    /// Returns an error only when setup fails; per-connection failures are
    /// handled inside the loop.
    fn run(&self, port: u16) -> io::Result<()>;

    /// Request shutdown. Safe to call repeatedly and from any thread.
    fn stop(&self) {
        self.stats().request_stop();
    }

    fn active_connections(&self) -> usize {
        self.stats().active_connections()
    }

    fn total_messages(&self) -> u64 {
        self.stats().total_messages()
    }
}

/// Which engine a `Server` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Threaded,
    Select,
    Poll,
    Epoll,
    IoUring,
}

impl EngineKind {
    pub const ALL: [EngineKind; 5] = [
        EngineKind::Threaded,
        EngineKind::Select,
        EngineKind::Poll,
        EngineKind::Epoll,
        EngineKind::IoUring,
    ];

    /// Name accepted on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Threaded => "threaded",
            EngineKind::Select => "select",
            EngineKind::Poll => "poll",
            EngineKind::Epoll => "epoll",
            EngineKind::IoUring => "iouring",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = UnknownEngine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "threaded" | "bio" => Ok(EngineKind::Threaded),
            "select" => Ok(EngineKind::Select),
            "poll" => Ok(EngineKind::Poll),
            "epoll" => Ok(EngineKind::Epoll),
            "iouring" | "io_uring" => Ok(EngineKind::IoUring),
            _ => Err(UnknownEngine(s.to_string())),
        }
    }
}

/// An engine name outside the supported vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEngine(pub String);

impl fmt::Display for UnknownEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown engine '{}' (expected threaded, select, poll, epoll or iouring)",
            self.0
        )
    }
}

impl std::error::Error for UnknownEngine {}

/// One live engine selected at runtime.
pub enum Server {
    Threaded(ThreadedServer),
    Select(SelectServer),
    Poll(PollServer),
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    Epoll(EpollServer),
    IoUring(IoUringServer),
}

macro_rules! dispatch {
    ($server:expr, $engine:ident => $body:expr) => {
        match $server {
            Server::Threaded($engine) => $body,
            Server::Select($engine) => $body,
            Server::Poll($engine) => $body,
            #[cfg(any(target_os = "linux", target_os = "macos"))]
            Server::Epoll($engine) => $body,
            Server::IoUring($engine) => $body,
        }
    };
}

impl Server {
    /// Build the engine for `kind` with the default report interval.
    ///
    /// # Panics
    /// Panics for `EngineKind::Epoll` on platforms without mio support.
    pub fn new(kind: EngineKind) -> Self {
        Self::with_report_interval(kind, DEFAULT_REPORT_INTERVAL)
    }

    pub fn with_report_interval(kind: EngineKind, interval: Duration) -> Self {
        let stats = Arc::new(ServerStats::new(interval));
        match kind {
            EngineKind::Threaded => Server::Threaded(ThreadedServer::new(stats)),
            EngineKind::Select => Server::Select(SelectServer::new(stats)),
            EngineKind::Poll => Server::Poll(PollServer::new(stats)),
            #[cfg(any(target_os = "linux", target_os = "macos"))]
            EngineKind::Epoll => Server::Epoll(EpollServer::new(stats)),
            #[cfg(not(any(target_os = "linux", target_os = "macos")))]
            EngineKind::Epoll => panic!("epoll engine is not available on this platform"),
            EngineKind::IoUring => Server::IoUring(IoUringServer::new(stats)),
        }
    }

    /// Build from a command-line name; unknown names are an error.
    pub fn from_name(name: &str) -> Result<Self, UnknownEngine> {
        name.parse().map(Self::new)
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            Server::Threaded(_) => EngineKind::Threaded,
            Server::Select(_) => EngineKind::Select,
            Server::Poll(_) => EngineKind::Poll,
            #[cfg(any(target_os = "linux", target_os = "macos"))]
            Server::Epoll(_) => EngineKind::Epoll,
            Server::IoUring(_) => EngineKind::IoUring,
        }
    }

    /// Blocks until `stop()` is called or setup fails.
    pub fn run(&self, port: u16) -> io::Result<()> {
        dispatch!(self, engine => engine.run(port))
    }

    pub fn stop(&self) {
        dispatch!(self, engine => engine.stop())
    }

    pub fn name(&self) -> &'static str {
        dispatch!(self, engine => engine.name())
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        dispatch!(self, engine => engine.stats())
    }

    pub fn active_connections(&self) -> usize {
        self.stats().active_connections()
    }

    pub fn total_messages(&self) -> u64 {
        self.stats().total_messages()
    }

    pub fn is_running(&self) -> bool {
        self.stats().is_running()
    }

    /// Bound port once listening (useful with `run(0)`).
    pub fn local_port(&self) -> u16 {
        self.stats().local_port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_engine_kind() {
        assert_eq!("threaded".parse(), Ok(EngineKind::Threaded));
        assert_eq!("bio".parse(), Ok(EngineKind::Threaded));
        assert_eq!("select".parse(), Ok(EngineKind::Select));
        assert_eq!("POLL".parse(), Ok(EngineKind::Poll));
        assert_eq!("epoll".parse(), Ok(EngineKind::Epoll));
        assert_eq!("iouring".parse(), Ok(EngineKind::IoUring));
    }

    #[test]
    fn test_unknown_engine_is_rejected() {
        let err = "kqueue".parse::<EngineKind>().unwrap_err();
        assert_eq!(err, UnknownEngine("kqueue".to_string()));
        assert!(err.to_string().contains("kqueue"));
        assert!(Server::from_name("").is_err());
    }

    #[test]
    fn test_kind_round_trips_through_name() {
        for kind in EngineKind::ALL {
            assert_eq!(kind.as_str().parse(), Ok(kind));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_server_names() {
        let expected = [
            (EngineKind::Threaded, "ThreadedServer"),
            (EngineKind::Select, "SelectServer"),
            (EngineKind::Poll, "PollServer"),
            (EngineKind::Epoll, "EpollServer"),
            (EngineKind::IoUring, "IOUringServer"),
        ];
        for (kind, name) in expected {
            let server = Server::new(kind);
            assert_eq!(server.kind(), kind);
            assert_eq!(server.name(), name);
            assert_eq!(server.active_connections(), 0);
            assert_eq!(server.total_messages(), 0);
            assert!(!server.is_running());
        }
    }

    #[test]
    fn test_stop_before_run_returns_without_serving() {
        let server = Server::new(EngineKind::Poll);
        server.stop();
        server.stop();
        assert!(!server.is_running());

        server.run(0).unwrap();
        assert!(!server.is_running());
        assert_eq!(server.active_connections(), 0);
    }
}
