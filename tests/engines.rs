//! End-to-end tests driving every engine over real TCP connections.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tcp_engines::{uring_supported, EngineKind, Server};

const WAIT: Duration = Duration::from_secs(5);

/// Server running on an ephemeral port in a background thread.
struct Running {
    server: Arc<Server>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
    port: u16,
}

impl Running {
    fn start(kind: EngineKind) -> Self {
        let server = Arc::new(Server::with_report_interval(kind, Duration::from_secs(1)));
        let handle = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.run(0))
        };

        assert!(
            wait_for(|| server.is_running() && server.local_port() != 0),
            "{} never started listening",
            server.name()
        );
        let port = server.local_port();

        Self {
            server,
            handle: Some(handle),
            port,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        stream
    }

    /// Stop twice and join the run thread; returns what `run` returned.
    fn stop(mut self) -> std::io::Result<()> {
        self.server.stop();
        self.server.stop();
        let handle = self.handle.take().unwrap();

        let deadline = Instant::now() + WAIT;
        while !handle.is_finished() {
            assert!(
                Instant::now() < deadline,
                "{} did not return from run after stop",
                self.server.name()
            );
            thread::sleep(Duration::from_millis(10));
        }
        handle.join().unwrap()
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.server.stop();
    }
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn request(stream: &mut TcpStream, line: &str) -> String {
    stream.write_all(line.as_bytes()).unwrap();
    let mut buf = [0u8; 2048];
    let n = stream.read(&mut buf).unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

fn sync_engines() -> Vec<EngineKind> {
    let mut kinds = vec![EngineKind::Threaded, EngineKind::Select, EngineKind::Poll];
    if cfg!(any(target_os = "linux", target_os = "macos")) {
        kinds.push(EngineKind::Epoll);
    }
    kinds
}

#[test]
fn test_sync_engines_echo_with_sequence_numbers() {
    for kind in sync_engines() {
        let running = Running::start(kind);
        let mut client = running.connect();

        assert_eq!(request(&mut client, "hello\n"), "Echo[0]:hello", "{kind}");
        assert_eq!(request(&mut client, "world\n"), "Echo[1]:world", "{kind}");
        assert_eq!(request(&mut client, "no newline"), "Echo[2]:no newline", "{kind}");
        assert!(wait_for(|| running.server.total_messages() == 3), "{kind}");

        drop(client);
        running.stop().unwrap();
    }
}

#[test]
fn test_sync_engines_count_connections() {
    for kind in sync_engines() {
        let running = Running::start(kind);

        let mut clients: Vec<TcpStream> = (0..3).map(|_| running.connect()).collect();
        for client in clients.iter_mut() {
            assert!(request(client, "ping\n").ends_with(":ping"), "{kind}");
        }
        assert_eq!(running.server.active_connections(), 3, "{kind}");

        clients.clear();
        assert!(
            wait_for(|| running.server.active_connections() == 0),
            "{kind} kept connections after clients left"
        );
        running.stop().unwrap();
    }
}

#[test]
fn test_disconnect_without_data_is_not_a_message() {
    for kind in sync_engines() {
        let running = Running::start(kind);

        let client = running.connect();
        assert!(wait_for(|| running.server.active_connections() == 1), "{kind}");
        client.shutdown(Shutdown::Both).unwrap();
        drop(client);

        assert!(wait_for(|| running.server.active_connections() == 0), "{kind}");
        assert_eq!(running.server.total_messages(), 0, "{kind}");
        running.stop().unwrap();
    }
}

#[test]
fn test_threaded_engine_many_clients() {
    let running = Running::start(EngineKind::Threaded);
    let port = running.port;

    let handles: Vec<_> = (0..100)
        .map(|id| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
                stream.set_read_timeout(Some(WAIT)).unwrap();
                for n in 0..10 {
                    let reply = request(&mut stream, &format!("client {id} message {n}\n"));
                    assert!(reply.starts_with("Echo["), "{reply}");
                    assert!(reply.ends_with(&format!("]:client {id} message {n}")), "{reply}");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(wait_for(|| running.server.total_messages() == 1000));
    assert!(wait_for(|| running.server.active_connections() == 0));
    running.stop().unwrap();
}

#[test]
fn test_stop_without_clients() {
    for kind in sync_engines() {
        let running = Running::start(kind);
        let server = Arc::clone(&running.server);
        running.stop().unwrap();
        assert!(!server.is_running(), "{kind}");
    }
}

#[test]
fn test_stop_before_run_is_honored() {
    let mut kinds = sync_engines();
    if uring_supported() {
        kinds.push(EngineKind::IoUring);
    }

    for kind in kinds {
        let server = Arc::new(Server::new(kind));
        server.stop();

        let handle = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.run(0))
        };
        assert!(
            wait_for(|| handle.is_finished()),
            "{kind} served after an earlier stop"
        );
        handle.join().unwrap().unwrap();
        assert!(!server.is_running(), "{kind}");
    }
}

#[test]
fn test_port_in_use_fails() {
    let running = Running::start(EngineKind::Poll);
    let second = Server::new(EngineKind::Select);
    assert!(second.run(running.port).is_err());
    assert!(!second.is_running());
    running.stop().unwrap();
}

#[test]
fn test_unknown_engine_name() {
    assert!(Server::from_name("kqueue").is_err());
    assert!(Server::from_name("").is_err());
    assert_eq!(Server::from_name("BIO").unwrap().kind(), EngineKind::Threaded);
}

#[test]
fn test_uring_echo_format() {
    if !uring_supported() {
        eprintln!("io_uring unavailable, skipping");
        return;
    }

    let running = Running::start(EngineKind::IoUring);
    let mut client = running.connect();

    assert_eq!(request(&mut client, "hello\n"), "Echo: hello(Msg #1)\n");
    assert_eq!(request(&mut client, "again\n"), "Echo: again(Msg #2)\n");
    assert_eq!(running.server.active_connections(), 1);

    drop(client);
    assert!(wait_for(|| running.server.active_connections() == 0));
    assert_eq!(running.server.total_messages(), 2);
    running.stop().unwrap();
}

#[test]
fn test_uring_disconnect_without_data_is_not_a_message() {
    if !uring_supported() {
        eprintln!("io_uring unavailable, skipping");
        return;
    }

    let running = Running::start(EngineKind::IoUring);
    let clients: Vec<TcpStream> = (0..5).map(|_| running.connect()).collect();
    assert!(wait_for(|| running.server.active_connections() == 5));

    for client in clients {
        client.shutdown(Shutdown::Both).unwrap();
    }
    assert!(wait_for(|| running.server.active_connections() == 0));
    assert_eq!(running.server.total_messages(), 0);

    // The engine keeps serving after the silent disconnects.
    let mut client = running.connect();
    assert_eq!(request(&mut client, "after\n"), "Echo: after(Msg #1)\n");
    drop(client);
    running.stop().unwrap();
}

#[test]
fn test_uring_many_clients_and_stop_with_open_connections() {
    if !uring_supported() {
        eprintln!("io_uring unavailable, skipping");
        return;
    }

    let running = Running::start(EngineKind::IoUring);
    let mut clients: Vec<TcpStream> = (0..20).map(|_| running.connect()).collect();
    for (i, client) in clients.iter_mut().enumerate() {
        let reply = request(client, &format!("line {i}\n"));
        assert!(reply.starts_with(&format!("Echo: line {i}(Msg #")), "{reply}");
        assert!(reply.ends_with(")\n"), "{reply}");
    }
    assert_eq!(running.server.total_messages(), 20);
    assert_eq!(running.server.active_connections(), 20);

    let server = Arc::clone(&running.server);
    running.stop().unwrap();
    assert_eq!(server.active_connections(), 0);

    // Open clients observe the close.
    let mut buf = [0u8; 16];
    for client in clients.iter_mut() {
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }
}

#[cfg(not(target_os = "linux"))]
#[test]
fn test_uring_unsupported_off_linux() {
    let server = Server::new(EngineKind::IoUring);
    let err = server.run(0).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
}
