//! Shared server state and the periodic statistics reporter.
//!
//! `ServerStats` is the only state shared between an engine's event loop,
//! its per-connection threads (threaded engine), the statistics reporter and
//! whoever calls `stop()`: the running flag, two counters, the bound port and
//! a slot holding the listening descriptor so `stop()` can wake the loop.

use chrono::Local;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default interval between statistics lines.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Longest single sleep of the reporter before it rechecks the running flag.
const REPORTER_TICK: Duration = Duration::from_millis(100);

/// Counters and control flags for one engine instance.
#[derive(Debug)]
pub struct ServerStats {
    running: AtomicBool,
    /// Set by `request_stop`; never cleared, so a stop before listening sticks.
    stop_requested: AtomicBool,
    active_connections: AtomicUsize,
    total_messages: AtomicU64,
    local_port: AtomicU16,
    report_interval: Duration,
    /// Listening descriptor while the engine serves; cleared before it closes.
    listener: Mutex<Option<RawFd>>,
}

impl ServerStats {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            active_connections: AtomicUsize::new(0),
            total_messages: AtomicU64::new(0),
            local_port: AtomicU16::new(0),
            report_interval,
            listener: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    /// Port the listener is bound to, or 0 before the first successful listen.
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Acquire)
    }

    pub fn report_interval(&self) -> Duration {
        self.report_interval
    }

    pub(crate) fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_closed(1);
    }

    pub(crate) fn connections_closed(&self, count: usize) {
        let prev = self.active_connections.fetch_sub(count, Ordering::Relaxed);
        debug_assert!(prev >= count, "active connection count underflow");
    }

    /// Count one echoed message; returns the count before the increment.
    pub(crate) fn message_echoed(&self) -> u64 {
        self.total_messages.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish a freshly bound listener and flip the running flag on.
    ///
    /// Returns `false`, leaving the flag off, when a stop was already
    /// requested. Runs under the slot lock so it cannot interleave with
    /// `request_stop`.
    pub(crate) fn start_serving(&self, listener_fd: RawFd, port: u16) -> bool {
        let mut slot = self.listener_slot();
        *slot = Some(listener_fd);
        self.local_port.store(port, Ordering::Release);
        if self.stop_requested.load(Ordering::Acquire) {
            return false;
        }
        self.running.store(true, Ordering::Release);
        true
    }

    /// Withdraw the listener from the wake slot. Must happen before it is closed.
    pub(crate) fn finish_serving(&self) {
        self.running.store(false, Ordering::Release);
        self.listener_slot().take();
    }

    /// Request shutdown.
    ///
    /// Clears the running flag and shuts the listening socket down so that
    /// whatever the engine is blocked in (`accept`, `select`, `poll`,
    /// `epoll_wait`, a pending ring accept) returns. A request made before
    /// the engine listens is remembered: the engine then returns without
    /// serving.
    pub fn request_stop(&self) {
        let slot = self.listener_slot();
        self.stop_requested.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
        if let Some(fd) = *slot {
            // SAFETY: the slot only holds descriptors that are still open; the
            // owner clears it under this lock before closing.
            let rc = unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
            if rc < 0 {
                debug!(fd, error = %std::io::Error::last_os_error(), "Listener shutdown failed");
            }
        }
    }

    fn listener_slot(&self) -> MutexGuard<'_, Option<RawFd>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_INTERVAL)
    }
}

/// Background thread printing a statistics line every report interval.
///
/// Joined on drop; the thread exits within one tick of the running flag
/// going false.
pub struct StatsReporter {
    handle: Option<JoinHandle<()>>,
}

impl StatsReporter {
    pub fn spawn(name: &'static str, stats: Arc<ServerStats>) -> std::io::Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("{name}-stats"))
            .spawn(move || report_loop(name, &stats))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the reporter thread. Later calls are no-ops.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Statistics reporter panicked");
            }
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.join();
    }
}

fn report_loop(name: &str, stats: &ServerStats) {
    let interval = stats.report_interval();
    let mut next_report = Instant::now() + interval;

    while stats.is_running() {
        let now = Instant::now();
        if now >= next_report {
            report(name, stats);
            next_report = now + interval;
            continue;
        }
        thread::sleep((next_report - now).min(REPORTER_TICK));
    }
}

fn report(name: &str, stats: &ServerStats) {
    info!(
        time = %Local::now().format("%H:%M:%S%.3f"),
        engine = name,
        active = stats.active_connections(),
        messages = stats.total_messages(),
        "Server statistics"
    );
}
