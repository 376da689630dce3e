//! tcp-engines: one line echo protocol, five connection-handling engines.
//!
//! Engines:
//! - Threaded: one blocking OS thread per connection
//! - Select: single-threaded readiness polling over an `fd_set`
//! - Poll: single-threaded readiness polling over a `pollfd` list
//! - Epoll: single-threaded edge-triggered readiness polling
//! - IoUring: single-threaded completion-based I/O (Linux only)
//!
//! A `Server` picks one engine at runtime from an `EngineKind` and exposes
//! the same control surface for all of them: `run`, `stop`, `name` and the
//! live counters.

pub mod config;
pub mod engine;
pub mod listener;
pub mod protocol;
pub mod server;
pub mod socket;
pub mod stats;

pub use engine::uring_supported;
pub use server::{Engine, EngineKind, Server, UnknownEngine};
pub use stats::ServerStats;
