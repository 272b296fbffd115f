//! Core library for wterm: bridge browser WebSocket clients to local
//! terminal subprocesses.
//!
//! One accepted WebSocket session owns one freshly spawned child process
//! attached to a pseudo-terminal. [`server`] accepts and admits
//! connections, [`session`] runs the per-client protocol state machine
//! and the PTY relay, [`pty`] wraps process and PTY plumbing,
//! [`protocol`] is the wire codec shared with the browser client, and
//! [`registry`] enforces the process-wide client limits.

pub mod config;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod server;
pub mod session;
