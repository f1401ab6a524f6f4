//! The `dpm-os` library crate runs the DPM (Dynamic Power Management)
//! manager on devices equipped with an operating system.
//!
//! A battery-powered network device sleeps between packets. The manager
//! keeps its network sessions alive across those sleeps:
//!
//! - It boots `TCP` and `UDP` sessions, clients or servers, optionally
//!   secured through `TLS` or `DTLS`, and application timers from the
//!   configuration the application registers.
//! - It tracks every unit of work started by sessions, timers and the
//!   application itself, and signals when none is outstanding, so that the
//!   device is allowed to sleep.
//! - At sleep entry it saves the session and timer state into retention
//!   memory, and restores it on the next wake, so that connections are
//!   replayed without the application reconfiguring them.
//!
//! Sockets, retention memory, non-volatile storage and the secure engine are
//! reached through traits. The crate ships a `tokio` socket transport and
//! in-process counterparts of every collaborator, useful to simulate a
//! device.
//!
//! The manager leverages `tokio` as an asynchronous executor: every session
//! runs in its own task, while timer and keepalive callbacks are dispatched
//! one at a time by a dedicated event task.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Events delivered to the application callbacks.
pub mod callbacks;
/// Job accounting and sleep permission.
pub mod coordinator;
/// The DPM manager.
pub mod manager;
/// Non-volatile key-value storage.
pub mod nvram;
/// Retention memory and the retention store.
pub mod retention;
/// Secure sessions.
pub mod secure;
/// Session state machines.
pub mod session;
/// Socket transports.
pub mod transport;

mod events;
mod report;
mod timer;

pub use report::ErrorCallback;
