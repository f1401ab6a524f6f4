//! The data model shared by every component of the DPM (Dynamic Power
//! Management) manager.
//!
//! A battery-powered network device sleeps between packets. Before it may
//! enter sleep, every unit of work started on its behalf must be completed,
//! and the state needed to replay its network sessions on wake must be
//! written into a small retention-memory region that survives power-off.
//!
//! This crate provides APIs to:
//!
//! - Describe network sessions and application timers through
//!   serializable configuration structures, along with their validation
//!   rules.
//! - Account for outstanding jobs through a reference-counted ledger which
//!   decides whether sleep is permitted.
//! - Encode and decode the retention blob, a magic-tagged snapshot of the
//!   configuration which crosses the power-off boundary.
//! - Classify failures through the DPM error catalogue.
//!
//! The runtime which drives sockets, timers and tasks lives in `dpm-os`.
//!
//! This crate can be compiled for `no_std` environments with an allocator.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

/// Session and timer configuration.
pub mod config;
/// Error catalogue.
pub mod error;
/// Job accounting.
pub mod job;
/// Retention blob and its fixed-capacity encoding.
pub mod retention;
/// Boot and wakeup sources.
pub mod wakeup;
