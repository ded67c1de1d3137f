// WireGuard Steward Library
// Shared modules for the daemon and tests

//! WireGuard Steward Library
//!
//! Control plane for WireGuard and AmneziaWG interfaces on a single host:
//! configuration files, peers and their access state, address allocation,
//! backups, usage-triggered jobs and live statistics.
//!
//! # Main Components
//!
//! - [`registry`]: Name to configuration map owned by the daemon
//! - [`configuration`]: One interface, its peers and every operation on them
//! - [`conf_file`]: Configuration file parsing and rewriting
//! - [`store`]: SQLite persistence of peers, history, jobs and share links
//! - [`state`]: Peer access state machine
//! - [`ip_alloc`]: Free address counting and enumeration
//! - [`backup`]: Point-in-time backups
//! - [`jobs`]: Conditional peer jobs and their scheduler
//! - [`poller`]: Live statistics refresh
//! - [`wg_controller`]: Tunnel utility control and statistics
//! - [`config`]: Daemon settings parsing and validation

pub mod backup;
pub mod conf_file;
pub mod config;
pub mod configuration;
pub mod error;
pub mod ip_alloc;
pub mod jobs;
pub mod peer;
pub mod poller;
pub mod registry;
pub mod share;
pub mod state;
pub mod store;
pub mod types;
pub mod wg_controller;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
