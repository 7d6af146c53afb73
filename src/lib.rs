//! termshare - share a terminal session over SSH
//!
//! Hosts dial out to a rendezvous server and register a session; clients
//! connect to the same server over plain SSH, present a session
//! identifier, and are proxied through to the host's in-process SSHD.
//! Neither party needs a publicly reachable address. This crate holds the
//! server side: the SSH routing proxy, the session registry it protects,
//! and the session CLI.

pub mod admin;
pub mod cli;
pub mod config;
pub mod dial;
pub mod error;
pub mod identifier;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod session;
pub mod utils;

pub use error::{Error, Result};

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name
pub const NAME: &str = env!("CARGO_PKG_NAME");
