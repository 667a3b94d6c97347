//! Ghostwarden - keeps a TLS tunnel proxy pointed at a healthy target
//!
//! This library supervises a single externally-launched proxy process:
//! - Picks targets one at a time from a line-oriented targets file
//! - Re-reads the file once every target has been tried
//! - Starts the proxy and waits until it accepts connections
//! - Probes the target through the proxy and rotates on failure
//! - Stops the proxy with escalating signals, failing loudly on leaks

pub mod child;
pub mod config;
pub mod error;
pub mod failover;
pub mod ghostunnel;
pub mod healthcheck;
pub mod process;
pub mod target;

#[cfg(test)]
mod testing;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
