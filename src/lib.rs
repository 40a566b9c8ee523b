//! bridgetest -- synthetic traffic generation and per-stream accounting for
//! validating Ethernet bridges.
//!
//! The crate drives a packet-generation engine (remote over TCP, or the
//! in-process simulator), builds tagged UDP/IGMP streams between registered
//! test ports, runs them, and attributes the resulting counters back to
//! each port.

pub mod capture;
pub mod config;
pub mod engine;
pub mod headers;
pub mod scenario;
pub mod traffic;

pub use config::TrafficConfig;
pub use traffic::{InterfaceStats, Traffic, TrafficError};
