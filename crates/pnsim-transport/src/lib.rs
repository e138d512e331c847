//! PNSim Transport - Topic-based publish/subscribe
//!
//! This crate provides:
//! - The `Transport`/`Connector` seam the simulator talks through
//! - Two delivery tiers (fire-and-forget, exactly-once)
//! - MQTT-style topic filters (`+`, `#`)
//! - An in-process broker for single-process clusters and tests

pub mod filter;
pub mod memory;
pub mod transport;

pub use filter::*;
pub use memory::*;
pub use transport::*;
