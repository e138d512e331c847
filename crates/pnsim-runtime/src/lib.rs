//! PNSim Runtime - Simulation node
//!
//! This crate runs Petri nets against the wall clock:
//! - `SimNode`: event loop, net execution and lifecycle
//! - `PortBrokerClient`: port negotiation and token routing over a transport
//! - `NodeConfig`: serde-loadable node settings
//! - Wake signalling and shutdown tokens
//! - Tracing subscriber initialisation

pub mod config;
pub mod node;
pub mod ports;
pub mod signal;
pub mod telemetry;

pub use config::*;
pub use node::*;
pub use ports::*;
pub use signal::*;
pub use telemetry::*;
