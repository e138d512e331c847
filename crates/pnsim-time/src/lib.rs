//! PNSim Time - Simulation clock and event scheduling
//!
//! This crate implements:
//! - The time model: `NOW`, offsets from the simulation start, `INF`
//! - The simulation clock anchored at start with an optional end
//! - A thread-safe priority-time scheduler of actions

pub mod clock;
pub mod scheduler;

pub use clock::*;
pub use scheduler::*;
