//! PNSim Test Harness - Multi-node scenarios and sample models
//!
//! This crate provides:
//! - A cluster harness running several nodes on one in-process broker
//! - A scripted peer that answers port requests and records traffic
//! - Sample nets (weather generator, heating loop, thermostat, delay line)
//! - End-to-end scenarios over the whole stack

pub mod cluster;
pub mod nets;
pub mod peer;
pub mod scenarios;

pub use cluster::*;
pub use nets::*;
pub use peer::*;
pub use scenarios::*;
