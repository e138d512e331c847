//! PNSim Core - Petri net data model
//!
//! This crate defines the structural foundation of the simulator:
//! - Tokens and token kinds
//! - Places (multisets) and their port roles
//! - Arc patterns, guards and bindings
//! - Transitions and their firing policies (Timed, Probabilistic, Priority)
//! - Petri nets and their remote port registry
//! - The crate-wide error type

pub mod error;
pub mod extension;
pub mod net;
pub mod pattern;
pub mod place;
pub mod token;
pub mod topic;
pub mod transition;

pub use error::*;
pub use extension::*;
pub use net::*;
pub use pattern::*;
pub use place::*;
pub use token::*;
pub use topic::*;
pub use transition::*;
