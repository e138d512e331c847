//! PNSim Wire - Text formats exchanged over the broker
//!
//! This crate implements the two payload grammars:
//! - Data topics: `&`-joined tokens, each `<typename>:<value>`
//! - The `control` topic: `R`, `A`, `S`, `F` and `U` messages

pub mod codec;
pub mod control;

pub use codec::*;
pub use control::*;
