//! Operant Wire Protocol - Binary event batches
//!
//! This crate implements the message format shared by every channel:
//! - Batch codec (version + count + tagged events)
//! - Length-delimited frames for byte-pipe transports
//! - Channel links carrying encoded batches between threads

pub mod codec;
pub mod frame;
pub mod link;

pub use codec::*;
pub use frame::*;
pub use link::*;
