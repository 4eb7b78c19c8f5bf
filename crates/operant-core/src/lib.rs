//! Operant Core - Fundamental types shared by every process
//!
//! This crate defines the vocabulary of the task-execution engine:
//! - Identifiers (ChamberId, StateId, ComponentId, SourceId)
//! - Component values and metadata
//! - Component capabilities and address bindings
//! - The closed event set exchanged between processes
//! - The error taxonomy

pub mod component;
pub mod error;
pub mod event;
pub mod id;
pub mod value;

pub use component::*;
pub use error::*;
pub use event::*;
pub use id::*;
pub use value::*;
