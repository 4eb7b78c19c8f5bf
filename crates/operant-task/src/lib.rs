//! Operant Task - Per-chamber finite state machines
//!
//! This crate defines what an experiment task is and how one runs:
//! - Task contract (components, constants, states, completion)
//! - State tables (explicit state id -> handler dispatch)
//! - TaskCtx (runtime fields, timers, component cache, outbox)
//! - Machine (object-safe `ChamberTask` driven by the task process)
//! - Setup (binding validation and constant overrides)

pub mod ctx;
pub mod machine;
pub mod setup;
pub mod spec;

pub use ctx::*;
pub use machine::*;
pub use setup::*;
pub use spec::*;
