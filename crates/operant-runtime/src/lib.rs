//! Operant Runtime - The task process and everything around it
//!
//! Every wake of the reactor runs the same stages:
//! 1. Wait on control, timer, and source channels (bounded by the poll timeout)
//! 2. Decode the ready batch
//! 3. Dispatch each event to its global handler or its chamber's task
//! 4. Drain follow-up events before the next external event
//! 5. Flush one batch per source
//! 6. Flush upstream and logger batches
//! 7. Heartbeat every running task when nothing arrived
//!
//! Around the reactor: runtime configuration, address and protocol files,
//! the task/source/logger registry, loggers, and tracing setup.

pub mod config;
pub mod logger;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod telemetry;

pub use config::*;
pub use logger::*;
pub use process::*;
pub use protocol::*;
pub use registry::*;
pub use telemetry::*;
