//! Operant Time - Software timers for every chamber
//!
//! One dedicated thread owns all armed timers:
//! - Timeout: named timer with a frozen-or-running remaining duration
//! - TimeoutManager: the thread and its command loop
//! - TimeoutHandle: fire-and-forget command API shared by tasks

pub mod manager;
pub mod timeout;

pub use manager::*;
pub use timeout::*;
