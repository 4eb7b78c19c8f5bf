//! Operant Test Harness - End-to-end validation of the task process
//!
//! This crate provides:
//! - Test tasks with known state graphs
//! - A rig running a real task process over virtual hardware
//! - Scenario tests for timing, ordering, and failure containment

pub mod harness;
pub mod tasks;

#[cfg(test)]
mod scenarios;

pub use harness::*;
pub use tasks::*;
