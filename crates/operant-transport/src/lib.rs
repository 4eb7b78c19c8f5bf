//! Operant Transport Layer
//!
//! Carries framed batches over any byte pipe so a source can live in
//! another OS process.

pub mod pipe;

pub use pipe::*;
