//! Operant Source - Hardware isolation
//!
//! Each hardware interface runs on its own thread behind a batch link:
//! - Source contract (register, read, write, close)
//! - SourceLink for push updates from worker threads
//! - SourceProcess host (message dispatch + lifecycle)
//! - VirtualSource, in-memory hardware

pub mod link;
pub mod process;
pub mod source;
pub mod virtual_source;

pub use link::*;
pub use process::*;
pub use source::*;
pub use virtual_source::*;
