//! Relay daemon internals
//!
//! The binary in `main.rs` wires these together: session bring-up
//! (insmod, control channel, traced child), per-CPU relay draining, the
//! timestamp merge, and child/watchdog process management.

pub mod child;
pub mod cli;
pub mod control;
pub mod error;
pub mod merge;
pub mod relay;
pub mod session;
