//! # probescope - probe resolution and code emission
//!
//! This crate turns probe-point patterns (`kernel.function("sys_read").return`,
//! `module("ext3").statement(0xbeef)`, ...) into concrete instrumentation:
//! it walks DWARF debug information for the kernel and its loadable modules,
//! resolves each pattern to instruction addresses, rewrites the probe body so
//! that target-variable references (`$var.field[n]`) become calls to
//! synthesized accessor functions, and emits the C source for probe
//! registration, dispatch and fault handling that the kernel module build
//! consumes.
//!
//! ## Pipeline
//!
//! ```text
//! pattern + body ──▶ query ──▶ dwarf (modules/CUs/functions/lines)
//!                      │             │
//!                      │             ▼
//!                      │           loc (location expression → C snippet)
//!                      ▼             │
//!                   rewrite ◀────────┘
//!                 (flavours, body rewriting, variant dedup)
//!                      │
//!                      ▼
//!                    emit (kprobe arrays, dispatch, timers, begin/end)
//! ```
//!
//! The script parser and the top-level driver are external; they hand this
//! crate an [`ast::Probe`] plus the parameter table produced by matching the
//! probe point against [`patterns::register_patterns`].

pub mod ast;
pub mod dwarf;
pub mod emit;
pub mod error;
pub mod loc;
pub mod output;
pub mod patterns;
pub mod query;
pub mod rewrite;
pub mod session;

pub use error::SemanticError;
pub use session::Session;
