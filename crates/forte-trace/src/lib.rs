//! # forte-trace
//!
//! Execution tracers for the forte EVM engine.
//!
//! This crate provides the two standard observers for the engine's
//! instrumentation hook layer:
//! - [`StandardTracer`]: structured per-step log plus a call tree
//! - [`PrestateTracer`]: pre/post state capture keyed by touched accounts

#![warn(missing_docs)]
#![warn(clippy::all)]

mod prestate;
mod tracer;

pub use prestate::{AccountState, PrestateConfig, PrestateTracer, StateChange};
pub use tracer::{
    CapturedLog, FrameNode, FrameStatus, MemoryWindow, StandardTracer, StructLog, TracerConfig,
};
