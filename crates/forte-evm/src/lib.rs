//! # forte-evm
//!
//! Block-analyzed EVM execution engine.
//!
//! This crate provides:
//! - Bytecode analyzer producing a block-structured instruction stream
//! - Gas-metered dispatch loop over analyzed code
//! - Host interface for storage, calls and logs, plus an in-memory mock
//! - Instrumentation hook layer for tracers
//! - Reference mini-interpreter and shadow comparator

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod analysis;
pub mod context;
mod error;
pub mod frame;
pub mod gas;
pub mod host;
pub mod inspector;
pub mod interpreter;
pub mod memory;
pub mod mini;
pub mod opcode;
mod ops;
pub mod rules;
pub mod shadow;
pub mod stack;

pub use analysis::{analyze, CodeAnalysis, Instruction};
pub use context::{BlockContext, Environment, TxContext};
pub use error::{EvmError, EvmResult};
pub use frame::{Frame, FrameInput};
pub use host::{
    CallKind, CallParams, CallResult, CallScope, Host, Log, MockHost, SnapshotId,
};
pub use inspector::{CallOutcome, Inspector, NoopInspector, StateTouch, StepInfo, StepResult};
pub use interpreter::{execute_code, execute_frame, run_frame, Evm};
pub use mini::MiniEvm;
pub use opcode::Opcode;
pub use rules::ChainRules;
pub use shadow::{
    compare_call_results, compare_step, MismatchContext, MismatchField, ShadowConfig,
    ShadowMismatch, ShadowMode, ShadowRunner,
};
pub use stack::Stack;
