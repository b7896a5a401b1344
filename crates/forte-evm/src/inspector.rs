//! Instrumentation hook layer
//!
//! The dispatch loop holds an optional [`Inspector`]. When absent, the only
//! cost is one `Option` check per hook site; when present, the observer runs
//! synchronously and in-line at each hook point. Observers must copy any
//! data they keep — every snapshot here borrows frame-owned buffers that die
//! with the hook call.

use crate::error::EvmResult;
use crate::host::{CallParams, CallResult, Log};
use crate::memory::Memory;
use crate::opcode::Opcode;
use crate::stack::Stack;
use crate::EvmError;
use bytes::Bytes;
use forte_primitives::{Address, H256, U256};

/// A single observed interaction with host-held state, recorded while an
/// observer is attached and reported through [`StepResult::touches`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateTouch {
    /// SLOAD observed a slot value
    StorageRead {
        /// Account read
        address: Address,
        /// Slot read
        slot: H256,
        /// Value seen
        value: H256,
    },
    /// SSTORE wrote a slot
    StorageWrite {
        /// Account written
        address: Address,
        /// Slot written
        slot: H256,
        /// Value the slot had at the start of the top-level call
        original: H256,
        /// Value written
        value: H256,
    },
    /// BALANCE/SELFBALANCE observed an account balance
    BalanceRead {
        /// Account read
        address: Address,
        /// Balance seen
        value: U256,
    },
    /// EXTCODESIZE/EXTCODECOPY/EXTCODEHASH observed an account's code
    CodeRead {
        /// Account read
        address: Address,
        /// Code seen
        code: Bytes,
    },
    /// A create-family call produced a new account
    AccountCreated {
        /// The created account
        address: Address,
    },
}

/// Snapshot taken immediately before an instruction dispatches
#[derive(Debug)]
pub struct StepInfo<'a> {
    /// Index of the instruction in the analyzed stream
    pub inst_index: usize,
    /// Original program counter of the instruction
    pub pc: usize,
    /// Operation about to execute
    pub op: Opcode,
    /// Gas remaining before execution
    pub gas: u64,
    /// Call depth
    pub depth: u32,
    /// Executing contract
    pub address: Address,
    /// Current stack (bottom-first)
    pub stack: &'a Stack,
    /// Current memory
    pub memory: &'a Memory,
}

/// Snapshot taken immediately after an instruction completes
#[derive(Debug)]
pub struct StepResult<'a> {
    /// Original program counter of the instruction
    pub pc: usize,
    /// Operation that executed
    pub op: Opcode,
    /// Gas remaining before execution
    pub gas_before: u64,
    /// Gas remaining after execution
    pub gas_after: u64,
    /// Apparent cost of this step. Because fixed costs are pre-charged per
    /// block, this does not equal the operation's standalone cost when it
    /// shares a block with neighbors.
    pub gas_cost: u64,
    /// Call depth
    pub depth: u32,
    /// Executing contract
    pub address: Address,
    /// Stack after execution (bottom-first)
    pub stack: &'a Stack,
    /// Memory after execution
    pub memory: &'a Memory,
    /// Memory span written by this step, if any
    pub memory_written: Option<(usize, usize)>,
    /// Host state touched during this step
    pub touches: &'a [StateTouch],
    /// Logs emitted during this step
    pub logs: &'a [Log],
    /// Failure that terminated this step, if any
    pub error: Option<&'a EvmError>,
}

/// Summary handed to [`Inspector::finalize`] when the overall call completes
#[derive(Debug)]
pub struct CallOutcome<'a> {
    /// Total gas consumed by the call
    pub gas_used: u64,
    /// Whether the call failed (including revert)
    pub failed: bool,
    /// Final output bytes (return or revert data)
    pub output: &'a [u8],
    /// Terminal error, `None` on success
    pub error: Option<&'a EvmError>,
}

/// Pluggable execution observer.
///
/// All methods default to no-ops so observers implement only the hooks they
/// care about. Returning an error from any hook aborts the current call,
/// exactly like a native execution failure.
pub trait Inspector {
    /// Called immediately before an instruction dispatches
    fn step_before(&mut self, step: &StepInfo<'_>) -> EvmResult<()> {
        let _ = step;
        Ok(())
    }

    /// Called immediately after an instruction completes (or fails)
    fn step_after(&mut self, step: &StepResult<'_>) -> EvmResult<()> {
        let _ = step;
        Ok(())
    }

    /// Called immediately before a call/create message is issued to the host
    fn message_before(&mut self, params: &CallParams) -> EvmResult<()> {
        let _ = params;
        Ok(())
    }

    /// Called immediately after a call/create message returns, before the
    /// host releases the output buffer
    fn message_after(&mut self, result: &CallResult) -> EvmResult<()> {
        let _ = result;
        Ok(())
    }

    /// Called once when the overall call completes
    fn finalize(&mut self, outcome: &CallOutcome<'_>) -> EvmResult<()> {
        let _ = outcome;
        Ok(())
    }
}

/// Observer that records nothing; useful as a test double
#[derive(Debug, Default)]
pub struct NoopInspector;

impl Inspector for NoopInspector {}
