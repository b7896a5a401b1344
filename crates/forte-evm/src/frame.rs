//! Per-call execution frame
//!
//! A frame owns the mutable state of one in-progress call: stack, memory,
//! gas, call metadata and the transient observation buffers the hook layer
//! reads from. Exactly one dispatch-loop invocation consumes a frame; nested
//! calls get independent child frames.

use crate::error::{EvmError, EvmResult};
use crate::gas;
use crate::host::{Log, SnapshotId};
use crate::inspector::StateTouch;
use crate::memory::Memory;
use crate::stack::Stack;
use bytes::Bytes;
use forte_primitives::{Address, U256};

/// Construction parameters for a frame
#[derive(Clone, Debug)]
pub struct FrameInput {
    /// Code to execute
    pub code: Bytes,
    /// Call data
    pub input: Bytes,
    /// Executing contract address
    pub address: Address,
    /// Caller address
    pub caller: Address,
    /// Call value
    pub value: U256,
    /// Gas available to this call
    pub gas: u64,
    /// Call depth
    pub depth: u32,
    /// Whether state modification is forbidden
    pub is_static: bool,
    /// Host snapshot protecting this call
    pub snapshot: SnapshotId,
}

/// Mutable execution context of one call
#[derive(Debug)]
pub struct Frame {
    pub(crate) stack: Stack,
    pub(crate) memory: Memory,
    gas: u64,
    initial_gas: u64,
    refund: u64,
    code: Bytes,
    input: Bytes,
    address: Address,
    caller: Address,
    value: U256,
    depth: u32,
    is_static: bool,
    snapshot: SnapshotId,
    return_data: Vec<u8>,
    output: Vec<u8>,
    // Per-step observation buffers, populated only while an observer is
    // attached
    recording: bool,
    touches: Vec<StateTouch>,
    step_logs: Vec<Log>,
    memory_written: Option<(usize, usize)>,
    // Portion of the current block's pre-charge not yet attributable to
    // retired instructions; maintained only under per-step shadow
    block_gas_outstanding: u64,
}

impl Frame {
    /// Create a frame at call entry
    pub fn new(input: FrameInput) -> Self {
        Self {
            stack: Stack::new(),
            memory: Memory::new(),
            gas: input.gas,
            initial_gas: input.gas,
            refund: 0,
            code: input.code,
            input: input.input,
            address: input.address,
            caller: input.caller,
            value: input.value,
            depth: input.depth,
            is_static: input.is_static,
            snapshot: input.snapshot,
            return_data: Vec::new(),
            output: Vec::new(),
            recording: false,
            touches: Vec::new(),
            step_logs: Vec::new(),
            memory_written: None,
            block_gas_outstanding: 0,
        }
    }

    /// Gas remaining
    pub fn gas(&self) -> u64 {
        self.gas
    }

    /// Gas the frame started with
    pub fn initial_gas(&self) -> u64 {
        self.initial_gas
    }

    /// Accumulated refund counter (applied at the call boundary)
    pub fn refund(&self) -> u64 {
        self.refund
    }

    /// The stack
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// The memory
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Executing contract address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Caller address
    pub fn caller(&self) -> Address {
        self.caller
    }

    /// Call value
    pub fn value(&self) -> U256 {
        self.value
    }

    /// Call data
    pub fn input(&self) -> &Bytes {
        &self.input
    }

    /// Executing code
    pub fn code(&self) -> &Bytes {
        &self.code
    }

    /// Call depth
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Whether state modification is forbidden
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Host snapshot protecting this call
    pub fn snapshot(&self) -> SnapshotId {
        self.snapshot
    }

    /// Return data of the most recent nested call
    pub fn return_data(&self) -> &[u8] {
        &self.return_data
    }

    pub(crate) fn set_return_data(&mut self, data: Vec<u8>) {
        self.return_data = data;
    }

    /// Output produced by RETURN or REVERT
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub(crate) fn set_output(&mut self, output: Vec<u8>) {
        self.output = output;
    }

    /// Move the output out of the frame (used at the call boundary)
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    // ==================== Gas accounting ====================

    /// Consume gas, failing the call when not enough is left
    pub fn use_gas(&mut self, amount: u64) -> EvmResult<()> {
        if self.gas < amount {
            self.gas = 0;
            return Err(EvmError::OutOfGas);
        }
        self.gas -= amount;
        Ok(())
    }

    /// Return unspent gas from a nested call
    pub fn give_back_gas(&mut self, amount: u64) {
        self.gas += amount;
    }

    /// Credit the refund counter
    pub fn add_refund(&mut self, amount: u64) {
        self.refund += amount;
    }

    /// Charge and perform a memory expansion so that `len` bytes at
    /// `offset` are addressable. Charge-then-grow: nothing is extended when
    /// gas runs out.
    pub fn charge_memory(&mut self, offset: usize, len: usize) -> EvmResult<()> {
        let required = self.memory.required_size(offset, len)?;
        let cost = gas::memory_gas(self.memory.size(), required);
        self.use_gas(cost)?;
        self.memory.grow_to(required);
        Ok(())
    }

    // ==================== Block pre-charge accounting ====================

    pub(crate) fn set_block_gas_outstanding(&mut self, amount: u64) {
        self.block_gas_outstanding = amount;
    }

    pub(crate) fn retire_block_gas(&mut self, amount: u64) {
        self.block_gas_outstanding = self.block_gas_outstanding.saturating_sub(amount);
    }

    /// Gas remaining as if only retired instructions had been charged.
    ///
    /// Used by the per-step shadow comparator to align the block pre-charge
    /// with the reference interpreter's per-operation metering; tracers see
    /// the raw counter.
    pub fn block_adjusted_gas(&self) -> u64 {
        self.gas + self.block_gas_outstanding
    }

    // ==================== Step observation ====================

    /// Enable or disable per-step observation buffers
    pub(crate) fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.recording
    }

    /// Clear observation buffers at the start of a step
    pub(crate) fn begin_step(&mut self) {
        self.touches.clear();
        self.step_logs.clear();
        self.memory_written = None;
    }

    pub(crate) fn record_touch(&mut self, touch: StateTouch) {
        if self.recording {
            self.touches.push(touch);
        }
    }

    pub(crate) fn record_log(&mut self, log: Log) {
        if self.recording {
            self.step_logs.push(log);
        }
    }

    pub(crate) fn note_memory_write(&mut self, offset: usize, len: usize) {
        if self.recording && len > 0 {
            self.memory_written = Some(match self.memory_written {
                None => (offset, len),
                Some((start, existing)) => {
                    let end = (offset + len).max(start + existing);
                    let start = start.min(offset);
                    (start, end - start)
                }
            });
        }
    }

    /// Host state touched during the current step
    pub fn touches(&self) -> &[StateTouch] {
        &self.touches
    }

    /// Logs emitted during the current step
    pub fn step_logs(&self) -> &[Log] {
        &self.step_logs
    }

    /// Memory span written during the current step
    pub fn memory_written(&self) -> Option<(usize, usize)> {
        self.memory_written
    }
}
