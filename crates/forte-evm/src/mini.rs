//! Reference mini-interpreter
//!
//! A second, deliberately simple bytecode executor used as a correctness
//! oracle: fetch the opcode at the program counter, validate stack depth,
//! charge the fixed cost, dispatch to the same semantic operation
//! implementations the block-based loop uses, compute the next program
//! counter. No pre-analysis, no block pre-charge, no instrumentation —
//! auditable over fast.

use crate::analysis::scan_jump_dests;
use crate::context::Environment;
use crate::error::{EvmError, EvmResult};
use crate::frame::{Frame, FrameInput};
use crate::gas;
use crate::host::{CallKind, CallParams, CallResult, CallScope, Host};
use crate::interpreter::settle_frame;
use crate::opcode::Opcode;
use crate::ops::{Control, OpContext};
use crate::rules::ChainRules;
use crate::stack::Stack;
use bytes::Bytes;
use forte_primitives::U256;
use std::collections::HashSet;

/// Byte-at-a-time reference interpreter over raw code
pub struct MiniEvm {
    frame: Frame,
    code: Bytes,
    pc: usize,
    jump_dests: HashSet<usize>,
    stopped: bool,
    #[cfg(test)]
    cost_override: Option<(Opcode, u64)>,
}

impl MiniEvm {
    /// Create an interpreter over the given frame input
    pub fn new(input: FrameInput) -> Self {
        let code = input.code.clone();
        let jump_dests = scan_jump_dests(&code);
        Self {
            frame: Frame::new(input),
            code,
            pc: 0,
            jump_dests,
            stopped: false,
            #[cfg(test)]
            cost_override: None,
        }
    }

    /// Build an interpreter mirroring the frame a host dispatcher would
    /// create for the given message. Creates have no reference execution:
    /// their address is not known until the host derives it.
    pub fn for_params(code: Bytes, params: &CallParams) -> EvmResult<Self> {
        let (address, caller, value) = match params {
            CallParams::Call { caller, target, value, .. } => (*target, *caller, *value),
            CallParams::CallCode { caller, value, .. } => (*caller, *caller, *value),
            CallParams::DelegateCall {
                context,
                caller,
                value,
                ..
            } => (*context, *caller, *value),
            CallParams::StaticCall { caller, target, .. } => (*target, *caller, U256::zero()),
            CallParams::Create { .. } | CallParams::Create2 { .. } => {
                return Err(EvmError::FeatureDisabled(
                    "reference execution of create messages",
                ))
            }
        };
        Ok(Self::new(FrameInput {
            code,
            input: params.input().clone(),
            address,
            caller,
            value,
            gas: params.gas(),
            depth: 0,
            is_static: params.kind() == CallKind::StaticCall,
            snapshot: 0,
        }))
    }

    /// Program counter of the next operation
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Gas remaining
    pub fn gas(&self) -> u64 {
        self.frame.gas()
    }

    /// The stack
    pub fn stack(&self) -> &Stack {
        &self.frame.stack
    }

    /// The frame driven by this interpreter
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Whether execution has terminated
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    #[cfg(test)]
    pub(crate) fn override_cost(&mut self, op: Opcode, cost: u64) {
        self.cost_override = Some((op, cost));
    }

    fn base_gas(&self, op: Opcode) -> u64 {
        #[cfg(test)]
        if let Some((target, cost)) = self.cost_override {
            if op == target {
                return cost;
            }
        }
        gas::static_gas(op)
    }

    /// Execute a single operation
    pub fn step(
        &mut self,
        host: &mut dyn Host,
        env: &Environment,
        rules: &ChainRules,
    ) -> EvmResult<()> {
        if self.stopped {
            return Ok(());
        }
        if self.pc >= self.code.len() {
            self.stopped = true;
            return Ok(());
        }

        let byte = self.code[self.pc];
        let op = Opcode::from_byte(byte)
            .filter(|op| rules.is_enabled(*op))
            .ok_or(EvmError::InvalidOpcode(byte))?;

        // Validate stack bounds, then charge the fixed cost
        let (inputs, outputs) = op.stack_io();
        let depth = self.frame.stack().len();
        if depth < inputs {
            return Err(EvmError::StackUnderflow);
        }
        if depth - inputs + outputs > rules.stack_limit {
            return Err(EvmError::StackOverflow);
        }
        self.frame.use_gas(self.base_gas(op))?;

        if op == Opcode::STOP {
            self.stopped = true;
            return Ok(());
        }

        let operand = if op.push_size() > 0 {
            let n = op.push_size();
            let end = (self.pc + 1 + n).min(self.code.len());
            let avail = end - self.pc - 1;
            let mut buf = [0u8; 32];
            buf[32 - n..32 - n + avail].copy_from_slice(&self.code[self.pc + 1..end]);
            Some(U256::from_big_endian(&buf))
        } else {
            None
        };

        let control = {
            let mut cx = OpContext {
                host: &mut *host,
                env,
                pc: self.pc,
                operand,
            };
            self.frame.execute_op(op, &mut cx)?
        };

        match control {
            Control::Continue => {
                self.pc += 1 + op.push_size();
            }
            Control::Jump(dest) => {
                if !self.jump_dests.contains(&dest) {
                    return Err(EvmError::InvalidJump(dest));
                }
                self.pc = dest;
            }
            Control::Stop => {
                self.stopped = true;
            }
            Control::Revert => {
                return Err(EvmError::Revert(self.frame.take_output()));
            }
            Control::Call {
                params,
                out_offset,
                out_len,
            } => {
                let static_context =
                    self.frame.is_static() || params.kind() == CallKind::StaticCall;
                let result = host.call(
                    &params,
                    CallScope {
                        inspector: None,
                        shadow: None,
                        depth: self.frame.depth() + 1,
                        static_context,
                        env,
                        rules,
                    },
                );
                self.frame.apply_call_result(&params, &result, out_offset, out_len)?;
                self.pc += 1;
            }
        }
        Ok(())
    }

    /// Execute until completion or error and translate the outcome exactly
    /// like the primary engine's call boundary
    pub fn run(
        &mut self,
        host: &mut dyn Host,
        env: &Environment,
        rules: &ChainRules,
    ) -> CallResult {
        let outcome = loop {
            if self.stopped {
                break Ok(());
            }
            if let Err(err) = self.step(host, env, rules) {
                break Err(err);
            }
        };
        settle_frame(&mut self.frame, outcome)
    }
}
