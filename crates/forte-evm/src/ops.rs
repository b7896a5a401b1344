//! Semantic operation implementations
//!
//! One handler body per opcode, implemented on [`Frame`] so the block-based
//! dispatch loop and the reference mini-interpreter execute identical
//! semantics. Handlers charge only the operand-dependent portion of their
//! cost; the fixed base is the driver's responsibility (block pre-charge in
//! the primary loop, per-operation charge in the reference interpreter).

use crate::context::Environment;
use crate::error::{EvmError, EvmResult};
use crate::frame::Frame;
use crate::gas;
use crate::host::{CallParams, Host, Log};
use crate::inspector::StateTouch;
use crate::opcode::Opcode;
use crate::stack::{
    self, bool_word, to_u64_saturated, to_usize, to_usize_saturated,
};
use bytes::Bytes;
use forte_crypto::keccak256;
use forte_primitives::{Address, H256, U256};

/// Everything a handler may need besides the frame itself
pub(crate) struct OpContext<'a> {
    /// State backend
    pub host: &'a mut dyn Host,
    /// Block/transaction environment
    pub env: &'a Environment,
    /// Original program counter of the executing instruction
    pub pc: usize,
    /// Fused push immediate, if the instruction carries one
    pub operand: Option<U256>,
}

/// Where execution goes after a handler completes
#[derive(Debug)]
pub(crate) enum Control {
    /// Fall through to the next instruction
    Continue,
    /// Transfer to the given program counter (target not yet validated)
    Jump(usize),
    /// Execution finished (STOP or RETURN; output already set)
    Stop,
    /// Execution reverted (output already set)
    Revert,
    /// Issue a message to the host, then resume
    Call {
        /// The prepared message
        params: CallParams,
        /// Memory offset receiving the callee's output
        out_offset: usize,
        /// Maximum bytes of output copied back
        out_len: usize,
    },
}

impl Frame {
    /// Execute one operation against this frame.
    ///
    /// The fixed base cost must already be charged by the caller.
    pub(crate) fn execute_op(&mut self, op: Opcode, cx: &mut OpContext<'_>) -> EvmResult<Control> {
        use Opcode::*;
        match op {
            STOP => return Ok(Control::Stop),

            // ==================== Arithmetic ====================
            ADD => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a.overflowing_add(b).0)?;
            }
            MUL => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a.overflowing_mul(b).0)?;
            }
            SUB => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a.overflowing_sub(b).0)?;
            }
            DIV => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack
                    .push(if b.is_zero() { U256::zero() } else { a / b })?;
            }
            SDIV => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(stack::sdiv(a, b))?;
            }
            MOD => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack
                    .push(if b.is_zero() { U256::zero() } else { a % b })?;
            }
            SMOD => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(stack::smod(a, b))?;
            }
            ADDMOD => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                let n = self.stack.pop()?;
                self.stack.push(stack::addmod(a, b, n))?;
            }
            MULMOD => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                let n = self.stack.pop()?;
                self.stack.push(stack::mulmod(a, b, n))?;
            }
            EXP => {
                let base = self.stack.pop()?;
                let exponent = self.stack.pop()?;
                self.use_gas(gas::exp_gas(stack::exp_byte_size(exponent)))?;
                self.stack.push(stack::exp(base, exponent))?;
            }
            SIGNEXTEND => {
                let b = self.stack.pop()?;
                let x = self.stack.pop()?;
                self.stack.push(stack::signextend(b, x))?;
            }

            // ==================== Comparison & bitwise ====================
            LT => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(bool_word(a < b))?;
            }
            GT => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(bool_word(a > b))?;
            }
            SLT => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(bool_word(stack::slt(a, b)))?;
            }
            SGT => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(bool_word(stack::sgt(a, b)))?;
            }
            EQ => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(bool_word(a == b))?;
            }
            ISZERO => {
                let a = self.stack.pop()?;
                self.stack.push(bool_word(a.is_zero()))?;
            }
            AND => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a & b)?;
            }
            OR => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a | b)?;
            }
            XOR => {
                let a = self.stack.pop()?;
                let b = self.stack.pop()?;
                self.stack.push(a ^ b)?;
            }
            NOT => {
                let a = self.stack.pop()?;
                self.stack.push(!a)?;
            }
            BYTE => {
                let i = self.stack.pop()?;
                let x = self.stack.pop()?;
                self.stack.push(stack::byte(i, x))?;
            }
            SHL => {
                let shift = self.stack.pop()?;
                let value = self.stack.pop()?;
                self.stack.push(stack::shl(shift, value))?;
            }
            SHR => {
                let shift = self.stack.pop()?;
                let value = self.stack.pop()?;
                self.stack.push(stack::shr(shift, value))?;
            }
            SAR => {
                let shift = self.stack.pop()?;
                let value = self.stack.pop()?;
                self.stack.push(stack::sar(shift, value))?;
            }

            // ==================== Hashing ====================
            KECCAK256 => {
                let offset = to_usize(self.stack.pop()?)?;
                let len = to_usize(self.stack.pop()?)?;
                self.charge_memory(offset, len)?;
                self.use_gas(gas::sha3_gas(len))?;
                let data = self.memory.load_slice(offset, len);
                self.stack.push(keccak256(&data).to_u256())?;
            }

            // ==================== Environment ====================
            ADDRESS => self.stack.push(self.address().into_word())?,
            BALANCE => {
                let address = Address::from_word(self.stack.pop()?);
                let value = cx.host.get_balance(&address);
                self.record_touch(StateTouch::BalanceRead { address, value });
                self.stack.push(value)?;
            }
            ORIGIN => self.stack.push(cx.env.tx.origin.into_word())?,
            CALLER => self.stack.push(self.caller().into_word())?,
            CALLVALUE => {
                let value = self.value();
                self.stack.push(value)?;
            }
            CALLDATALOAD => {
                let offset = to_usize_saturated(self.stack.pop()?);
                let mut buf = [0u8; 32];
                for (i, slot) in buf.iter_mut().enumerate() {
                    if let Some(byte) = offset
                        .checked_add(i)
                        .and_then(|idx| self.input().get(idx).copied())
                    {
                        *slot = byte;
                    }
                }
                self.stack.push(U256::from_big_endian(&buf))?;
            }
            CALLDATASIZE => {
                let len = self.input().len();
                self.stack.push(U256::from(len))?;
            }
            CALLDATACOPY => {
                let input = self.input().clone();
                self.copy_to_memory(&input)?;
            }
            CODESIZE => {
                let len = self.code().len();
                self.stack.push(U256::from(len))?;
            }
            CODECOPY => {
                let code = self.code().clone();
                self.copy_to_memory(&code)?;
            }
            GASPRICE => self.stack.push(cx.env.tx.gas_price)?,
            EXTCODESIZE => {
                let address = Address::from_word(self.stack.pop()?);
                let code = cx.host.get_code(&address);
                self.record_touch(StateTouch::CodeRead {
                    address,
                    code: code.clone(),
                });
                self.stack.push(U256::from(code.len()))?;
            }
            EXTCODECOPY => {
                let address = Address::from_word(self.stack.pop()?);
                let code = cx.host.get_code(&address);
                self.record_touch(StateTouch::CodeRead {
                    address,
                    code: code.clone(),
                });
                self.copy_to_memory(&code)?;
            }
            EXTCODEHASH => {
                let address = Address::from_word(self.stack.pop()?);
                let code = cx.host.get_code(&address);
                let hash = if code.is_empty() {
                    U256::zero()
                } else {
                    keccak256(&code).to_u256()
                };
                self.record_touch(StateTouch::CodeRead { address, code });
                self.stack.push(hash)?;
            }
            RETURNDATASIZE => {
                let len = self.return_data().len();
                self.stack.push(U256::from(len))?;
            }
            RETURNDATACOPY => {
                let dest = to_usize(self.stack.pop()?)?;
                let offset = to_usize_saturated(self.stack.pop()?);
                let len = to_usize(self.stack.pop()?)?;
                if offset.saturating_add(len) > self.return_data().len() {
                    return Err(EvmError::ReturnDataOutOfBounds);
                }
                self.charge_memory(dest, len)?;
                self.use_gas(gas::copy_gas(len))?;
                let data = self.return_data()[offset..offset + len].to_vec();
                self.memory.store_slice(dest, &data);
                self.note_memory_write(dest, len);
            }

            // ==================== Block information ====================
            BLOCKHASH => {
                // Historical block hashes are not part of the host surface
                self.stack.pop()?;
                self.stack.push(U256::zero())?;
            }
            COINBASE => self.stack.push(cx.env.block.coinbase.into_word())?,
            TIMESTAMP => self.stack.push(U256::from(cx.env.block.timestamp))?,
            NUMBER => self.stack.push(U256::from(cx.env.block.number))?,
            PREVRANDAO => self.stack.push(cx.env.block.prevrandao.to_u256())?,
            GASLIMIT => self.stack.push(U256::from(cx.env.block.gas_limit))?,
            CHAINID => self.stack.push(U256::from(cx.env.block.chain_id))?,
            SELFBALANCE => {
                let address = self.address();
                let value = cx.host.get_balance(&address);
                self.record_touch(StateTouch::BalanceRead { address, value });
                self.stack.push(value)?;
            }
            BASEFEE => self.stack.push(cx.env.block.base_fee)?,

            // ==================== Stack, memory, storage, flow ====================
            POP => {
                self.stack.pop()?;
            }
            MLOAD => {
                let offset = to_usize(self.stack.pop()?)?;
                self.charge_memory(offset, 32)?;
                let value = self.memory.load_word(offset);
                self.stack.push(value)?;
            }
            MSTORE => {
                let offset = to_usize(self.stack.pop()?)?;
                let value = self.stack.pop()?;
                self.charge_memory(offset, 32)?;
                self.memory.store_word(offset, value);
                self.note_memory_write(offset, 32);
            }
            MSTORE8 => {
                let offset = to_usize(self.stack.pop()?)?;
                let value = self.stack.pop()?;
                self.charge_memory(offset, 1)?;
                self.memory.store_byte(offset, value.byte(0));
                self.note_memory_write(offset, 1);
            }
            SLOAD => {
                let address = self.address();
                let slot = H256::from_u256(self.stack.pop()?);
                let value = cx.host.get_storage(&address, &slot);
                self.record_touch(StateTouch::StorageRead {
                    address,
                    slot,
                    value,
                });
                self.stack.push(value.to_u256())?;
            }
            SSTORE => {
                if self.is_static() {
                    return Err(EvmError::StaticCallViolation);
                }
                // EIP-2200 sentry: never leave less than the stipend
                if self.gas() <= gas::cost::CALL_STIPEND {
                    return Err(EvmError::OutOfGas);
                }
                let address = self.address();
                let slot = H256::from_u256(self.stack.pop()?);
                let new = H256::from_u256(self.stack.pop()?);
                let current = cx.host.get_storage(&address, &slot);
                let original = cx.host.get_original_storage(&address, &slot);
                let (cost, refund) = gas::sstore_gas(original, current, new);
                self.use_gas(cost)?;
                self.add_refund(refund);
                let snapshot = self.snapshot();
                cx.host.record_storage_change(snapshot, address, slot, original);
                cx.host.set_storage(address, slot, new);
                self.record_touch(StateTouch::StorageWrite {
                    address,
                    slot,
                    original,
                    value: new,
                });
            }
            JUMP => {
                let dest = self.stack.pop()?;
                return Ok(Control::Jump(to_usize_saturated(dest)));
            }
            JUMPI => {
                let dest = self.stack.pop()?;
                let condition = self.stack.pop()?;
                if !condition.is_zero() {
                    return Ok(Control::Jump(to_usize_saturated(dest)));
                }
            }
            PC => self.stack.push(U256::from(cx.pc))?,
            MSIZE => {
                let size = self.memory.size();
                self.stack.push(U256::from(size))?;
            }
            GAS => {
                // Exact: the analyzer ends every block at GAS
                let gas = self.gas();
                self.stack.push(U256::from(gas))?;
            }
            JUMPDEST => {}
            MCOPY => {
                let dest = to_usize(self.stack.pop()?)?;
                let src = to_usize(self.stack.pop()?)?;
                let len = to_usize(self.stack.pop()?)?;
                self.charge_memory(dest.max(src), len)?;
                self.use_gas(gas::copy_gas(len))?;
                self.memory.copy_within(dest, src, len);
                self.note_memory_write(dest, len);
            }

            // ==================== Push / dup / swap ====================
            PUSH0 => self.stack.push(U256::zero())?,
            op if op.push_size() > 0 => {
                self.stack.push(cx.operand.unwrap_or_default())?;
            }
            op if op.dup_depth() > 0 => self.stack.dup(op.dup_depth())?,
            op if op.swap_depth() > 0 => self.stack.swap(op.swap_depth())?,

            // ==================== Logging ====================
            op if op.log_topics() > 0 || op == LOG0 => {
                if self.is_static() {
                    return Err(EvmError::StaticCallViolation);
                }
                let offset = to_usize(self.stack.pop()?)?;
                let len = to_usize(self.stack.pop()?)?;
                let mut topics = Vec::with_capacity(op.log_topics());
                for _ in 0..op.log_topics() {
                    topics.push(H256::from_u256(self.stack.pop()?));
                }
                self.charge_memory(offset, len)?;
                self.use_gas(gas::log_data_gas(len))?;
                let log = Log {
                    address: self.address(),
                    topics,
                    data: self.memory.load_slice(offset, len),
                };
                self.record_log(log.clone());
                cx.host.emit_log(log);
            }

            // ==================== Calls and creates ====================
            CREATE | CREATE2 => return self.prepare_create(op),
            CALL | CALLCODE | DELEGATECALL | STATICCALL => return self.prepare_call(op),

            RETURN => {
                let offset = to_usize(self.stack.pop()?)?;
                let len = to_usize(self.stack.pop()?)?;
                self.charge_memory(offset, len)?;
                let output = self.memory.load_slice(offset, len);
                self.set_output(output);
                return Ok(Control::Stop);
            }
            REVERT => {
                let offset = to_usize(self.stack.pop()?)?;
                let len = to_usize(self.stack.pop()?)?;
                self.charge_memory(offset, len)?;
                let output = self.memory.load_slice(offset, len);
                self.set_output(output);
                return Ok(Control::Revert);
            }
            INVALID => return Err(EvmError::InvalidOpcode(INVALID as u8)),

            // SELFDESTRUCT and transient storage need host capabilities
            // outside this engine's surface
            other => return Err(EvmError::InvalidOpcode(other as u8)),
        }
        Ok(Control::Continue)
    }

    /// Shared tail of the copy family: pops `dest, offset, len`, charges
    /// memory and per-word cost, copies from `source` zero-padded.
    fn copy_to_memory(&mut self, source: &[u8]) -> EvmResult<()> {
        let dest = to_usize(self.stack.pop()?)?;
        let offset = to_usize_saturated(self.stack.pop()?);
        let len = to_usize(self.stack.pop()?)?;
        self.charge_memory(dest, len)?;
        self.use_gas(gas::copy_gas(len))?;
        if len == 0 {
            return Ok(());
        }
        let mut data = vec![0u8; len];
        if offset < source.len() {
            let end = (offset + len).min(source.len());
            data[..end - offset].copy_from_slice(&source[offset..end]);
        }
        self.memory.store_slice(dest, &data);
        self.note_memory_write(dest, len);
        Ok(())
    }

    fn prepare_create(&mut self, op: Opcode) -> EvmResult<Control> {
        if self.is_static() {
            return Err(EvmError::StaticCallViolation);
        }
        let value = self.stack.pop()?;
        let offset = to_usize(self.stack.pop()?)?;
        let len = to_usize(self.stack.pop()?)?;
        let salt = if op == Opcode::CREATE2 {
            Some(H256::from_u256(self.stack.pop()?))
        } else {
            None
        };
        self.charge_memory(offset, len)?;
        if op == Opcode::CREATE2 {
            // CREATE2 hashes the init code for address derivation
            self.use_gas(gas::sha3_gas(len))?;
        }
        let init_code = Bytes::from(self.memory.load_slice(offset, len));

        // EIP-150: forward all but one 64th of what remains
        let forwarded = gas::max_call_gas(self.gas());
        self.use_gas(forwarded)?;

        let caller = self.address();
        let params = match salt {
            None => CallParams::Create {
                caller,
                value,
                gas: forwarded,
                init_code,
            },
            Some(salt) => CallParams::Create2 {
                caller,
                value,
                gas: forwarded,
                init_code,
                salt,
            },
        };
        Ok(Control::Call {
            params,
            out_offset: 0,
            out_len: 0,
        })
    }

    fn prepare_call(&mut self, op: Opcode) -> EvmResult<Control> {
        let gas_requested = to_u64_saturated(self.stack.pop()?);
        let target = Address::from_word(self.stack.pop()?);
        let value = if matches!(op, Opcode::CALL | Opcode::CALLCODE) {
            self.stack.pop()?
        } else {
            U256::zero()
        };
        let in_offset = to_usize(self.stack.pop()?)?;
        let in_len = to_usize(self.stack.pop()?)?;
        let out_offset = to_usize(self.stack.pop()?)?;
        let out_len = to_usize(self.stack.pop()?)?;

        if op == Opcode::CALL && self.is_static() && !value.is_zero() {
            return Err(EvmError::StaticCallViolation);
        }

        self.charge_memory(in_offset, in_len)?;
        self.charge_memory(out_offset, out_len)?;
        if !value.is_zero() {
            self.use_gas(gas::cost::CALL_VALUE)?;
        }

        let forwarded = gas_requested.min(gas::max_call_gas(self.gas()));
        self.use_gas(forwarded)?;
        // A value-bearing call hands the callee a free stipend
        let child_gas = if value.is_zero() {
            forwarded
        } else {
            forwarded + gas::cost::CALL_STIPEND
        };

        let input = Bytes::from(self.memory.load_slice(in_offset, in_len));
        let caller = self.address();
        let params = match op {
            Opcode::CALL => CallParams::Call {
                caller,
                target,
                value,
                gas: child_gas,
                input,
            },
            Opcode::CALLCODE => CallParams::CallCode {
                caller,
                target,
                value,
                gas: child_gas,
                input,
            },
            Opcode::DELEGATECALL => CallParams::DelegateCall {
                context: caller,
                caller: self.caller(),
                target,
                value: self.value(),
                gas: child_gas,
                input,
            },
            Opcode::STATICCALL => CallParams::StaticCall {
                caller,
                target,
                gas: child_gas,
                input,
            },
            _ => unreachable!("prepare_call only handles the call family"),
        };
        Ok(Control::Call {
            params,
            out_offset,
            out_len,
        })
    }

    /// Fold a completed message back into this frame: refund unused gas,
    /// copy bounded output into memory, expose return data, push the status
    /// word.
    pub(crate) fn apply_call_result(
        &mut self,
        params: &CallParams,
        result: &crate::host::CallResult,
        out_offset: usize,
        out_len: usize,
    ) -> EvmResult<()> {
        self.give_back_gas(result.gas_left);

        if params.is_create() {
            // Successful creation leaves no return data; reverted init code
            // surfaces its revert payload
            self.set_return_data(if result.success {
                Vec::new()
            } else {
                result.output.clone()
            });
            match (result.success, result.created) {
                (true, Some(created)) => {
                    self.record_touch(StateTouch::AccountCreated { address: created });
                    self.stack.push(created.into_word())?;
                }
                _ => self.stack.push(U256::zero())?,
            }
            return Ok(());
        }

        let copy_len = out_len.min(result.output.len());
        if copy_len > 0 {
            // The out region was charged and grown during call preparation
            self.memory.store_slice(out_offset, &result.output[..copy_len]);
            self.note_memory_write(out_offset, copy_len);
        }
        self.set_return_data(result.output.clone());
        self.stack.push(bool_word(result.success))?;
        Ok(())
    }
}
