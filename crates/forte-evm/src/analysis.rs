//! Bytecode analysis
//!
//! Turns raw code into a validated, block-structured instruction stream.
//! Consecutive fixed-cost operations are grouped into blocks headed by a
//! [`BlockInfo`] instruction carrying the aggregated base gas and stack
//! bounds, so the dispatch loop charges and validates once per block rather
//! than once per operation. Operations whose cost depends on runtime
//! operands stay out of the pre-charge and pay at execution time.

use crate::gas;
use crate::opcode::Opcode;
use crate::rules::ChainRules;
use bytes::Bytes;
use forte_primitives::U256;
use std::collections::HashSet;

/// Sentinel for instructions with no direct byte-code correlate
pub const NO_PC: u32 = u32::MAX;

/// Aggregated header for one block of fixed-cost operations
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockInfo {
    /// Base gas pre-charged for the whole block
    pub gas_cost: u64,
    /// Minimum stack depth required on block entry
    pub stack_required: u16,
    /// Maximum net stack growth over the block
    pub stack_max_growth: u16,
}

/// One instruction of the analyzed stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    /// Block header: pre-charge and validate, no observable execution
    BlockInfo(BlockInfo),
    /// Fixed-cost operation; push-family carries its fused immediate
    Exec {
        /// Operation to dispatch
        op: Opcode,
        /// Fused push immediate, if any
        operand: Option<U256>,
    },
    /// Operation whose cost is computed from runtime operands, then executed
    DynamicGas {
        /// Operation to dispatch
        op: Opcode,
    },
    /// Undefined or fork-disabled byte; fails when executed
    Invalid(u8),
    /// Structural filler with no runtime effect (stream terminator)
    Noop,
    /// Unconditional jump through the jump-destination table
    Jump,
    /// Conditional jump through the jump-destination table
    JumpI,
    /// Valid jump target marker
    JumpDest,
    /// Pushes the instruction's own original program counter
    Pc,
}

/// Immutable result of analyzing one code blob.
///
/// Created once per unique code, shared by every frame executing it.
#[derive(Clone, Debug)]
pub struct CodeAnalysis {
    code: Bytes,
    instructions: Vec<Instruction>,
    inst_to_pc: Vec<u32>,
    pc_to_block_start: Vec<u32>,
    jump_dests: HashSet<usize>,
}

impl CodeAnalysis {
    /// The raw code bytes
    pub fn code(&self) -> &Bytes {
        &self.code
    }

    /// The instruction stream
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Original program counter of an instruction, `None` for structural
    /// instructions
    pub fn pc_of(&self, index: usize) -> Option<usize> {
        match self.inst_to_pc.get(index) {
            Some(&NO_PC) | None => None,
            Some(&pc) => Some(pc as usize),
        }
    }

    /// Index of the `BlockInfo` owning the given program counter
    pub fn block_start_of(&self, pc: usize) -> Option<usize> {
        self.pc_to_block_start.get(pc).map(|&idx| idx as usize)
    }

    /// Whether `pc` is a valid jump destination
    pub fn is_valid_jump_dest(&self, pc: usize) -> bool {
        self.jump_dests.contains(&pc)
    }

    /// Number of valid jump destinations
    pub fn jump_dest_count(&self) -> usize {
        self.jump_dests.len()
    }
}

/// Scan code for valid jump destinations: a `JUMPDEST` byte that is not a
/// push immediate. Shared with the reference interpreter so both engines
/// agree by construction.
pub fn scan_jump_dests(code: &[u8]) -> HashSet<usize> {
    let mut dests = HashSet::new();
    let mut i = 0;
    while i < code.len() {
        let byte = code[i];
        if byte == Opcode::JUMPDEST as u8 {
            dests.insert(i);
        }
        // Skip PUSH operands
        if (0x60..=0x7F).contains(&byte) {
            i += (byte - 0x5F) as usize;
        }
        i += 1;
    }
    dests
}

struct BlockBuilder {
    start: usize,
    gas: u64,
    delta: i32,
    min_delta: i32,
    max_delta: i32,
}

struct Analyzer {
    instructions: Vec<Instruction>,
    inst_to_pc: Vec<u32>,
    pc_to_block_start: Vec<u32>,
    block: BlockBuilder,
}

impl Analyzer {
    fn new(code_len: usize) -> Self {
        let mut analyzer = Self {
            instructions: Vec::new(),
            inst_to_pc: Vec::new(),
            pc_to_block_start: vec![0; code_len],
            block: BlockBuilder {
                start: 0,
                gas: 0,
                delta: 0,
                min_delta: 0,
                max_delta: 0,
            },
        };
        analyzer.open_block();
        analyzer
    }

    fn open_block(&mut self) {
        self.block = BlockBuilder {
            start: self.instructions.len(),
            gas: 0,
            delta: 0,
            min_delta: 0,
            max_delta: 0,
        };
        self.push(Instruction::BlockInfo(BlockInfo::default()), NO_PC);
    }

    fn seal_block(&mut self) {
        let info = BlockInfo {
            gas_cost: self.block.gas,
            stack_required: (-self.block.min_delta).clamp(0, u16::MAX as i32) as u16,
            stack_max_growth: self.block.max_delta.clamp(0, u16::MAX as i32) as u16,
        };
        self.instructions[self.block.start] = Instruction::BlockInfo(info);
    }

    fn next_block(&mut self) {
        self.seal_block();
        self.open_block();
    }

    fn push(&mut self, inst: Instruction, pc: u32) {
        self.instructions.push(inst);
        self.inst_to_pc.push(pc);
    }

    fn account(&mut self, op: Opcode) {
        let (inputs, outputs) = op.stack_io();
        self.block.min_delta = self.block.min_delta.min(self.block.delta - inputs as i32);
        self.block.delta += outputs as i32 - inputs as i32;
        self.block.max_delta = self.block.max_delta.max(self.block.delta);
    }

    fn claim_pcs(&mut self, from: usize, to: usize) {
        let start = self.block.start as u32;
        for entry in &mut self.pc_to_block_start[from..to] {
            *entry = start;
        }
    }
}

/// Analyze raw bytecode into a [`CodeAnalysis`].
///
/// Pure and deterministic; arbitrary byte sequences are valid bytecode, so
/// analysis never fails. Blocks end at control flow, at terminators, and at
/// gas-observing operations so the frame's gas counter is exact wherever
/// bytecode can read it.
pub fn analyze(code: Bytes, rules: &ChainRules) -> CodeAnalysis {
    let jump_dests = scan_jump_dests(&code);
    let mut a = Analyzer::new(code.len());

    let mut pc = 0usize;
    while pc < code.len() {
        let byte = code[pc];
        let opcode = Opcode::from_byte(byte).filter(|op| rules.is_enabled(*op));
        let Some(op) = opcode else {
            a.claim_pcs(pc, pc + 1);
            a.push(Instruction::Invalid(byte), pc as u32);
            pc += 1;
            a.next_block();
            continue;
        };

        match op {
            Opcode::JUMPDEST => {
                // A jump target always begins its own block so jumps can
                // splice in at the block header
                a.next_block();
                a.claim_pcs(pc, pc + 1);
                a.block.gas += gas::cost::JUMPDEST;
                a.push(Instruction::JumpDest, pc as u32);
                pc += 1;
            }
            Opcode::JUMP => {
                a.claim_pcs(pc, pc + 1);
                a.block.gas += gas::static_gas(op);
                a.account(op);
                a.push(Instruction::Jump, pc as u32);
                pc += 1;
                a.next_block();
            }
            Opcode::JUMPI => {
                a.claim_pcs(pc, pc + 1);
                a.block.gas += gas::static_gas(op);
                a.account(op);
                a.push(Instruction::JumpI, pc as u32);
                pc += 1;
                a.next_block();
            }
            Opcode::PC => {
                a.claim_pcs(pc, pc + 1);
                a.block.gas += gas::static_gas(op);
                a.account(op);
                a.push(Instruction::Pc, pc as u32);
                pc += 1;
            }
            op if op.push_size() > 0 => {
                let n = op.push_size();
                let end = (pc + 1 + n).min(code.len());
                let avail = end - pc - 1;
                // Truncated pushes read the missing low bytes as zero
                let mut buf = [0u8; 32];
                buf[32 - n..32 - n + avail].copy_from_slice(&code[pc + 1..end]);
                let value = U256::from_big_endian(&buf);

                a.claim_pcs(pc, end);
                a.block.gas += gas::static_gas(op);
                a.account(op);
                a.push(
                    Instruction::Exec {
                        op,
                        operand: Some(value),
                    },
                    pc as u32,
                );
                pc += 1 + n;
            }
            op if op.has_dynamic_gas() => {
                a.claim_pcs(pc, pc + 1);
                a.account(op);
                a.push(Instruction::DynamicGas { op }, pc as u32);
                pc += 1;
                if op.ends_block() {
                    a.next_block();
                }
            }
            op => {
                a.claim_pcs(pc, pc + 1);
                a.block.gas += gas::static_gas(op);
                a.account(op);
                a.push(Instruction::Exec { op, operand: None }, pc as u32);
                pc += 1;
                if op.ends_block() {
                    a.next_block();
                }
            }
        }
    }

    a.seal_block();
    a.push(Instruction::Noop, NO_PC);

    tracing::debug!(
        code_len = code.len(),
        instructions = a.instructions.len(),
        jump_dests = jump_dests.len(),
        "analyzed bytecode"
    );

    CodeAnalysis {
        code,
        instructions: a.instructions,
        inst_to_pc: a.inst_to_pc,
        pc_to_block_start: a.pc_to_block_start,
        jump_dests,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzed(code: &[u8]) -> CodeAnalysis {
        analyze(Bytes::copy_from_slice(code), &ChainRules::default())
    }

    fn first_block(analysis: &CodeAnalysis) -> BlockInfo {
        match analysis.instructions()[0] {
            Instruction::BlockInfo(info) => info,
            ref other => panic!("stream must start with a block header, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_code() {
        let analysis = analyzed(&[]);
        assert_eq!(
            analysis.instructions(),
            &[
                Instruction::BlockInfo(BlockInfo::default()),
                Instruction::Noop
            ]
        );
    }

    #[test]
    fn test_simple_block() {
        // PUSH1 2, PUSH1 3, ADD, POP, STOP
        let analysis = analyzed(&[0x60, 0x02, 0x60, 0x03, 0x01, 0x50, 0x00]);

        let block = first_block(&analysis);
        // PUSH1(3) + PUSH1(3) + ADD(3) + POP(2) + STOP(0)
        assert_eq!(block.gas_cost, 11);
        assert_eq!(block.stack_required, 0);
        assert_eq!(block.stack_max_growth, 2);

        assert_eq!(
            analysis.instructions()[1],
            Instruction::Exec {
                op: Opcode::PUSH1,
                operand: Some(U256::from(2u64)),
            }
        );
        assert_eq!(
            analysis.instructions()[4],
            Instruction::Exec {
                op: Opcode::ADD,
                operand: None,
            }
        );
    }

    #[test]
    fn test_inst_to_pc_maps_opcode_bytes() {
        // PUSH2 immediates occupy pcs 1-2; ADD sits at pc 3
        let analysis = analyzed(&[0x61, 0xAA, 0xBB, 0x01, 0x00]);

        assert_eq!(analysis.pc_of(0), None); // block header
        assert_eq!(analysis.pc_of(1), Some(0)); // PUSH2
        assert_eq!(analysis.pc_of(2), Some(3)); // ADD
        assert_eq!(analysis.pc_of(3), Some(4)); // STOP

        // Every mapped pc names the byte of the opcode it encodes
        let code = analysis.code().clone();
        for (idx, inst) in analysis.instructions().iter().enumerate() {
            if let Some(pc) = analysis.pc_of(idx) {
                match inst {
                    Instruction::Exec { op, .. } | Instruction::DynamicGas { op } => {
                        assert_eq!(code[pc], *op as u8);
                    }
                    Instruction::Jump => assert_eq!(code[pc], Opcode::JUMP as u8),
                    Instruction::JumpI => assert_eq!(code[pc], Opcode::JUMPI as u8),
                    Instruction::JumpDest => assert_eq!(code[pc], Opcode::JUMPDEST as u8),
                    Instruction::Pc => assert_eq!(code[pc], Opcode::PC as u8),
                    Instruction::Invalid(byte) => assert_eq!(code[pc], *byte),
                    Instruction::BlockInfo(_) | Instruction::Noop => {
                        panic!("structural instruction with a pc")
                    }
                }
            }
        }
    }

    #[test]
    fn test_push_value_decoding() {
        // PUSH2 0xAABB
        let analysis = analyzed(&[0x61, 0xAA, 0xBB, 0x00]);
        assert_eq!(
            analysis.instructions()[1],
            Instruction::Exec {
                op: Opcode::PUSH2,
                operand: Some(U256::from(0xAABBu64)),
            }
        );
    }

    #[test]
    fn test_truncated_push_zero_pads() {
        // PUSH2 with a single trailing byte reads the missing byte as zero
        let analysis = analyzed(&[0x61, 0xAA]);
        assert_eq!(
            analysis.instructions()[1],
            Instruction::Exec {
                op: Opcode::PUSH2,
                operand: Some(U256::from(0xAA00u64)),
            }
        );
    }

    #[test]
    fn test_jumpdest_opens_block() {
        // PUSH1 4, JUMP, INVALID, JUMPDEST, STOP
        let code = [0x60, 0x04, 0x56, 0xFE, 0x5B, 0x00];
        let analysis = analyzed(&code);

        assert!(analysis.is_valid_jump_dest(4));
        assert!(!analysis.is_valid_jump_dest(3));

        // The jumpdest's block starts at a BlockInfo instruction
        let block_idx = analysis.block_start_of(4).unwrap();
        assert!(matches!(
            analysis.instructions()[block_idx],
            Instruction::BlockInfo(_)
        ));
        // The jumpdest marker itself follows its header
        assert_eq!(analysis.instructions()[block_idx + 1], Instruction::JumpDest);
    }

    #[test]
    fn test_push_data_not_jump_dest() {
        // PUSH1 0x5B: the 0x5B byte is an immediate, not a jumpdest
        let analysis = analyzed(&[0x60, 0x5B, 0x00]);
        assert!(!analysis.is_valid_jump_dest(1));
        assert_eq!(analysis.jump_dest_count(), 0);
    }

    #[test]
    fn test_scan_jump_dests_skips_all_push_sizes() {
        // PUSH32 followed by 32 bytes of 0x5B, then a real JUMPDEST
        let mut code = vec![0x7F];
        code.extend([0x5B; 32]);
        code.push(0x5B);
        let dests = scan_jump_dests(&code);
        assert_eq!(dests.len(), 1);
        assert!(dests.contains(&33));
    }

    #[test]
    fn test_dynamic_ops_excluded_from_block_gas() {
        // PUSH1 0, PUSH1 0, KECCAK256, STOP: only the pushes are
        // pre-charged; KECCAK256 pays fully at execution
        let analysis = analyzed(&[0x60, 0x00, 0x60, 0x00, 0x20, 0x00]);
        let block = first_block(&analysis);
        assert_eq!(block.gas_cost, 6);
        assert_eq!(
            analysis.instructions()[3],
            Instruction::DynamicGas {
                op: Opcode::KECCAK256
            }
        );
    }

    #[test]
    fn test_stack_required_bound() {
        // ADD needs two items on entry
        let analysis = analyzed(&[0x01, 0x00]);
        let block = first_block(&analysis);
        assert_eq!(block.stack_required, 2);
        assert_eq!(block.stack_max_growth, 0);
    }

    #[test]
    fn test_stack_bounds_cover_interior_minimum() {
        // PUSH1 1, ADD: the push lifts the depth first, so only one item
        // is required on entry
        let analysis = analyzed(&[0x60, 0x01, 0x01, 0x00]);
        let block = first_block(&analysis);
        assert_eq!(block.stack_required, 1);
        assert_eq!(block.stack_max_growth, 1);
    }

    #[test]
    fn test_gas_observer_ends_block() {
        // ADD runs after GAS; it must land in a fresh block so GAS sees an
        // exact counter
        let analysis = analyzed(&[0x5A, 0x60, 0x01, 0x60, 0x02, 0x01, 0x00]);
        let first = first_block(&analysis);
        assert_eq!(first.gas_cost, gas::cost::BASE);

        // Instruction 1 is GAS, instruction 2 the next block header
        assert!(matches!(
            analysis.instructions()[2],
            Instruction::BlockInfo(_)
        ));
    }

    #[test]
    fn test_jump_ends_block() {
        // JUMPI mid-code splits the stream
        let code = [0x60, 0x01, 0x60, 0x05, 0x57, 0x00, 0x5B, 0x00];
        let analysis = analyzed(&code);
        // pc 5 (STOP after the branch) belongs to a block opened after JUMPI
        let fall_through = analysis.block_start_of(5).unwrap();
        let branch_head = analysis.block_start_of(0).unwrap();
        assert_ne!(fall_through, branch_head);
    }

    #[test]
    fn test_undefined_byte_becomes_invalid() {
        let analysis = analyzed(&[0x0C, 0x00]);
        assert_eq!(analysis.instructions()[1], Instruction::Invalid(0x0C));
    }

    #[test]
    fn test_disabled_opcode_becomes_invalid() {
        let analysis = analyze(
            Bytes::copy_from_slice(&[0x5F, 0x00]),
            &ChainRules::legacy(),
        );
        assert_eq!(analysis.instructions()[1], Instruction::Invalid(0x5F));

        let analysis = analyzed(&[0x5F, 0x00]);
        assert_eq!(
            analysis.instructions()[1],
            Instruction::Exec {
                op: Opcode::PUSH0,
                operand: None
            }
        );
    }

    #[test]
    fn test_stream_ends_with_noop() {
        for code in [&[][..], &[0x00][..], &[0x60, 0x01][..]] {
            let analysis = analyzed(code);
            assert_eq!(
                analysis.instructions().last(),
                Some(&Instruction::Noop),
                "stream for {code:?} must end with the structural terminator"
            );
        }
    }

    #[test]
    fn test_pc_to_block_start_covers_immediates() {
        // Immediate bytes resolve to the enclosing block
        let analysis = analyzed(&[0x60, 0x01, 0x60, 0x02, 0x00]);
        let head = analysis.block_start_of(0).unwrap();
        for pc in 0..5 {
            assert_eq!(analysis.block_start_of(pc), Some(head));
        }
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let code = [0x60, 0x01, 0x5B, 0x56, 0xFE];
        let a = analyzed(&code);
        let b = analyzed(&code);
        assert_eq!(a.instructions(), b.instructions());
    }
}
