//! Gas cost calculations

use crate::opcode::Opcode;
use forte_primitives::H256;

/// Gas costs for EVM operations
pub mod cost {
    /// Zero gas
    pub const ZERO: u64 = 0;
    /// Base gas
    pub const BASE: u64 = 2;
    /// Very low gas
    pub const VERYLOW: u64 = 3;
    /// Low gas
    pub const LOW: u64 = 5;
    /// Mid gas
    pub const MID: u64 = 8;
    /// High gas
    pub const HIGH: u64 = 10;

    /// Jump dest gas
    pub const JUMPDEST: u64 = 1;
    /// Exp gas
    pub const EXP: u64 = 10;
    /// Exp byte gas
    pub const EXP_BYTE: u64 = 50;
    /// SHA3 base gas
    pub const SHA3: u64 = 30;
    /// SHA3 word gas
    pub const SHA3_WORD: u64 = 6;

    /// Account access gas (warm, EIP-2929)
    pub const ACCOUNT_ACCESS: u64 = 100;
    /// Blockhash lookup gas
    pub const BLOCKHASH: u64 = 20;

    /// Sload gas (warm)
    pub const SLOAD: u64 = 100;
    /// Sstore set gas
    pub const SSTORE_SET: u64 = 20000;
    /// Sstore reset gas
    pub const SSTORE_RESET: u64 = 2900;
    /// Sstore clear refund (EIP-3529)
    pub const SSTORE_CLEAR_REFUND: u64 = 4800;

    /// Log gas
    pub const LOG: u64 = 375;
    /// Log topic gas
    pub const LOG_TOPIC: u64 = 375;
    /// Log data gas (per byte)
    pub const LOG_DATA: u64 = 8;

    /// Create gas
    pub const CREATE: u64 = 32000;
    /// Call gas (warm)
    pub const CALL: u64 = 100;
    /// Call value transfer gas
    pub const CALL_VALUE: u64 = 9000;
    /// Call stipend
    pub const CALL_STIPEND: u64 = 2300;

    /// Memory gas per word
    pub const MEMORY: u64 = 3;
    /// Copy gas per word
    pub const COPY: u64 = 3;

    /// Selfdestruct gas
    pub const SELFDESTRUCT: u64 = 5000;
}

/// Fixed base gas for an opcode, independent of its operands.
///
/// For dynamic operations this is only the base portion; the operand
/// dependent remainder is charged at execution time.
pub fn static_gas(opcode: Opcode) -> u64 {
    match opcode {
        // Zero cost
        Opcode::STOP | Opcode::RETURN | Opcode::REVERT | Opcode::INVALID => cost::ZERO,

        // Base cost (2)
        Opcode::ADDRESS
        | Opcode::ORIGIN
        | Opcode::CALLER
        | Opcode::CALLVALUE
        | Opcode::CALLDATASIZE
        | Opcode::CODESIZE
        | Opcode::GASPRICE
        | Opcode::COINBASE
        | Opcode::TIMESTAMP
        | Opcode::NUMBER
        | Opcode::PREVRANDAO
        | Opcode::GASLIMIT
        | Opcode::CHAINID
        | Opcode::RETURNDATASIZE
        | Opcode::POP
        | Opcode::PC
        | Opcode::MSIZE
        | Opcode::GAS
        | Opcode::BASEFEE
        | Opcode::PUSH0 => cost::BASE,

        // Low cost (5)
        Opcode::MUL
        | Opcode::DIV
        | Opcode::SDIV
        | Opcode::MOD
        | Opcode::SMOD
        | Opcode::SIGNEXTEND
        | Opcode::SELFBALANCE => cost::LOW,

        // Mid cost (8)
        Opcode::ADDMOD | Opcode::MULMOD | Opcode::JUMP => cost::MID,

        // High cost (10)
        Opcode::JUMPI => cost::HIGH,

        // Jump destination
        Opcode::JUMPDEST => cost::JUMPDEST,

        // Dynamic operations: the base portion only
        Opcode::EXP => cost::EXP,
        Opcode::KECCAK256 => cost::SHA3,
        Opcode::BALANCE
        | Opcode::EXTCODESIZE
        | Opcode::EXTCODECOPY
        | Opcode::EXTCODEHASH => cost::ACCOUNT_ACCESS,
        Opcode::BLOCKHASH => cost::BLOCKHASH,
        Opcode::SLOAD | Opcode::TLOAD | Opcode::TSTORE => cost::SLOAD,
        Opcode::SSTORE => cost::ZERO,
        Opcode::LOG0 => cost::LOG,
        Opcode::LOG1 => cost::LOG + cost::LOG_TOPIC,
        Opcode::LOG2 => cost::LOG + 2 * cost::LOG_TOPIC,
        Opcode::LOG3 => cost::LOG + 3 * cost::LOG_TOPIC,
        Opcode::LOG4 => cost::LOG + 4 * cost::LOG_TOPIC,
        Opcode::CREATE | Opcode::CREATE2 => cost::CREATE,
        Opcode::CALL | Opcode::CALLCODE | Opcode::DELEGATECALL | Opcode::STATICCALL => {
            cost::CALL
        }
        Opcode::SELFDESTRUCT => cost::SELFDESTRUCT,
        Opcode::CALLDATACOPY | Opcode::CODECOPY | Opcode::RETURNDATACOPY | Opcode::MCOPY => {
            cost::VERYLOW
        }

        // Everything else (arithmetic, comparison, bitwise, push/dup/swap,
        // memory and calldata single-word access) is very low (3)
        _ => cost::VERYLOW,
    }
}

/// Cost of a number of memory words, saturating instead of overflowing.
fn memory_word_cost(words: u64) -> u64 {
    let words = words as u128;
    let cost = (cost::MEMORY as u128) * words + words * words / 512;
    cost.min(u64::MAX as u128) as u64
}

/// Incremental cost of expanding memory from `current_size` to `new_size`
/// bytes (both word-aligned). Includes the quadratic component.
pub fn memory_gas(current_size: usize, new_size: usize) -> u64 {
    if new_size <= current_size {
        return 0;
    }
    let new_words = (new_size as u64).div_ceil(32);
    let old_words = (current_size as u64).div_ceil(32);
    memory_word_cost(new_words).saturating_sub(memory_word_cost(old_words))
}

/// Per-word copy cost (CALLDATACOPY, CODECOPY, RETURNDATACOPY, MCOPY,
/// EXTCODECOPY)
pub fn copy_gas(length: usize) -> u64 {
    let words = (length as u64).div_ceil(32);
    cost::COPY.saturating_mul(words)
}

/// Operand-dependent portion of the EXP cost (per significant exponent byte)
pub fn exp_gas(exponent_byte_size: usize) -> u64 {
    cost::EXP_BYTE * exponent_byte_size as u64
}

/// Per-word portion of the KECCAK256 cost
pub fn sha3_gas(length: usize) -> u64 {
    let words = (length as u64).div_ceil(32);
    cost::SHA3_WORD.saturating_mul(words)
}

/// Per-byte portion of the LOG cost (topics are part of the fixed base)
pub fn log_data_gas(data_size: usize) -> u64 {
    cost::LOG_DATA.saturating_mul(data_size as u64)
}

/// SSTORE cost and refund given the slot's original (start-of-call),
/// current, and new values (EIP-2200/3529 net metering, warm slots).
pub fn sstore_gas(original: H256, current: H256, new: H256) -> (u64, u64) {
    if current == new {
        return (cost::SLOAD, 0);
    }
    let gas = if original == current {
        if original.is_zero() {
            cost::SSTORE_SET
        } else {
            cost::SSTORE_RESET
        }
    } else {
        cost::SLOAD
    };
    let refund = if !current.is_zero() && new.is_zero() {
        cost::SSTORE_CLEAR_REFUND
    } else {
        0
    };
    (gas, refund)
}

/// Maximum gas forwardable to a nested call: all but one 64th of what is
/// left (EIP-150).
pub fn max_call_gas(gas_left: u64) -> u64 {
    gas_left - gas_left / 64
}

#[cfg(test)]
mod tests {
    use super::*;
    use forte_primitives::U256;

    fn slot(v: u64) -> H256 {
        H256::from_u256(U256::from(v))
    }

    #[test]
    fn test_static_gas() {
        assert_eq!(static_gas(Opcode::STOP), 0);
        assert_eq!(static_gas(Opcode::ADD), 3);
        assert_eq!(static_gas(Opcode::MUL), 5);
        assert_eq!(static_gas(Opcode::ADDMOD), 8);
        assert_eq!(static_gas(Opcode::JUMP), 8);
        assert_eq!(static_gas(Opcode::JUMPI), 10);
        assert_eq!(static_gas(Opcode::JUMPDEST), 1);
        assert_eq!(static_gas(Opcode::PUSH1), 3);
        assert_eq!(static_gas(Opcode::PUSH0), 2);
        assert_eq!(static_gas(Opcode::DUP16), 3);
        assert_eq!(static_gas(Opcode::SWAP16), 3);
        assert_eq!(static_gas(Opcode::PC), 2);
        assert_eq!(static_gas(Opcode::GAS), 2);
    }

    #[test]
    fn test_static_gas_dynamic_bases() {
        assert_eq!(static_gas(Opcode::KECCAK256), cost::SHA3);
        assert_eq!(static_gas(Opcode::EXP), cost::EXP);
        assert_eq!(static_gas(Opcode::SLOAD), cost::SLOAD);
        assert_eq!(static_gas(Opcode::SSTORE), 0);
        assert_eq!(static_gas(Opcode::CALL), cost::CALL);
        assert_eq!(static_gas(Opcode::CREATE), cost::CREATE);
        assert_eq!(static_gas(Opcode::LOG0), cost::LOG);
        assert_eq!(static_gas(Opcode::LOG3), cost::LOG + 3 * cost::LOG_TOPIC);
        assert_eq!(static_gas(Opcode::RETURN), 0);
        assert_eq!(static_gas(Opcode::REVERT), 0);
    }

    #[test]
    fn test_memory_gas_quadratic() {
        // Memory cost is linear + quadratic: 3*words + words^2/512
        assert_eq!(memory_gas(0, 32), 3);
        assert_eq!(memory_gas(0, 64), 6);
        // 32 words: 3*32 + 32*32/512 = 96 + 2 = 98
        assert_eq!(memory_gas(0, 1024), 98);
        // 512 words: 3*512 + 512*512/512 = 1536 + 512 = 2048
        assert_eq!(memory_gas(0, 16384), 2048);
    }

    #[test]
    fn test_memory_gas_incremental() {
        let cost_32 = memory_gas(0, 32);
        let cost_64 = memory_gas(0, 64);
        assert_eq!(memory_gas(32, 64), cost_64 - cost_32);
        // No charge without expansion
        assert_eq!(memory_gas(64, 64), 0);
        assert_eq!(memory_gas(64, 32), 0);
    }

    #[test]
    fn test_memory_gas_huge_request_saturates() {
        // A request near the address-space limit must not overflow, just
        // produce a cost no call can afford
        let huge = memory_gas(0, usize::MAX - 31);
        assert!(huge > 1u64 << 40);
    }

    #[test]
    fn test_copy_gas_word_rounding() {
        assert_eq!(copy_gas(0), 0);
        assert_eq!(copy_gas(1), cost::COPY);
        assert_eq!(copy_gas(32), cost::COPY);
        assert_eq!(copy_gas(33), 2 * cost::COPY);
        assert_eq!(copy_gas(100), 4 * cost::COPY);
    }

    #[test]
    fn test_exp_and_sha3_gas() {
        assert_eq!(exp_gas(0), 0);
        assert_eq!(exp_gas(1), cost::EXP_BYTE);
        assert_eq!(exp_gas(32), 32 * cost::EXP_BYTE);

        assert_eq!(sha3_gas(0), 0);
        assert_eq!(sha3_gas(32), cost::SHA3_WORD);
        assert_eq!(sha3_gas(33), 2 * cost::SHA3_WORD);
    }

    #[test]
    fn test_log_data_gas() {
        assert_eq!(log_data_gas(0), 0);
        assert_eq!(log_data_gas(100), 100 * cost::LOG_DATA);
    }

    #[test]
    fn test_sstore_gas_fresh_write() {
        // original == current == 0, writing non-zero: full set cost
        let (gas, refund) = sstore_gas(slot(0), slot(0), slot(42));
        assert_eq!(gas, cost::SSTORE_SET);
        assert_eq!(refund, 0);
    }

    #[test]
    fn test_sstore_gas_reset() {
        // original == current != 0, writing a different non-zero value
        let (gas, refund) = sstore_gas(slot(1), slot(1), slot(2));
        assert_eq!(gas, cost::SSTORE_RESET);
        assert_eq!(refund, 0);
    }

    #[test]
    fn test_sstore_gas_noop_write() {
        let (gas, refund) = sstore_gas(slot(7), slot(7), slot(7));
        assert_eq!(gas, cost::SLOAD);
        assert_eq!(refund, 0);
    }

    #[test]
    fn test_sstore_gas_clear_refund() {
        let (gas, refund) = sstore_gas(slot(5), slot(5), slot(0));
        assert_eq!(gas, cost::SSTORE_RESET);
        assert_eq!(refund, cost::SSTORE_CLEAR_REFUND);
    }

    #[test]
    fn test_sstore_gas_dirty_slot() {
        // Already modified in this call: warm cost only
        let (gas, _) = sstore_gas(slot(1), slot(2), slot(3));
        assert_eq!(gas, cost::SLOAD);
    }

    #[test]
    fn test_max_call_gas() {
        assert_eq!(max_call_gas(6400), 6300);
        assert_eq!(max_call_gas(64), 63);
        assert_eq!(max_call_gas(0), 0);
    }
}
