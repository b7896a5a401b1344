//! Hardfork rule tables

/// Static chain configuration consumed by the analyzer and the interpreter.
///
/// The rules are never computed here; callers construct the table for the
/// fork they target and pass it in.
#[derive(Clone, Debug)]
pub struct ChainRules {
    /// PUSH0 available (EIP-3855, Shanghai)
    pub push0_enabled: bool,
    /// MCOPY available (EIP-5656, Cancun)
    pub mcopy_enabled: bool,
    /// Maximum stack depth
    pub stack_limit: usize,
    /// Maximum call depth
    pub max_call_depth: u32,
    /// Maximum deployed code size (EIP-170)
    pub max_code_size: usize,
}

impl Default for ChainRules {
    fn default() -> Self {
        Self {
            push0_enabled: true,
            mcopy_enabled: true,
            stack_limit: 1024,
            max_call_depth: 1024,
            max_code_size: 24576,
        }
    }
}

impl ChainRules {
    /// Rules for a pre-Shanghai chain (no PUSH0, no MCOPY)
    pub fn legacy() -> Self {
        Self {
            push0_enabled: false,
            mcopy_enabled: false,
            ..Self::default()
        }
    }

    /// Whether the opcode exists under these rules
    pub fn is_enabled(&self, op: crate::opcode::Opcode) -> bool {
        use crate::opcode::Opcode;
        match op {
            Opcode::PUSH0 => self.push0_enabled,
            Opcode::MCOPY => self.mcopy_enabled,
            // Transient storage needs host support this engine does not
            // require; the opcodes decode but never execute
            Opcode::TLOAD | Opcode::TSTORE => false,
            _ => true,
        }
    }
}
