//! EVM error types

use thiserror::Error;

/// EVM execution errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvmError {
    /// Out of gas
    #[error("out of gas")]
    OutOfGas,

    /// Stack underflow
    #[error("stack underflow")]
    StackUnderflow,

    /// Stack overflow
    #[error("stack overflow (max 1024)")]
    StackOverflow,

    /// Invalid jump destination
    #[error("invalid jump destination: {0}")]
    InvalidJump(usize),

    /// Invalid opcode
    #[error("invalid opcode: 0x{0:02x}")]
    InvalidOpcode(u8),

    /// Invalid memory access
    #[error("invalid memory access")]
    InvalidMemoryAccess,

    /// Write in static context
    #[error("state modification in static context")]
    StaticCallViolation,

    /// Return data out of bounds
    #[error("return data out of bounds")]
    ReturnDataOutOfBounds,

    /// Call depth exceeded
    #[error("call depth exceeded (max 1024)")]
    CallDepthExceeded,

    /// Insufficient balance for transfer
    #[error("insufficient balance")]
    InsufficientBalance,

    /// Max code size exceeded (EIP-170)
    #[error("max code size exceeded")]
    MaxCodeSizeExceeded,

    /// Revert with data
    #[error("execution reverted")]
    Revert(Vec<u8>),

    /// Shadow execution diverged from the reference interpreter
    #[error("shadow execution diverged: {0}")]
    ShadowMismatch(String),

    /// An instrumentation or shadow feature was invoked while configured out
    #[error("feature disabled: {0}")]
    FeatureDisabled(&'static str),
}

impl EvmError {
    /// Whether this error preserves the frame's remaining gas (only REVERT
    /// does; every other failure consumes what is left).
    pub fn preserves_gas(&self) -> bool {
        matches!(self, EvmError::Revert(_))
    }
}

/// Result type for EVM operations
pub type EvmResult<T> = Result<T, EvmError>;
