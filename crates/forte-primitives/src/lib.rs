//! # forte-primitives
//!
//! Primitive types for the forte EVM engine.
//!
//! This crate provides the fundamental data types shared by the analyzer,
//! the interpreter and the tracers: 20-byte addresses, 32-byte words for
//! storage slots and hashes, and the 256-bit unsigned integer used as the
//! machine word.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod address;
mod hash;

pub use address::{Address, AddressError};
pub use hash::{H256, HashError};

// Re-export primitive-types for the 256-bit machine word
pub use primitive_types::U256;

/// Gas amount type
pub type Gas = u64;
