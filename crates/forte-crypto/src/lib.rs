//! # forte-crypto
//!
//! Keccak-256 hashing for the forte EVM engine.
//!
//! The interpreter needs Keccak-256 for the `KECCAK256` opcode and for
//! CREATE2 address derivation; everything else cryptographic lives with the
//! host.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod hash;

pub use hash::keccak256;
