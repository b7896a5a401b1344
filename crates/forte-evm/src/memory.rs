//! EVM memory implementation

use crate::error::{EvmError, EvmResult};
use forte_primitives::U256;

/// EVM memory (byte-addressable, word-aligned, monotonically growing).
///
/// Growth is charge-then-grow: callers compute [`Memory::required_size`],
/// charge the incremental cost, and only then call [`Memory::grow_to`].
#[derive(Clone, Debug, Default)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Create new empty memory
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Get current memory size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// The word-aligned size required to access `len` bytes at `offset`.
    ///
    /// Returns the current size for zero-length accesses (which never
    /// expand), and fails when the end of the region cannot be addressed.
    pub fn required_size(&self, offset: usize, len: usize) -> EvmResult<usize> {
        if len == 0 {
            return Ok(self.data.len());
        }
        let end = offset
            .checked_add(len)
            .ok_or(EvmError::InvalidMemoryAccess)?;
        let words = end.div_ceil(32);
        let aligned = words
            .checked_mul(32)
            .ok_or(EvmError::InvalidMemoryAccess)?;
        Ok(aligned.max(self.data.len()))
    }

    /// Extend memory to `size` bytes, zero-filling the new region.
    /// The cost must have been charged already.
    pub fn grow_to(&mut self, size: usize) {
        if size > self.data.len() {
            self.data.resize(size, 0);
        }
    }

    /// Load a 32-byte word from memory
    pub fn load_word(&self, offset: usize) -> U256 {
        let mut buf = [0u8; 32];
        let end = (offset.saturating_add(32)).min(self.data.len());
        if offset < end {
            buf[..end - offset].copy_from_slice(&self.data[offset..end]);
        }
        U256::from_big_endian(&buf)
    }

    /// Store a 32-byte word to memory (the region must be grown already)
    pub fn store_word(&mut self, offset: usize, value: U256) {
        let mut buf = [0u8; 32];
        value.to_big_endian(&mut buf);
        self.data[offset..offset + 32].copy_from_slice(&buf);
    }

    /// Store a single byte to memory (the region must be grown already)
    pub fn store_byte(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    /// Load a byte slice, zero-filled beyond the current size
    pub fn load_slice(&self, offset: usize, len: usize) -> Vec<u8> {
        if len == 0 {
            return Vec::new();
        }
        let mut result = vec![0u8; len];
        let end = (offset.saturating_add(len)).min(self.data.len());
        if offset < end {
            result[..end - offset].copy_from_slice(&self.data[offset..end]);
        }
        result
    }

    /// Store a byte slice (the region must be grown already)
    pub fn store_slice(&mut self, offset: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copy within memory, handling overlap (for MCOPY)
    pub fn copy_within(&mut self, dest: usize, src: usize, len: usize) {
        if len == 0 {
            return;
        }
        self.data.copy_within(src..src + len, dest);
    }

    /// Get raw data slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
