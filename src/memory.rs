/*!
Primary memory: a word-addressed linear array with bounds-checked access.

The machine is word-oriented; every cell holds one signed word. The first
`RESERVED_LOW_WORDS` cells are owned by the hardware/kernel protocol (the
interrupt frame lives at words 0..=5 and the kernel trampoline at 10..=11),
so user frames are only ever allocated above that region.

This module provides the storage and the checked `read`/`write` pair the
CPU, MMU and kernel all go through. Address translation is not done here;
callers present physical addresses.
*/

use thiserror::Error;

/// Machine word. Registers, memory cells and device channels all carry this.
pub type Word = i32;

/// Default size of primary memory, in words.
pub const MEM_SIZE_DEFAULT: usize = 10_000;

/// Words at the bottom of physical memory reserved for the interrupt frame
/// and the kernel trampoline. Frame allocation starts above this region.
pub const RESERVED_LOW_WORDS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("address {addr} out of range (memory has {size} words)")]
    OutOfRange { addr: Word, size: usize },
}

/// Word-addressed linear memory.
pub struct Memory {
    data: Vec<Word>,
}

impl Memory {
    /// Create a zero-filled memory of `size` words.
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    /// Number of words.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all words to 0.
    pub fn reset(&mut self) {
        self.data.fill(0);
    }

    /// Read the word at physical address `addr`.
    #[inline]
    pub fn read(&self, addr: Word) -> Result<Word, MemoryError> {
        self.index(addr).map(|i| self.data[i])
    }

    /// Write `value` at physical address `addr`.
    #[inline]
    pub fn write(&mut self, addr: Word, value: Word) -> Result<(), MemoryError> {
        let i = self.index(addr)?;
        self.data[i] = value;
        Ok(())
    }

    /// Expose the backing slice (read-only). Useful for diagnostics.
    #[inline]
    pub fn as_slice(&self) -> &[Word] {
        &self.data
    }

    #[inline]
    fn index(&self, addr: Word) -> Result<usize, MemoryError> {
        if addr < 0 || addr as usize >= self.data.len() {
            return Err(MemoryError::OutOfRange {
                addr,
                size: self.data.len(),
            });
        }
        Ok(addr as usize)
    }
}
