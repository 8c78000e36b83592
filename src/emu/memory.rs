use std::{fmt, time::Duration};

use anyhow::Result;

use crate::plat::{KBDR, KBSR};

use super::console::Console;

/// Number of addressable words.
pub const MEMORY_SIZE: usize = 1 << 16;

/// The LC-3's 64K words of memory.
///
/// Every `u16` is a valid address, so accesses never fault. Reads of [KBSR] poll the
/// keyboard; everything else is plain storage.
#[derive(Clone, PartialEq, Eq)]
pub struct Memory {
    cells: Box<[u16]>,
}

impl Memory {
    /// Creates a new [`Memory`] instance with every word set to zero.
    pub fn new() -> Self {
        Self {
            cells: vec![0u16; MEMORY_SIZE].into_boxed_slice(),
        }
    }

    /// Reads a word without device side effects.
    pub fn peek(&self, addr: u16) -> u16 {
        self.cells[addr as usize]
    }

    pub fn write(&mut self, addr: u16, value: u16) {
        self.cells[addr as usize] = value;
    }

    /// Reads a word as the CPU sees it.
    ///
    /// Reading [KBSR] waits up to `timeout` for a key. If one arrives the status word's
    /// ready bit is set and the key is latched into [KBDR]; otherwise the status word is
    /// cleared.
    pub fn read<C: Console + ?Sized>(
        &mut self,
        addr: u16,
        console: &mut C,
        timeout: Duration,
    ) -> Result<u16> {
        if addr == KBSR {
            match console.poll_key(timeout)? {
                Some(key) => {
                    self.write(KBSR, 1 << 15);
                    self.write(KBDR, key as u16);
                }
                None => self.write(KBSR, 0),
            }
        }
        Ok(self.peek(addr))
    }

    pub fn cells(&self) -> &[u16] {
        &self.cells
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let used = self.cells.iter().filter(|w| **w != 0).count();
        f.debug_struct("Memory")
            .field("nonzero_words", &used)
            .finish()
    }
}
