//! The emulator/debugger module for the LC-3.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::plat::{Opcode, PC_START};

pub mod command;
pub mod console;
pub mod debugger;
pub mod emulator;
pub mod loader;
pub mod memory;
pub mod registers;
pub mod shadow;

#[derive(Debug, Error)]
pub enum EmuError {
    #[error("bad instruction: {opcode:?} at x{addr:04X}")]
    BadInstruction { opcode: Opcode, addr: u16 },
    #[error("could not open image {}: {source}", .path.display())]
    ImageOpen {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("image is missing its origin word")]
    MissingOrigin,
    #[error("interrupted")]
    Interrupted,
    #[error("console input closed")]
    InputClosed,
}

/// Runtime knobs for an [Emulator][emulator::Emulator].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmuConfig {
    /// Initial value of the program counter.
    pub entry: u16,
    /// Enables the shadow call stack kept in `R6`. See [shadow].
    pub trace_calls: bool,
    /// Longest time a read of the keyboard status register waits for a key.
    pub poll_timeout: Duration,
}

impl Default for EmuConfig {
    fn default() -> Self {
        Self {
            entry: PC_START,
            trace_calls: false,
            poll_timeout: Duration::from_millis(1000),
        }
    }
}
