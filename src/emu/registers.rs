use std::{
    fmt,
    ops::{Index, IndexMut},
};

use crate::plat::{Cond, Register};

/// The full register file of the emulator: eight general purpose registers, the program
/// counter and the condition flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmuRegisters {
    pub gp: [u16; 8],
    pub pc: u16,
    pub cond: Cond,
}

impl EmuRegisters {
    /// Creates a register file with every register cleared, `PC` at `entry` and the
    /// zero flag set.
    pub fn new(entry: u16) -> Self {
        Self {
            gp: [0; 8],
            pc: entry,
            cond: Cond::ZRO,
        }
    }

    /// Sets the condition flags from the current value of `reg`.
    pub fn update_flags(&mut self, reg: Register) {
        self.cond = Cond::of(self[reg]);
    }

    /// Reads any register by value, including `COND`.
    pub fn get(&self, reg: Register) -> u16 {
        match reg {
            Register::COND => self.cond.bits(),
            other => self[other],
        }
    }

    /// Writes `value` to `reg` and updates the condition flags from it.
    pub fn define(&mut self, reg: Register, value: u16) {
        self[reg] = value;
        self.update_flags(reg);
    }
}

impl Default for EmuRegisters {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Word access to `R0`-`R7` and `PC`.
///
/// # Panics
///
/// `COND` is not a plain word. Read it with [`EmuRegisters::get`] and write
/// [`EmuRegisters::cond`] instead.
impl Index<Register> for EmuRegisters {
    type Output = u16;

    fn index(&self, reg: Register) -> &u16 {
        match reg {
            Register::PC => &self.pc,
            Register::COND => panic!("COND must be read through EmuRegisters::get"),
            gp => &self.gp[gp as usize],
        }
    }
}

impl IndexMut<Register> for EmuRegisters {
    fn index_mut(&mut self, reg: Register) -> &mut u16 {
        match reg {
            Register::PC => &mut self.pc,
            Register::COND => panic!("COND must be written through EmuRegisters::cond"),
            gp => &mut self.gp[gp as usize],
        }
    }
}

impl fmt::Display for EmuRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in Register::GP.chunks(4).enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            let line = chunk
                .iter()
                .map(|r| format!("{r}=x{:04X}", self[*r]))
                .collect::<Vec<_>>()
                .join("  ");
            f.write_str(&line)?;
        }
        write!(
            f,
            "\nPC=x{:04X}  COND={} (x{:X})",
            self.pc,
            self.cond.name(),
            self.cond.bits()
        )
    }
}
