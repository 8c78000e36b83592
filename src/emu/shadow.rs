//! Diagnostic call stack kept in memory through `R6`.
//!
//! When enabled, every subroutine call pushes its return address onto a downward-growing
//! stack addressed by `R6`, stores executed inside a call push their value as well, and
//! `RET` unwinds exactly the words pushed by the returning frame. Nested calls save the
//! enclosing frame's push count below their return address. The overlay only writes `R6`
//! and the stack words below it.

use crate::plat::Register;

use super::{memory::Memory, registers::EmuRegisters};

/// Initial value of `R6` when the overlay is enabled.
pub const STACK_END: u16 = 0xF800;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ShadowStack {
    /// Number of call frames currently open.
    pub depth: u16,
    /// Words pushed by stores since the innermost call was entered.
    pub counter: u16,
}

fn push(regs: &mut EmuRegisters, mem: &mut Memory, value: u16) {
    let sp = regs[Register::R6].wrapping_sub(1);
    regs[Register::R6] = sp;
    mem.write(sp, value);
}

fn pop(regs: &mut EmuRegisters, mem: &Memory) -> u16 {
    let sp = regs[Register::R6];
    regs[Register::R6] = sp.wrapping_add(1);
    mem.peek(sp)
}

impl ShadowStack {
    pub fn in_call(&self) -> bool {
        self.depth > 0
    }

    /// Opens a frame for a call that will return to `return_addr`.
    pub fn on_call(&mut self, regs: &mut EmuRegisters, mem: &mut Memory, return_addr: u16) {
        if self.in_call() {
            push(regs, mem, self.counter);
            self.counter = 0;
        }
        self.depth += 1;
        push(regs, mem, return_addr);
        log::trace!(
            "shadow: call depth={} ret=x{:04X} sp=x{:04X}",
            self.depth,
            return_addr,
            regs[Register::R6]
        );
    }

    /// Records a value stored to memory. Outside of a call this does nothing.
    pub fn on_store(&mut self, regs: &mut EmuRegisters, mem: &mut Memory, value: u16) {
        if !self.in_call() {
            return;
        }
        push(regs, mem, value);
        self.counter = self.counter.wrapping_add(1);
        log::trace!(
            "shadow: push x{:04X} count={} sp=x{:04X}",
            value,
            self.counter,
            regs[Register::R6]
        );
    }

    /// Closes the innermost frame. Outside of a call this does nothing.
    pub fn on_return(&mut self, regs: &mut EmuRegisters, mem: &mut Memory) {
        if !self.in_call() {
            return;
        }
        regs[Register::R6] = regs[Register::R6].wrapping_add(self.counter);
        let return_addr = pop(regs, mem);
        if return_addr != regs[Register::R7] {
            log::debug!(
                "shadow: frame return address x{:04X} differs from R7=x{:04X}",
                return_addr,
                regs[Register::R7]
            );
        }
        self.depth -= 1;
        self.counter = if self.in_call() { pop(regs, mem) } else { 0 };
        log::trace!(
            "shadow: return depth={} sp=x{:04X}",
            self.depth,
            regs[Register::R6]
        );
    }

    /// Return addresses of the open frames, innermost first.
    pub fn return_addresses(&self, regs: &EmuRegisters, mem: &Memory) -> Vec<u16> {
        let mut sp = regs[Register::R6];
        let mut pushed = self.counter;
        let mut out = Vec::with_capacity(self.depth as usize);
        for level in 0..self.depth {
            sp = sp.wrapping_add(pushed);
            out.push(mem.peek(sp));
            sp = sp.wrapping_add(1);
            if level + 1 < self.depth {
                pushed = mem.peek(sp);
                sp = sp.wrapping_add(1);
            }
        }
        out
    }
}
