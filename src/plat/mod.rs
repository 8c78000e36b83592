//! Common platform code between the LC-3 emulator's other modules: registers, opcodes,
//! trap vectors, condition flags and the instruction decoder.

use std::fmt;

use thiserror::Error;

/// An error for the core platform of the LC-3.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformError {
    #[error("unknown trap vector x{0:02X}")]
    UnknownTrap(u8),
}

/// Type alias for Result<T, [PlatformError]>.
pub type PResult<T> = Result<T, PlatformError>;

/// Address of the keyboard status register.
pub const KBSR: u16 = 0xFE00;
/// Address of the keyboard data register.
pub const KBDR: u16 = 0xFE02;
/// Default load address / entry point of user programs.
pub const PC_START: u16 = 0x3000;

/// The registers of the LC-3.
///
/// `R0` - `R7` are general purpose registers. By convention `R6` is the stack pointer and
/// `R7` holds return addresses. `PC` and `COND` are special.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Register {
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    /// Program counter
    PC,
    /// Condition flags
    COND,
}

impl Register {
    /// All eight general purpose registers, in encoding order.
    pub const GP: [Self; 8] = [
        Self::R0,
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::R7,
    ];

    /// Selects a general purpose register from a 3-bit instruction field.
    /// Bits above the field are ignored.
    pub const fn gp(field: u16) -> Self {
        Self::GP[(field & 0x7) as usize]
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PC => f.write_str("PC"),
            Self::COND => f.write_str("COND"),
            gp => write!(f, "R{}", *gp as u8),
        }
    }
}

bitflags::bitflags! {
    /// The condition flags register. Exactly one flag is set after any register-defining
    /// instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Cond: u16 {
        /// Set if the last result was strictly positive.
        const POS = 1 << 0;
        /// Set if the last result was zero.
        const ZRO = 1 << 1;
        /// Set if the last result had its sign bit set.
        const NEG = 1 << 2;
    }
}

impl Cond {
    /// Classifies a 16-bit result as negative, zero or positive.
    pub const fn of(value: u16) -> Self {
        if value == 0 {
            Self::ZRO
        } else if value >> 15 == 1 {
            Self::NEG
        } else {
            Self::POS
        }
    }

    /// Human readable name of the currently set flag.
    pub fn name(self) -> &'static str {
        if self.contains(Self::POS) {
            "positive"
        } else if self.contains(Self::ZRO) {
            "zero"
        } else if self.contains(Self::NEG) {
            "negative"
        } else {
            "none"
        }
    }
}

/// The sixteen opcodes of the LC-3, selected by bits 15..12 of an instruction.
///
/// Register-defining opcodes ([ADD][Opcode::Add], [AND][Opcode::And], [NOT][Opcode::Not],
/// [LD][Opcode::Ld], [LDI][Opcode::Ldi], [LDR][Opcode::Ldr], [LEA][Opcode::Lea]) set the
/// condition flags from the value written to their destination register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /* Branching */
    /// `if (cc & COND) PC <- PC + offset9`
    Br = 0,

    /* ALU */
    /// `DR <- SR1 + (SR2 | imm5)`
    Add,

    /* Memory */
    /// `DR <- mem[PC + offset9]`
    Ld,
    /// `mem[PC + offset9] <- SR`
    St,

    /* Subroutines */
    /// `R7 <- PC; PC <- PC + offset11` (JSR) or `PC <- BaseR` (JSRR)
    Jsr,

    /// `DR <- SR1 & (SR2 | imm5)`
    And,
    /// `DR <- mem[BaseR + offset6]`
    Ldr,
    /// `mem[BaseR + offset6] <- SR`
    Str,
    /// Return from interrupt. Not supported by this emulator.
    Rti,
    /// `DR <- ~SR1`
    Not,
    /// `DR <- mem[mem[PC + offset9]]`
    Ldi,
    /// `mem[mem[PC + offset9]] <- SR`
    Sti,
    /// `PC <- BaseR`. `JMP R7` is spelled `RET`.
    Jmp,
    /// Reserved. Not supported by this emulator.
    Res,
    /// `DR <- PC + offset9`
    Lea,
    /// `R7 <- PC`, then run the system service selected by the trap vector.
    Trap,
}

impl From<u16> for Opcode {
    /// Decodes the low four bits of `value`. Every pattern is an opcode.
    fn from(value: u16) -> Self {
        match value & 0xF {
            0 => Self::Br,
            1 => Self::Add,
            2 => Self::Ld,
            3 => Self::St,
            4 => Self::Jsr,
            5 => Self::And,
            6 => Self::Ldr,
            7 => Self::Str,
            8 => Self::Rti,
            9 => Self::Not,
            10 => Self::Ldi,
            11 => Self::Sti,
            12 => Self::Jmp,
            13 => Self::Res,
            14 => Self::Lea,
            _ => Self::Trap,
        }
    }
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Br => "BR",
            Self::Add => "ADD",
            Self::Ld => "LD",
            Self::St => "ST",
            Self::Jsr => "JSR",
            Self::And => "AND",
            Self::Ldr => "LDR",
            Self::Str => "STR",
            Self::Rti => "RTI",
            Self::Not => "NOT",
            Self::Ldi => "LDI",
            Self::Sti => "STI",
            Self::Jmp => "JMP",
            Self::Res => "RES",
            Self::Lea => "LEA",
            Self::Trap => "TRAP",
        }
    }
}

/// System services reachable through the `TRAP` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrapVector {
    /// Read one character into R0 without echo.
    Getc = 0x20,
    /// Write the low byte of R0.
    Out = 0x21,
    /// Write a zero-terminated string stored one character per word at R0.
    Puts = 0x22,
    /// Prompt, then read one character into R0 with echo.
    In = 0x23,
    /// Write a zero-terminated string stored two characters per word at R0.
    Putsp = 0x24,
    /// Stop the machine.
    Halt = 0x25,
}

impl TryFrom<u8> for TrapVector {
    type Error = PlatformError;

    fn try_from(value: u8) -> PResult<Self> {
        match value {
            0x20 => Ok(Self::Getc),
            0x21 => Ok(Self::Out),
            0x22 => Ok(Self::Puts),
            0x23 => Ok(Self::In),
            0x24 => Ok(Self::Putsp),
            0x25 => Ok(Self::Halt),
            _ => Err(PlatformError::UnknownTrap(value)),
        }
    }
}

impl fmt::Display for TrapVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Getc => "GETC",
            Self::Out => "OUT",
            Self::Puts => "PUTS",
            Self::In => "IN",
            Self::Putsp => "PUTSP",
            Self::Halt => "HALT",
        })
    }
}

/// Widens the low `bit_count` bits of `x` to 16 bits using two's complement.
///
/// Bits of `x` above the field are discarded before widening.
pub const fn sign_extend(x: u16, bit_count: u32) -> u16 {
    if bit_count == 0 || bit_count >= 16 {
        return x;
    }
    let x = x & ((1 << bit_count) - 1);
    if (x >> (bit_count - 1)) & 1 == 1 {
        x | (0xFFFF << bit_count)
    } else {
        x
    }
}

/// A raw 16-bit LC-3 instruction word.
///
/// Decoding never fails: every accessor is a pure bit-field extraction, and whether the
/// word is executable is decided by the emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction(pub u16);

impl Instruction {
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Extracts `length` bits starting at bit `start`.
    pub const fn get(self, start: u32, length: u32) -> u16 {
        (self.0 >> start) & ((1 << length) - 1)
    }

    pub fn opcode(self) -> Opcode {
        Opcode::from(self.0 >> 12)
    }

    /// Destination register (also the source register of the store instructions).
    pub const fn dr(self) -> Register {
        Register::gp(self.0 >> 9)
    }

    pub const fn sr1(self) -> Register {
        Register::gp(self.0 >> 6)
    }

    pub const fn base_r(self) -> Register {
        Register::gp(self.0 >> 6)
    }

    pub const fn sr2(self) -> Register {
        Register::gp(self.0)
    }

    /// Bit 5 of ADD/AND: use `imm5` instead of `SR2`.
    pub const fn is_imm(self) -> bool {
        (self.0 >> 5) & 1 == 1
    }

    pub const fn imm5(self) -> u16 {
        sign_extend(self.0, 5)
    }

    pub const fn offset6(self) -> u16 {
        sign_extend(self.0, 6)
    }

    pub const fn pc_offset9(self) -> u16 {
        sign_extend(self.0, 9)
    }

    /// Bit 11 of JSR: PC-relative form (`JSR`) rather than register form (`JSRR`).
    pub const fn is_jsr(self) -> bool {
        (self.0 >> 11) & 1 == 1
    }

    pub const fn pc_offset11(self) -> u16 {
        sign_extend(self.0, 11)
    }

    /// Trap vector (low 8 bits).
    pub const fn vector(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub const fn n(self) -> bool {
        (self.0 >> 11) & 1 == 1
    }

    pub const fn z(self) -> bool {
        (self.0 >> 10) & 1 == 1
    }

    pub const fn p(self) -> bool {
        (self.0 >> 9) & 1 == 1
    }

    /// The three branch test bits, laid out like [Cond].
    pub fn cc(self) -> Cond {
        Cond::from_bits_truncate(self.get(9, 3))
    }

    /// Whether this is the `TRAP x25` instruction.
    pub fn is_halt(self) -> bool {
        self.opcode() == Opcode::Trap && self.vector() == TrapVector::Halt as u8
    }

    /// Whether executing this instruction transfers control to a subroutine or system
    /// service that is expected to return to the next word.
    pub fn is_call(self) -> bool {
        match self.opcode() {
            Opcode::Jsr => true,
            Opcode::Trap => !self.is_halt(),
            _ => false,
        }
    }
}

impl fmt::Display for Instruction {
    /// One-line disassembly.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode();
        let m = op.mnemonic();
        match op {
            Opcode::Add | Opcode::And => {
                if self.is_imm() {
                    write!(f, "{m} {}, {}, #{}", self.dr(), self.sr1(), self.imm5() as i16)
                } else {
                    write!(f, "{m} {}, {}, {}", self.dr(), self.sr1(), self.sr2())
                }
            }
            Opcode::Not => write!(f, "NOT {}, {}", self.dr(), self.sr1()),
            Opcode::Br => {
                if self.cc().is_empty() {
                    return f.write_str("NOP");
                }
                f.write_str("BR")?;
                if self.n() {
                    f.write_str("n")?;
                }
                if self.z() {
                    f.write_str("z")?;
                }
                if self.p() {
                    f.write_str("p")?;
                }
                write!(f, " #{}", self.pc_offset9() as i16)
            }
            Opcode::Jmp if self.base_r() == Register::R7 => f.write_str("RET"),
            Opcode::Jmp => write!(f, "JMP {}", self.base_r()),
            Opcode::Jsr if self.is_jsr() => write!(f, "JSR #{}", self.pc_offset11() as i16),
            Opcode::Jsr => write!(f, "JSRR {}", self.base_r()),
            Opcode::Ld | Opcode::Ldi | Opcode::St | Opcode::Sti | Opcode::Lea => {
                write!(f, "{m} {}, #{}", self.dr(), self.pc_offset9() as i16)
            }
            Opcode::Ldr | Opcode::Str => {
                write!(
                    f,
                    "{m} {}, {}, #{}",
                    self.dr(),
                    self.base_r(),
                    self.offset6() as i16
                )
            }
            Opcode::Trap => match TrapVector::try_from(self.vector()) {
                Ok(trap) => write!(f, "TRAP x{:02X} ({})", self.vector(), trap),
                Err(_) => write!(f, "TRAP x{:02X}", self.vector()),
            },
            Opcode::Rti | Opcode::Res => f.write_str(m),
        }
    }
}
