use std::{collections::VecDeque, io::Read, path::Path};

use anyhow::Result;

use crate::plat::{Instruction, Opcode, Register, TrapVector};

use super::{
    console::{Console, Terminal},
    loader::{self, LoadedImage},
    memory::{Memory, MEMORY_SIZE},
    registers::EmuRegisters,
    shadow::{ShadowStack, STACK_END},
    EmuConfig, EmuError,
};

/// How many executed instructions [`Emulator::instr_history`] keeps.
pub const HISTORY_LEN: usize = 64;

/// Instructions executed between checks for an operator interrupt.
pub const INTERRUPT_CHECK_INTERVAL: u64 = 1024;

/// The emulator's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmuState {
    /// The emulator is allowed to run.
    Continue,
    /// Execution stopped at a `HALT` trap.
    Halt,
}

/// The main emulation context for the LC-3.
#[derive(Debug)]
pub struct Emulator<C: Console = Terminal> {
    pub registers: EmuRegisters,
    pub memory: Memory,
    pub state: EmuState,
    /// Present when the diagnostic call stack is enabled.
    pub shadow: Option<ShadowStack>,
    /// The most recently executed instructions with their addresses, oldest first.
    pub instr_history: VecDeque<(u16, Instruction)>,
    pub console: C,
    /// Instructions executed so far.
    pub steps: u64,
    config: EmuConfig,
}

impl<C: Console> Emulator<C> {
    /// Creates a machine with cleared memory, `PC` at the configured entry point and the
    /// zero flag set.
    pub fn new(console: C, config: EmuConfig) -> Self {
        let mut registers = EmuRegisters::new(config.entry);
        let shadow = config.trace_calls.then(|| {
            registers[Register::R6] = STACK_END;
            ShadowStack::default()
        });
        Self {
            registers,
            memory: Memory::new(),
            state: EmuState::Continue,
            shadow,
            instr_history: VecDeque::with_capacity(HISTORY_LEN),
            console,
            steps: 0,
            config,
        }
    }

    /// Loads an image from `reader` into memory.
    pub fn load<R: Read>(&mut self, reader: R) -> Result<LoadedImage> {
        loader::load_image(reader, &mut self.memory)
    }

    /// Loads the image file at `path` into memory.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<LoadedImage> {
        loader::load_image_file(path, &mut self.memory)
    }

    /// Copies `words` into memory starting at `origin`, wrapping past `0xFFFF`.
    pub fn write_words(&mut self, origin: u16, words: &[u16]) {
        for (offset, word) in words.iter().enumerate() {
            self.memory.write(origin.wrapping_add(offset as u16), *word);
        }
    }

    pub fn pc(&self) -> u16 {
        self.registers.pc
    }

    /// The instruction `PC` points at, read without device side effects.
    pub fn next_instr(&self) -> Instruction {
        Instruction(self.memory.peek(self.registers.pc))
    }

    /// The last instruction executed, if any.
    pub fn last_instr(&self) -> Option<Instruction> {
        self.instr_history.back().map(|(_, instr)| *instr)
    }

    /// Runs the emulator, stepping through instructions until it reaches a halt state.
    pub fn run_until_halt(&mut self) -> Result<()> {
        while self.step()? == EmuState::Continue {}
        Ok(())
    }

    /// Fetches, decodes and executes one instruction.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::BadInstruction`] for `RTI` and `RES`, and any console error
    /// raised by a trap routine or a keyboard poll. Every
    /// [`INTERRUPT_CHECK_INTERVAL`] instructions the console is asked for an operator
    /// interrupt, which surfaces as [`EmuError::Interrupted`]. A halted machine does
    /// nothing.
    pub fn step(&mut self) -> Result<EmuState> {
        if self.state == EmuState::Halt {
            return Ok(EmuState::Halt);
        }
        if (self.steps + 1) % INTERRUPT_CHECK_INTERVAL == 0 {
            self.console.check_interrupt()?;
        }
        let addr = self.registers.pc;
        let instr = Instruction(self.read(addr)?);
        self.registers.pc = addr.wrapping_add(1);

        log::trace!(">>> x{:04X}: {}", addr, instr);
        if self.instr_history.len() == HISTORY_LEN {
            self.instr_history.pop_front();
        }
        self.instr_history.push_back((addr, instr));

        self.steps += 1;
        self.state = self.execute(addr, instr)?;
        Ok(self.state)
    }

    fn read(&mut self, addr: u16) -> Result<u16> {
        self.memory
            .read(addr, &mut self.console, self.config.poll_timeout)
    }

    fn store(&mut self, addr: u16, value: u16) {
        self.memory.write(addr, value);
        if let Some(shadow) = &mut self.shadow {
            shadow.on_store(&mut self.registers, &mut self.memory, value);
        }
    }

    fn execute(&mut self, addr: u16, instr: Instruction) -> Result<EmuState> {
        let regs = &mut self.registers;
        let pc = regs.pc;
        match instr.opcode() {
            Opcode::Add => {
                let rhs = if instr.is_imm() {
                    instr.imm5()
                } else {
                    regs[instr.sr2()]
                };
                let value = regs[instr.sr1()].wrapping_add(rhs);
                regs.define(instr.dr(), value);
            }
            Opcode::And => {
                let rhs = if instr.is_imm() {
                    instr.imm5()
                } else {
                    regs[instr.sr2()]
                };
                let value = regs[instr.sr1()] & rhs;
                regs.define(instr.dr(), value);
            }
            Opcode::Not => {
                let value = !regs[instr.sr1()];
                regs.define(instr.dr(), value);
            }
            Opcode::Br => {
                if instr.cc().intersects(regs.cond) {
                    regs.pc = pc.wrapping_add(instr.pc_offset9());
                }
            }
            Opcode::Jmp => {
                regs.pc = regs[instr.base_r()];
                if instr.base_r() == Register::R7 {
                    if let Some(shadow) = &mut self.shadow {
                        shadow.on_return(&mut self.registers, &mut self.memory);
                    }
                }
            }
            Opcode::Jsr => {
                // R7 is written first, so `JSRR R7` jumps to the return address
                regs[Register::R7] = pc;
                regs.pc = if instr.is_jsr() {
                    pc.wrapping_add(instr.pc_offset11())
                } else {
                    regs[instr.base_r()]
                };
                if let Some(shadow) = &mut self.shadow {
                    shadow.on_call(&mut self.registers, &mut self.memory, pc);
                }
            }
            Opcode::Ld => {
                let value = self.read(pc.wrapping_add(instr.pc_offset9()))?;
                self.registers.define(instr.dr(), value);
            }
            Opcode::Ldi => {
                let ptr = self.read(pc.wrapping_add(instr.pc_offset9()))?;
                let value = self.read(ptr)?;
                self.registers.define(instr.dr(), value);
            }
            Opcode::Ldr => {
                let ea = regs[instr.base_r()].wrapping_add(instr.offset6());
                let value = self.read(ea)?;
                self.registers.define(instr.dr(), value);
            }
            Opcode::Lea => {
                regs.define(instr.dr(), pc.wrapping_add(instr.pc_offset9()));
            }
            Opcode::St => {
                let value = regs[instr.dr()];
                self.store(pc.wrapping_add(instr.pc_offset9()), value);
            }
            Opcode::Sti => {
                let value = regs[instr.dr()];
                let ptr = self.read(pc.wrapping_add(instr.pc_offset9()))?;
                self.store(ptr, value);
            }
            Opcode::Str => {
                let value = regs[instr.dr()];
                let ea = regs[instr.base_r()].wrapping_add(instr.offset6());
                self.store(ea, value);
            }
            Opcode::Trap => return self.trap(instr),
            opcode @ (Opcode::Rti | Opcode::Res) => {
                return Err(EmuError::BadInstruction { opcode, addr }.into());
            }
        }
        Ok(EmuState::Continue)
    }

    fn trap(&mut self, instr: Instruction) -> Result<EmuState> {
        self.registers[Register::R7] = self.registers.pc;
        let trap = match TrapVector::try_from(instr.vector()) {
            Ok(trap) => trap,
            Err(e) => {
                log::warn!("{e} at x{:04X}, ignored", self.registers.pc.wrapping_sub(1));
                return Ok(EmuState::Continue);
            }
        };
        match trap {
            TrapVector::Getc => {
                let key = self.console.read_key()?;
                self.registers.define(Register::R0, key as u16);
            }
            TrapVector::Out => {
                let byte = self.registers[Register::R0] as u8;
                self.console.write_bytes(&[byte])?;
                self.console.flush()?;
            }
            TrapVector::Puts => {
                let text = self.string_at(self.registers[Register::R0], |word, out| {
                    out.push(word as u8);
                });
                self.console.write_bytes(&text)?;
                self.console.flush()?;
            }
            TrapVector::In => {
                self.console.write_bytes(b"Enter a character: ")?;
                self.console.flush()?;
                let key = self.console.read_key()?;
                self.console.write_bytes(&[key, b'\n'])?;
                self.console.flush()?;
                self.registers.define(Register::R0, key as u16);
            }
            TrapVector::Putsp => {
                let text = self.string_at(self.registers[Register::R0], |word, out| {
                    let [lo, hi] = word.to_le_bytes();
                    out.push(lo);
                    if hi != 0 {
                        out.push(hi);
                    }
                });
                self.console.write_bytes(&text)?;
                self.console.flush()?;
            }
            TrapVector::Halt => {
                self.console.write_bytes(b"HALT\n")?;
                self.console.flush()?;
                return Ok(EmuState::Halt);
            }
        }
        Ok(EmuState::Continue)
    }

    /// Collects the zero-terminated run of words starting at `start`, unpacking each
    /// word with `unpack`.
    fn string_at(&self, start: u16, unpack: impl Fn(u16, &mut Vec<u8>)) -> Vec<u8> {
        let mut out = Vec::new();
        for offset in 0..MEMORY_SIZE {
            let word = self.memory.peek(start.wrapping_add(offset as u16));
            if word == 0 {
                break;
            }
            unpack(word, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        emu::console::BufferedConsole,
        plat::{Cond, KBDR, KBSR, PC_START},
    };

    use super::*;

    fn emu_with(program: &[u16], input: &str) -> Emulator<BufferedConsole> {
        let mut emu = Emulator::new(BufferedConsole::new(input), EmuConfig::default());
        emu.write_words(PC_START, program);
        emu
    }

    fn run(emu: &mut Emulator<BufferedConsole>, steps: usize) {
        for _ in 0..steps {
            emu.step().unwrap();
        }
    }

    #[test]
    fn test_halt_alone() {
        let mut emu = emu_with(&[0xF025], "");
        assert_eq!(emu.step().unwrap(), EmuState::Halt);
        assert_eq!(emu.pc(), 0x3001);
        assert_eq!(emu.registers[Register::R7], 0x3001);
        assert_eq!(emu.console.output_string(), "HALT\n");
        assert_eq!(emu.last_instr(), Some(Instruction(0xF025)));
        // stepping a halted machine is a no-op
        assert_eq!(emu.step().unwrap(), EmuState::Halt);
        assert_eq!(emu.pc(), 0x3001);
    }

    #[test]
    fn test_load_then_run() {
        let image: Vec<u8> = [0x3000u16, 0x1025, 0x103D, 0xF025]
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect();
        let mut emu = Emulator::new(BufferedConsole::default(), EmuConfig::default());
        let loaded = emu.load(image.as_slice()).unwrap();
        assert_eq!(loaded.origin, PC_START);
        assert_eq!(loaded.len, 3);
        emu.run_until_halt().unwrap();
        assert_eq!(emu.registers[Register::R0], 2);
        assert_eq!(emu.instr_history.len(), 3);
    }

    #[test]
    fn test_add_immediate() {
        // ADD R0, R0, #5 ; ADD R0, R0, #-3
        let mut emu = emu_with(&[0x1025, 0x103D], "");
        run(&mut emu, 2);
        assert_eq!(emu.registers[Register::R0], 2);
        assert_eq!(emu.registers.cond, Cond::POS);
    }

    #[test]
    fn test_add_and_register_forms() {
        let mut emu = emu_with(
            &[
                0x1262, // ADD R1, R1, #2
                0x14A3, // ADD R2, R2, #3
                0x1642, // ADD R3, R1, R2
                0x5842, // AND R4, R1, R2
                0x5AE0, // AND R5, R3, #0
            ],
            "",
        );
        run(&mut emu, 3);
        assert_eq!(emu.registers[Register::R3], 5);
        emu.step().unwrap();
        assert_eq!(emu.registers[Register::R4], 2 & 3);
        emu.step().unwrap();
        assert_eq!(emu.registers[Register::R5], 0);
        assert_eq!(emu.registers.cond, Cond::ZRO);
    }

    #[test]
    fn test_not_sets_negative() {
        // NOT R1, R0
        let mut emu = emu_with(&[0x923F], "");
        emu.step().unwrap();
        assert_eq!(emu.registers[Register::R1], 0xFFFF);
        assert_eq!(emu.registers.cond, Cond::NEG);
    }

    #[test]
    fn test_flags_follow_every_defining_instruction() {
        let mut emu = emu_with(
            &[
                0x2007, // LD R0, #7      -> x3008 = x8000
                0xA207, // LDI R1, #7     -> mem[x3009] = x300A -> 0
                0x6580, // LDR R2, R6, #0 -> mem[R6]
                0xE7FD, // LEA R3, #-3
                0x1920, // ADD R4, R4, #0
                0x5B60, // AND R5, R5, #0
                0x9DBF, // NOT R6, R6
                0xF025, // HALT
                0x8000, // x3008
                0x300A, // x3009
                0x0000, // x300A
            ],
            "",
        );
        emu.registers[Register::R6] = 0x3008;
        emu.registers[Register::R4] = 9;
        for _ in 0..7 {
            let instr = emu.next_instr();
            emu.step().unwrap();
            let dr = instr.dr();
            assert_eq!(emu.registers.cond.bits().count_ones(), 1, "{instr}");
            assert_eq!(emu.registers.cond, Cond::of(emu.registers[dr]), "{instr}");
        }
        assert_eq!(emu.registers[Register::R0], 0x8000);
        assert_eq!(emu.registers[Register::R1], 0);
        assert_eq!(emu.registers[Register::R2], 0x8000);
        assert_eq!(emu.registers[Register::R3], 0x3001);
    }

    #[test]
    fn test_branch() {
        let mut emu = emu_with(
            &[
                0x5020, // AND R0, R0, #0   (zero)
                0x0602, // BRzp #2          taken
                0x1021, // ADD R0, R0, #1   skipped
                0x1021, // ADD R0, R0, #1   skipped
                0x0201, // BRp #1           not taken
                0x1022, // ADD R0, R0, #2
                0x0E01, // BRnzp #1
                0x1027, // skipped
                0xF025,
            ],
            "",
        );
        emu.run_until_halt().unwrap();
        assert_eq!(emu.registers[Register::R0], 2);
    }

    #[test]
    fn test_nop_branch_never_taken() {
        let mut emu = emu_with(&[0x0005], "");
        emu.step().unwrap();
        assert_eq!(emu.pc(), 0x3001);
    }

    #[test]
    fn test_jmp_jsr_jsrr() {
        let mut emu = emu_with(&[0x4803], ""); // JSR #3
        emu.step().unwrap();
        assert_eq!(emu.pc(), 0x3004);
        assert_eq!(emu.registers[Register::R7], 0x3001);

        let mut emu = emu_with(&[0x4080], ""); // JSRR R2
        emu.registers[Register::R2] = 0x4000;
        emu.step().unwrap();
        assert_eq!(emu.pc(), 0x4000);
        assert_eq!(emu.registers[Register::R7], 0x3001);

        let mut emu = emu_with(&[0xC0C0], ""); // JMP R3
        emu.registers[Register::R3] = 0x1234;
        emu.step().unwrap();
        assert_eq!(emu.pc(), 0x1234);
        assert_eq!(emu.registers.cond, Cond::ZRO);
    }

    #[test]
    fn test_jsrr_through_r7() {
        // the link is written before the base register is read
        let mut emu = emu_with(&[0x41C0], "");
        emu.registers[Register::R7] = 0x5000;
        emu.step().unwrap();
        assert_eq!(emu.registers[Register::R7], 0x3001);
        assert_eq!(emu.pc(), 0x3001);
    }

    #[test]
    fn test_interrupt_stops_tight_loop() {
        // BRnzp #-1 never touches the keyboard
        let mut emu = emu_with(&[0x0FFF], "");
        emu.console.interrupt();
        let err = emu.run_until_halt().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmuError>(),
            Some(EmuError::Interrupted)
        ));
        assert_eq!(emu.steps, INTERRUPT_CHECK_INTERVAL - 1);
        assert_eq!(emu.pc(), PC_START);
    }

    #[test]
    fn test_stores() {
        let mut emu = emu_with(
            &[
                0x3005, // ST R0, #5     -> x3006
                0xB205, // STI R1, #5    -> mem[x3007] = x4000
                0x7482, // STR R2, R2, #2
            ],
            "",
        );
        emu.registers[Register::R0] = 0xAAAA;
        emu.registers[Register::R1] = 0xBBBB;
        emu.registers[Register::R2] = 0x5000;
        emu.memory.write(0x3007, 0x4000);
        run(&mut emu, 3);
        assert_eq!(emu.memory.peek(0x3006), 0xAAAA);
        assert_eq!(emu.memory.peek(0x4000), 0xBBBB);
        assert_eq!(emu.memory.peek(0x5002), 0x5000);
        // stores leave the flags alone
        assert_eq!(emu.registers.cond, Cond::ZRO);
    }

    #[test]
    fn test_address_wraparound() {
        let mut emu = emu_with(&[], "");
        emu.registers.pc = 0xFFFF;
        emu.memory.write(0xFFFF, 0x1021); // ADD R0, R0, #1
        emu.step().unwrap();
        assert_eq!(emu.pc(), 0x0000);

        // LDR R0, R1, #-1 with R1 = 0
        emu.memory.write(0x0000, 0x607F);
        emu.memory.write(0xFFFF, 0x7777);
        emu.step().unwrap();
        assert_eq!(emu.registers[Register::R0], 0x7777);
    }

    #[test]
    fn test_bad_instructions() {
        for word in [0x8000u16, 0xD000] {
            let mut emu = emu_with(&[word], "");
            let err = emu.step().unwrap_err();
            match err.downcast_ref::<EmuError>() {
                Some(EmuError::BadInstruction { addr, .. }) => assert_eq!(*addr, 0x3000),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_trap_output() {
        let mut emu = emu_with(
            &[
                0xE004, // LEA R0, #4 -> x3005
                0xF022, // PUTS
                0xE005, // LEA R0, #5 -> x3008
                0xF024, // PUTSP
                0xF025,
                'h' as u16,
                'i' as u16,
                0,
                u16::from_le_bytes([b'o', b'k']),
                u16::from_le_bytes([b'!', 0]),
                0,
            ],
            "",
        );
        emu.run_until_halt().unwrap();
        assert_eq!(emu.console.output_string(), "hiok!HALT\n");
    }

    #[test]
    fn test_trap_out_and_input() {
        let mut emu = emu_with(
            &[
                0xF020, // GETC
                0xF021, // OUT
                0xF023, // IN
                0xF025,
            ],
            "xy",
        );
        emu.step().unwrap();
        assert_eq!(emu.registers[Register::R0], 'x' as u16);
        assert_eq!(emu.registers.cond, Cond::POS);
        assert_eq!(emu.console.output_string(), "");
        emu.run_until_halt().unwrap();
        assert_eq!(emu.registers[Register::R0], 'y' as u16);
        assert_eq!(
            emu.console.output_string(),
            "xEnter a character: y\nHALT\n"
        );
    }

    #[test]
    fn test_getc_without_input_fails() {
        let mut emu = emu_with(&[0xF020], "");
        assert!(emu.step().is_err());
    }

    #[test]
    fn test_unknown_trap_continues() {
        let mut emu = emu_with(&[0xF0FF, 0xF025], "");
        assert_eq!(emu.step().unwrap(), EmuState::Continue);
        assert_eq!(emu.registers[Register::R7], 0x3001);
        assert_eq!(emu.step().unwrap(), EmuState::Halt);
    }

    #[test]
    fn test_keyboard_polling_loop() {
        let mut emu = emu_with(
            &[
                0xA003, // LDI R0, #3 -> KBSR
                0x07FE, // BRzp #-2
                0xA202, // LDI R1, #2 -> KBDR
                0xF025,
                KBSR,
                KBDR,
            ],
            "k",
        );
        emu.run_until_halt().unwrap();
        assert_eq!(emu.registers[Register::R1], 'k' as u16);
        assert_eq!(emu.memory.peek(KBSR), 0x8000);
    }

    #[test]
    fn test_step_is_deterministic() {
        let program = [0x1025, 0x5242, 0x3005, 0xE7FD, 0x0BFD, 0xF021];
        let mut a = emu_with(&program, "");
        a.registers[Register::R2] = 0x00F0;
        let mut b = emu_with(&program, "");
        b.registers = a.registers;
        for _ in 0..program.len() {
            let sa = a.step().unwrap();
            let sb = b.step().unwrap();
            assert_eq!(sa, sb);
            assert_eq!(a.registers, b.registers);
            assert!(a.memory == b.memory);
        }
        assert_eq!(a.console, b.console);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut emu = emu_with(&[0x0FFF], ""); // BRnzp #-1
        run(&mut emu, HISTORY_LEN + 10);
        assert_eq!(emu.instr_history.len(), HISTORY_LEN);
        assert_eq!(emu.instr_history.back(), Some(&(0x3000, Instruction(0x0FFF))));
    }

    const CALL_PROGRAM: [u16; 9] = [
        0x1025, // x3000 ADD R0, R0, #5
        0x4803, // x3001 JSR #3 -> x3005
        0x3206, // x3002 ST R1, #6
        0x1220, // x3003 ADD R1, R0, #0
        0xF025, // x3004 HALT
        0x127F, // x3005 ADD R1, R1, #-1
        0x3005, // x3006 ST R0, #5
        0x3204, // x3007 ST R1, #4
        0xC1C0, // x3008 RET
    ];

    #[test]
    fn test_shadow_stack_is_architecturally_invisible() {
        let mut plain = emu_with(&CALL_PROGRAM, "");
        plain.run_until_halt().unwrap();

        let config = EmuConfig {
            trace_calls: true,
            ..EmuConfig::default()
        };
        let mut traced = Emulator::new(BufferedConsole::default(), config);
        traced.write_words(PC_START, &CALL_PROGRAM);
        assert_eq!(traced.registers[Register::R6], STACK_END);
        traced.step().unwrap();
        traced.step().unwrap();
        let shadow = traced.shadow.unwrap();
        assert_eq!(shadow.depth, 1);
        assert_eq!(
            shadow.return_addresses(&traced.registers, &traced.memory),
            vec![0x3002]
        );
        traced.run_until_halt().unwrap();

        for reg in Register::GP {
            if reg != Register::R6 {
                assert_eq!(plain.registers[reg], traced.registers[reg], "{reg}");
            }
        }
        assert_eq!(plain.registers.pc, traced.registers.pc);
        assert_eq!(plain.registers.cond, traced.registers.cond);
        assert_eq!(traced.registers[Register::R6], STACK_END);
        assert_eq!(traced.shadow, Some(ShadowStack::default()));
        for addr in 0..STACK_END.wrapping_sub(3) {
            assert_eq!(plain.memory.peek(addr), traced.memory.peek(addr));
        }
    }
}
