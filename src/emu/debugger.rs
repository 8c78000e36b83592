use std::collections::VecDeque;

use anyhow::Result;
use rustc_hash::FxHashSet;
use rustyline::{error::ReadlineError, DefaultEditor};

use crate::plat::{Instruction, Opcode, Register};

use super::{
    command::Command,
    console::Console,
    emulator::{EmuState, Emulator},
};

const PROMPT: &str = "> ";

/// A source of operator command lines.
pub trait Prompt {
    /// Shows `prompt` and reads one line. `None` means the operator is gone (end of
    /// input or Ctrl-C).
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>>;

    /// Shows one line of debugger output.
    fn print(&mut self, line: &str) {
        eprintln!("{line}");
    }
}

/// Writes a formatted line through the debugger's [Prompt].
macro_rules! say {
    ($dbg:expr, $($arg:tt)*) => {
        $dbg.prompt.print(&format!($($arg)*))
    };
}

/// Interactive line editor with history.
pub struct Editor {
    editor: DefaultEditor,
}

impl Editor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            editor: DefaultEditor::new()?,
        })
    }
}

impl Prompt for Editor {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        match self.editor.readline(prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    self.editor.add_history_entry(line.as_str())?;
                }
                Ok(Some(line))
            }
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Prerecorded command lines, consumed in order. Output is recorded instead of shown.
#[derive(Debug, Clone, Default)]
pub struct Script {
    lines: VecDeque<String>,
    output: Vec<String>,
}

impl Script {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            output: Vec::new(),
        }
    }

    /// Every line the debugger printed, in order.
    pub fn output(&self) -> &[String] {
        &self.output
    }
}

impl Prompt for Script {
    fn read_line(&mut self, _prompt: &str) -> Result<Option<String>> {
        Ok(self.lines.pop_front())
    }

    fn print(&mut self, line: &str) {
        self.output.push(line.to_string());
    }
}

/// Where the debugging session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for `run`; only breakpoint management and inspection are allowed.
    NotRunning,
    /// Executing unattended until a breakpoint or halt.
    Running,
    /// Stopped at a breakpoint or after a step, waiting for the operator.
    Paused,
}

/// Result of registering a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointAdded {
    /// Newly added; carries its display number.
    New(usize),
    Duplicate,
}

/// Why unattended execution stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// `PC` reached a breakpoint; the instruction there has not executed.
    Breakpoint(u16),
    Halted,
}

/// How a debugging session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Halted,
    Quit,
}

enum Resume {
    Continue,
    Halted,
    Quit,
}

/// The interactive debugger. Drives an [Emulator] one [`Emulator::step`] at a time,
/// pausing before any instruction whose address is a breakpoint.
pub struct Debugger<'a, C: Console, P: Prompt> {
    pub emu: &'a mut Emulator<C>,
    prompt: P,
    breakpoints: FxHashSet<u16>,
    num_breakpoints: usize,
    last_command: Option<Command>,
    phase: Phase,
}

impl<'a, C: Console, P: Prompt> Debugger<'a, C, P> {
    pub fn new(emu: &'a mut Emulator<C>, prompt: P) -> Self {
        Self {
            emu,
            prompt,
            breakpoints: FxHashSet::default(),
            num_breakpoints: 0,
            last_command: None,
            phase: Phase::NotRunning,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn prompt(&self) -> &P {
        &self.prompt
    }

    /// Registers a breakpoint at `addr`. Registering an existing address changes nothing.
    pub fn add_breakpoint(&mut self, addr: u16) -> BreakpointAdded {
        if self.breakpoints.insert(addr) {
            self.num_breakpoints += 1;
            log::debug!("breakpoint {} at x{:04X}", self.num_breakpoints, addr);
            BreakpointAdded::New(self.num_breakpoints)
        } else {
            BreakpointAdded::Duplicate
        }
    }

    /// Removes the breakpoint at `addr`, returning whether there was one.
    pub fn remove_breakpoint(&mut self, addr: u16) -> bool {
        self.breakpoints.remove(&addr)
    }

    /// All breakpoints in address order.
    pub fn breakpoints(&self) -> Vec<u16> {
        let mut out: Vec<_> = self.breakpoints.iter().copied().collect();
        out.sort_unstable();
        out
    }

    /// Runs a whole session: accepts commands until `run`, then executes the program,
    /// handing control to the operator at every breakpoint.
    pub fn repl(&mut self) -> Result<SessionEnd> {
        say!(self, "LC-3 debugger. Set breakpoints with `break <addr>`, then `run`.");
        loop {
            match self.next_command()? {
                None | Some(Command::Quit) => return Ok(SessionEnd::Quit),
                Some(Command::Run) => break,
                Some(cmd) => self.inspect(cmd),
            }
        }
        self.phase = Phase::Running;

        loop {
            self.emu.console.enter_raw_mode()?;
            let outcome = self.run_until_break();
            self.emu.console.restore()?;
            match outcome? {
                RunOutcome::Halted => {
                    self.report_halt();
                    return Ok(SessionEnd::Halted);
                }
                RunOutcome::Breakpoint(addr) => {
                    say!(self, "Hit breakpoint at address 0x{addr:04x}");
                    self.print_status();
                    match self.pause()? {
                        Resume::Continue => {}
                        Resume::Halted => return Ok(SessionEnd::Halted),
                        Resume::Quit => return Ok(SessionEnd::Quit),
                    }
                }
            }
        }
    }

    /// Executes unattended until `PC` reaches a breakpoint or the machine halts.
    ///
    /// When resuming from a pause, the instruction at the paused address runs before
    /// breakpoints are checked again.
    pub fn run_until_break(&mut self) -> Result<RunOutcome> {
        let mut resume_at = (self.phase == Phase::Paused).then(|| self.emu.pc());
        self.phase = Phase::Running;
        loop {
            let pc = self.emu.pc();
            if resume_at.take() != Some(pc) && self.breakpoints.contains(&pc) {
                self.phase = Phase::Paused;
                return Ok(RunOutcome::Breakpoint(pc));
            }
            if self.emu.step()? == EmuState::Halt {
                self.phase = Phase::Paused;
                return Ok(RunOutcome::Halted);
            }
        }
    }

    /// Interactive loop while paused.
    fn pause(&mut self) -> Result<Resume> {
        loop {
            let Some(cmd) = self.next_command()? else {
                return Ok(Resume::Quit);
            };
            let halted = self.emu.state == EmuState::Halt;
            match cmd {
                Command::Step | Command::Next if halted => {
                    say!(self, "The program has halted.");
                }
                Command::Step => {
                    self.step()?;
                }
                Command::Next => {
                    self.step_over()?;
                }
                Command::Continue if halted => return Ok(Resume::Halted),
                Command::Continue => return Ok(Resume::Continue),
                Command::Quit => return Ok(Resume::Quit),
                other => self.inspect(other),
            }
        }
    }

    /// Executes exactly one instruction and reports the new state.
    pub fn step(&mut self) -> Result<EmuState> {
        let state = self.emu.step()?;
        self.print_status();
        if state == EmuState::Halt {
            self.report_halt();
        }
        Ok(state)
    }

    /// Like [`Debugger::step`], but a subroutine call or trap runs until control comes
    /// back to the following instruction, the machine halts, or a breakpoint is reached.
    ///
    /// Calls made inside the subroutine are counted, so a recursive call passing through
    /// the same return address does not end the step early.
    pub fn step_over(&mut self) -> Result<EmuState> {
        let call = self.emu.next_instr();
        if !call.is_call() {
            return self.step();
        }
        let return_addr = self.emu.pc().wrapping_add(1);
        let mut depth = usize::from(call.opcode() == Opcode::Jsr);
        let mut state = self.emu.step()?;
        while state == EmuState::Continue && (depth > 0 || self.emu.pc() != return_addr) {
            let pc = self.emu.pc();
            if self.breakpoints.contains(&pc) {
                say!(self, "Hit breakpoint at address 0x{pc:04x}");
                break;
            }
            let instr = self.emu.next_instr();
            match instr.opcode() {
                Opcode::Jsr => depth += 1,
                Opcode::Jmp if instr.base_r() == Register::R7 => {
                    depth = depth.saturating_sub(1)
                }
                _ => {}
            }
            state = self.emu.step()?;
        }
        self.print_status();
        if state == EmuState::Halt {
            self.report_halt();
        }
        Ok(state)
    }

    /// Reads commands until one is acceptable in the current phase. Blank lines repeat
    /// the last accepted command; anything unacceptable is reported and prompted for
    /// again. Returns `None` when input ends.
    fn next_command(&mut self) -> Result<Option<Command>> {
        loop {
            let Some(line) = self.prompt.read_line(PROMPT)? else {
                return Ok(None);
            };
            let cmd = match Command::parse(&line) {
                Ok(Some(cmd)) => cmd,
                Ok(None) => match self.last_command {
                    Some(cmd) => cmd,
                    None => continue,
                },
                Err(e) => {
                    say!(self, "{e}");
                    continue;
                }
            };
            if !self.accepts(cmd) {
                let token = line.split_whitespace().next().unwrap_or_default();
                say!(self, "\"{token}\" is not a valid command.");
                continue;
            }
            if cmd.repeatable() {
                self.last_command = Some(cmd);
            }
            return Ok(Some(cmd));
        }
    }

    fn accepts(&self, cmd: Command) -> bool {
        match cmd {
            Command::Break(_)
            | Command::Delete(_)
            | Command::List
            | Command::Registers
            | Command::Peek(_)
            | Command::Quit => true,
            Command::Run => self.phase == Phase::NotRunning,
            Command::Step
            | Command::Next
            | Command::Continue
            | Command::Backtrace(_)
            | Command::Frames => self.phase == Phase::Paused,
        }
    }

    /// Commands that never move the machine.
    fn inspect(&mut self, cmd: Command) {
        match cmd {
            Command::Break(addr) => match self.add_breakpoint(addr) {
                BreakpointAdded::New(n) => {
                    say!(self, "Breakpoint {n} at address 0x{addr:04x}")
                }
                BreakpointAdded::Duplicate => {
                    say!(self, "Breakpoint at 0x{addr:04x} already exists")
                }
            },
            Command::Delete(addr) => {
                if self.remove_breakpoint(addr) {
                    say!(self, "Deleted breakpoint at address 0x{addr:04x}");
                } else {
                    say!(self, "No breakpoint at address 0x{addr:04x}");
                }
            }
            Command::List => {
                let breakpoints = self.breakpoints();
                if breakpoints.is_empty() {
                    say!(self, "No breakpoints.");
                }
                for addr in breakpoints {
                    say!(self, "  0x{addr:04x}");
                }
            }
            Command::Registers => say!(self, "{}", self.emu.registers),
            Command::Peek(addr) => {
                let value = self.emu.memory.peek(addr);
                say!(self, "x{addr:04X}: x{value:04X}  {}", Instruction(value));
            }
            Command::Backtrace(n) => {
                let history = &self.emu.instr_history;
                for (addr, instr) in history.iter().skip(history.len().saturating_sub(n)) {
                    say!(self, "x{addr:04X}: {instr}");
                }
            }
            Command::Frames => match &self.emu.shadow {
                Some(shadow) => {
                    let frames = shadow.return_addresses(&self.emu.registers, &self.emu.memory);
                    if frames.is_empty() {
                        say!(self, "Not inside a subroutine.");
                    }
                    for (depth, addr) in frames.iter().enumerate() {
                        say!(self, "#{depth} returns to x{addr:04X}");
                    }
                }
                None => say!(self, "Call tracing is off (start with --trace-calls)."),
            },
            Command::Run | Command::Step | Command::Next | Command::Continue | Command::Quit => {
                log::debug!("{cmd:?} does not inspect");
            }
        }
    }

    fn print_status(&mut self) {
        let regs = &self.emu.registers;
        say!(
            self,
            "Flag is currently {}: 0x{:x}",
            regs.cond.name(),
            regs.cond.bits()
        );
        say!(
            self,
            "Currently at address: 0x{:04x}  [{}]",
            regs.pc,
            self.emu.next_instr()
        );
    }

    fn report_halt(&mut self) {
        say!(self, "Program terminated at address 0x{:04x}", self.emu.pc());
        if self.emu.last_instr().is_some_and(Instruction::is_halt) {
            say!(self, "Program terminated successfully");
        } else {
            say!(self, "Program terminated with errors");
        }
    }
}
