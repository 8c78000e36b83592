//! Parsing of debugger command lines.

use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_till1},
    character::complete::{digit1, hex_digit1, space0},
    combinator::{all_consuming, map_res, opt},
    sequence::{delimited, preceded},
    IResult,
};
use thiserror::Error;

/// Default number of entries printed by `bt`.
pub const DEFAULT_BACKTRACE: usize = 10;

/// An operator-facing error. These are reported at the prompt and never stop the
/// session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("\"{0}\" is not a valid command.")]
    Unknown(String),
    #[error("{0} needs an address, e.g. `{0} 3000`")]
    MissingAddress(&'static str),
    #[error("invalid address \"{0}\"")]
    BadAddress(String),
    #[error("invalid count \"{0}\"")]
    BadCount(String),
}

/// A debugger command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Start executing the program.
    Run,
    /// Execute one instruction.
    Step,
    /// Execute one instruction, running subroutine calls and traps to completion.
    Next,
    /// Resume unattended execution.
    Continue,
    /// Add a breakpoint.
    Break(u16),
    /// Remove a breakpoint.
    Delete(u16),
    /// List breakpoints.
    List,
    /// Print all registers.
    Registers,
    /// Print one memory word.
    Peek(u16),
    /// Print the last N executed instructions.
    Backtrace(usize),
    /// Print the shadow call stack.
    Frames,
    /// End the session.
    Quit,
}

impl Command {
    /// Parses one command line. Blank lines yield `None`. Text after a command that
    /// takes no argument is ignored.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let Ok((rest, word)) = keyword(line) else {
            return Ok(None);
        };
        let rest = rest.trim();
        let cmd = match word.to_ascii_lowercase().as_str() {
            "run" => Self::Run,
            "step" | "s" => Self::Step,
            "next" | "n" => Self::Next,
            "continue" | "c" => Self::Continue,
            "break" | "b" => Self::Break(argument_address("break", rest)?),
            "delete" | "d" => Self::Delete(argument_address("delete", rest)?),
            "breakpoints" | "info" => Self::List,
            "regs" | "r" => Self::Registers,
            "peek" | "x" => Self::Peek(argument_address("peek", rest)?),
            "bt" => Self::Backtrace(argument_count(rest)?),
            "where" | "w" => Self::Frames,
            "quit" | "q" => Self::Quit,
            _ => return Err(CommandError::Unknown(word.to_string())),
        };
        Ok(Some(cmd))
    }

    /// Whether a blank line should repeat this command.
    pub fn repeatable(self) -> bool {
        !matches!(self, Self::Run | Self::Quit)
    }
}

/// The first whitespace-delimited word of a line.
fn keyword(inp: &str) -> IResult<&str, &str> {
    preceded(space0, take_till1(char::is_whitespace))(inp)
}

/// A hexadecimal address, optionally prefixed with `0x` or `x`.
fn hex_address(inp: &str) -> IResult<&str, u16> {
    map_res(
        preceded(opt(alt((tag_no_case("0x"), tag_no_case("x")))), hex_digit1),
        |digits: &str| u16::from_str_radix(digits, 16),
    )(inp)
}

/// Parses a whole string as a hexadecimal address.
pub fn parse_address(text: &str) -> Result<u16, CommandError> {
    all_consuming(delimited(space0, hex_address, space0))(text)
        .map(|(_, addr)| addr)
        .map_err(|_| CommandError::BadAddress(text.trim().to_string()))
}

fn argument_address(command: &'static str, rest: &str) -> Result<u16, CommandError> {
    let Ok((_, arg)) = keyword(rest) else {
        return Err(CommandError::MissingAddress(command));
    };
    parse_address(arg)
}

fn argument_count(rest: &str) -> Result<usize, CommandError> {
    let Ok((_, arg)) = keyword(rest) else {
        return Ok(DEFAULT_BACKTRACE);
    };
    all_consuming(map_res(digit1, str::parse::<usize>))(arg)
        .map(|(_, n)| n)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| CommandError::BadCount(arg.to_string()))
}
