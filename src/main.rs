use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use lc3::emu::{
    command::{parse_address, CommandError},
    console::{Console, Terminal},
    debugger::{Debugger, Editor},
    emulator::Emulator,
    EmuConfig,
};
use log::LevelFilter;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// Runs an LC-3 object image, optionally under an interactive debugger.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Path to the object image (big-endian, origin word first).
    image: PathBuf,

    /// Start in the interactive debugger.
    #[arg(short, long)]
    debug: bool,

    /// Keep a diagnostic call stack in R6 (see `where` in the debugger).
    #[arg(long)]
    trace_calls: bool,

    /// Initial program counter, in hex.
    #[arg(long, value_name = "ADDR", default_value = "3000", value_parser = parse_entry)]
    entry: u16,

    /// Longest time a keyboard status read waits for a key.
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    poll_timeout_ms: u64,

    /// Log level (off, error, warn, info, debug, trace).
    #[arg(long, default_value = "warn")]
    log_level: LevelFilter,
}

fn parse_entry(text: &str) -> Result<u16, CommandError> {
    parse_address(text)
}

impl Args {
    fn emu_config(&self) -> EmuConfig {
        EmuConfig {
            entry: self.entry,
            trace_calls: self.trace_calls,
            poll_timeout: std::time::Duration::from_millis(self.poll_timeout_ms),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    TermLogger::init(
        args.log_level,
        ConfigBuilder::new().set_time_level(LevelFilter::Off).build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    let mut emu = Emulator::new(Terminal::new(), args.emu_config());
    let image = emu.load_file(&args.image)?;
    log::info!(
        "loaded {} ({} words at x{:04X})",
        args.image.display(),
        image.len,
        image.origin
    );

    if args.debug {
        let end = Debugger::new(&mut emu, Editor::new()?).repl()?;
        log::info!("debug session ended: {end:?}");
    } else {
        emu.console.enter_raw_mode()?;
        let result = emu.run_until_halt();
        emu.console.restore()?;
        result?;
    }
    Ok(())
}
