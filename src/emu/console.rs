//! Character I/O used by the trap routines and the memory-mapped keyboard.

use std::{
    collections::VecDeque,
    io::{self, IsTerminal, Read, Stdout, Write},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal,
};

use super::EmuError;

/// The machine's view of a keyboard and a character display.
pub trait Console {
    /// Waits at most `timeout` for a key and returns it if one arrived.
    fn poll_key(&mut self, timeout: Duration) -> Result<Option<u8>>;

    /// Blocks until a key is available.
    fn read_key(&mut self) -> Result<u8>;

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Switches input to unbuffered, no-echo mode.
    fn enter_raw_mode(&mut self) -> Result<()> {
        Ok(())
    }

    /// Restores the input mode the console started in. Calling it when the console is
    /// not in raw mode does nothing.
    fn restore(&mut self) -> Result<()> {
        Ok(())
    }

    /// Looks for an operator interrupt without blocking. Keys meant for the program are
    /// kept for later reads.
    fn check_interrupt(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Scoped raw input mode. Dropping the guard restores the terminal.
#[derive(Debug)]
pub struct RawMode {
    active: bool,
}

impl RawMode {
    pub fn enable() -> Result<Self> {
        terminal::enable_raw_mode()?;
        log::debug!("raw mode on");
        Ok(Self { active: true })
    }

    /// Leaves raw mode now instead of at drop.
    pub fn restore(&mut self) -> Result<()> {
        if self.active {
            self.active = false;
            terminal::disable_raw_mode()?;
            log::debug!("raw mode off");
        }
        Ok(())
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

/// The process's own terminal, or plain stdin/stdout when they are not a TTY.
#[derive(Debug)]
pub struct Terminal {
    tty: bool,
    raw: Option<RawMode>,
    out: Stdout,
    /// Keys read while checking for an interrupt, not yet seen by the program.
    pending: VecDeque<u8>,
    /// Bytes from a non-TTY stdin, fed by a reader thread.
    stdin: Option<Receiver<u8>>,
}

impl Terminal {
    pub fn new() -> Self {
        Self {
            tty: io::stdin().is_terminal(),
            raw: None,
            out: io::stdout(),
            pending: VecDeque::new(),
            stdin: None,
        }
    }

    /// The channel of stdin bytes. The reader thread starts on first use and ends at
    /// end of input.
    fn stdin_bytes(&mut self) -> &Receiver<u8> {
        self.stdin.get_or_insert_with(|| spawn_byte_reader(io::stdin()))
    }
}

/// Forwards `reader` byte by byte from a background thread, so waiting for input can
/// be bounded.
fn spawn_byte_reader<R: Read + Send + 'static>(mut reader: R) -> Receiver<u8> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; 1];
        while reader.read_exact(&mut buf).is_ok() {
            if tx.send(buf[0]).is_err() {
                break;
            }
        }
    });
    rx
}

/// Waits at most `timeout` for the next byte. A closed channel reads as no key.
fn recv_byte(rx: &Receiver<u8>, timeout: Duration) -> Option<u8> {
    match rx.recv_timeout(timeout) {
        Ok(byte) => Some(byte),
        Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
    }
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new()
    }
}

/// Translates a key press into the byte a program would read from the keyboard data
/// register. Ctrl-C becomes [`EmuError::Interrupted`], since raw mode swallows SIGINT.
fn key_byte(key: KeyEvent) -> Result<Option<u8>> {
    if key.kind == KeyEventKind::Release {
        return Ok(None);
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        if let KeyCode::Char(ch) = key.code {
            if ch.eq_ignore_ascii_case(&'c') {
                return Err(EmuError::Interrupted.into());
            }
            if ch.is_ascii_alphabetic() {
                return Ok(Some(ch.to_ascii_lowercase() as u8 & 0x1F));
            }
        }
    }
    Ok(match key.code {
        KeyCode::Char(ch) if ch.is_ascii() => Some(ch as u8),
        KeyCode::Enter => Some(b'\n'),
        KeyCode::Tab => Some(b'\t'),
        KeyCode::Backspace => Some(0x08),
        KeyCode::Esc => Some(0x1B),
        _ => None,
    })
}

impl Console for Terminal {
    fn poll_key(&mut self, timeout: Duration) -> Result<Option<u8>> {
        if !self.tty {
            return Ok(recv_byte(self.stdin_bytes(), timeout));
        }
        if let Some(byte) = self.pending.pop_front() {
            return Ok(Some(byte));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !event::poll(remaining)? {
                return Ok(None);
            }
            if let Event::Key(key) = event::read()? {
                if let Some(byte) = key_byte(key)? {
                    return Ok(Some(byte));
                }
            }
            if remaining.is_zero() {
                return Ok(None);
            }
        }
    }

    fn read_key(&mut self) -> Result<u8> {
        if !self.tty {
            return self
                .stdin_bytes()
                .recv()
                .map_err(|_| EmuError::InputClosed.into());
        }
        if let Some(byte) = self.pending.pop_front() {
            return Ok(byte);
        }
        loop {
            if let Event::Key(key) = event::read()? {
                if let Some(byte) = key_byte(key)? {
                    return Ok(byte);
                }
            }
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.raw.is_some() {
            // raw mode doesn't translate newlines
            for chunk in bytes.split_inclusive(|b| *b == b'\n') {
                match chunk.split_last() {
                    Some((b'\n', head)) => {
                        self.out.write_all(head)?;
                        self.out.write_all(b"\r\n")?;
                    }
                    _ => self.out.write_all(chunk)?,
                }
            }
        } else {
            self.out.write_all(bytes)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    fn enter_raw_mode(&mut self) -> Result<()> {
        if self.tty && self.raw.is_none() {
            self.raw = Some(RawMode::enable()?);
        }
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        if let Some(mut raw) = self.raw.take() {
            raw.restore()?;
        }
        Ok(())
    }

    /// Raw mode disables SIGINT, so Ctrl-C has to be read off the event queue.
    fn check_interrupt(&mut self) -> Result<()> {
        if self.raw.is_none() {
            return Ok(());
        }
        while event::poll(Duration::ZERO)? {
            if let Event::Key(key) = event::read()? {
                if let Some(byte) = key_byte(key)? {
                    self.pending.push_back(byte);
                }
            }
        }
        Ok(())
    }
}

/// An in-memory console for headless runs: keys come from a queue and output is
/// collected in a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferedConsole {
    input: VecDeque<u8>,
    output: Vec<u8>,
    interrupted: bool,
}

impl BufferedConsole {
    pub fn new(input: impl AsRef<[u8]>) -> Self {
        Self {
            input: input.as_ref().iter().copied().collect(),
            output: Vec::new(),
            interrupted: false,
        }
    }

    /// Queues an operator interrupt, reported by the next [`Console::check_interrupt`].
    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

impl Console for BufferedConsole {
    fn poll_key(&mut self, _timeout: Duration) -> Result<Option<u8>> {
        Ok(self.input.pop_front())
    }

    fn read_key(&mut self) -> Result<u8> {
        self.input
            .pop_front()
            .ok_or_else(|| EmuError::InputClosed.into())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.output.extend_from_slice(bytes);
        Ok(())
    }

    fn check_interrupt(&mut self) -> Result<()> {
        if std::mem::take(&mut self.interrupted) {
            return Err(EmuError::Interrupted.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_console() {
        let mut console = BufferedConsole::new("ab");
        assert_eq!(console.poll_key(Duration::ZERO).unwrap(), Some(b'a'));
        assert_eq!(console.read_key().unwrap(), b'b');
        assert_eq!(console.poll_key(Duration::ZERO).unwrap(), None);
        let err = console.read_key().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmuError>(),
            Some(EmuError::InputClosed)
        ));
        console.write_bytes(b"hi\n").unwrap();
        assert_eq!(console.output_string(), "hi\n");
    }

    #[test]
    fn test_buffered_interrupt_is_reported_once() {
        let mut console = BufferedConsole::new("k");
        console.check_interrupt().unwrap();
        console.interrupt();
        let err = console.check_interrupt().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EmuError>(),
            Some(EmuError::Interrupted)
        ));
        console.check_interrupt().unwrap();
        assert_eq!(console.read_key().unwrap(), b'k');
    }

    /// Blocks each read until the test hands it a byte.
    struct Gated(Receiver<u8>);

    impl Read for Gated {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv() {
                Ok(byte) => {
                    buf[0] = byte;
                    Ok(1)
                }
                Err(_) => Ok(0),
            }
        }
    }

    #[test]
    fn test_idle_input_poll_is_bounded() {
        let (gate, rx) = mpsc::channel();
        let bytes = spawn_byte_reader(Gated(rx));

        let start = Instant::now();
        assert_eq!(recv_byte(&bytes, Duration::from_millis(20)), None);
        assert!(start.elapsed() < Duration::from_secs(1));

        gate.send(b'q').unwrap();
        assert_eq!(recv_byte(&bytes, Duration::from_secs(5)), Some(b'q'));

        drop(gate);
        assert_eq!(recv_byte(&bytes, Duration::from_secs(5)), None);
    }

    #[test]
    fn test_key_byte() {
        let press = |code, modifiers| KeyEvent::new(code, modifiers);
        assert_eq!(
            key_byte(press(KeyCode::Char('x'), KeyModifiers::NONE)).unwrap(),
            Some(b'x')
        );
        assert_eq!(
            key_byte(press(KeyCode::Enter, KeyModifiers::NONE)).unwrap(),
            Some(b'\n')
        );
        assert_eq!(
            key_byte(press(KeyCode::Char('d'), KeyModifiers::CONTROL)).unwrap(),
            Some(0x04)
        );
        assert_eq!(key_byte(press(KeyCode::F(1), KeyModifiers::NONE)).unwrap(), None);
        assert!(key_byte(press(KeyCode::Char('c'), KeyModifiers::CONTROL)).is_err());
    }
}
