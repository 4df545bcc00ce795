use std::collections::VecDeque;
use std::io::{Read, Write};

/// Character device the I/O primitives talk to.
pub trait Console {
    fn emit(&mut self, byte: u8);
    fn newline(&mut self);
    /// Block for the next input byte, `None` once input has ended.
    fn read_key(&mut self) -> Option<u8>;
}

/// Process stdin/stdout.
#[derive(Debug, Default)]
pub struct StdConsole;

impl Console for StdConsole {
    fn emit(&mut self, byte: u8) {
        // A closed stdout leaves nothing useful to report to.
        let _ = std::io::stdout().write_all(&[byte]);
    }

    fn newline(&mut self) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(b"\n");
        let _ = stdout.flush();
    }

    fn read_key(&mut self) -> Option<u8> {
        let _ = std::io::stdout().flush();
        let mut byte = [0u8];
        match std::io::stdin().read(&mut byte) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }
}

/// In-memory console with scripted keystrokes and captured output.
#[derive(Debug, Default, Clone)]
pub struct BufferConsole {
    keys: VecDeque<u8>,
    output: Vec<u8>,
}

impl BufferConsole {
    pub fn with_keys(keys: &[u8]) -> Self {
        BufferConsole {
            keys: keys.iter().copied().collect(),
            output: Vec::new(),
        }
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn output_str(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

impl Console for BufferConsole {
    fn emit(&mut self, byte: u8) {
        self.output.push(byte);
    }

    fn newline(&mut self) {
        self.output.push(b'\n');
    }

    fn read_key(&mut self) -> Option<u8> {
        self.keys.pop_front()
    }
}

#[test]
fn test_buffer_console() {
    let mut console = BufferConsole::with_keys(b"ab");
    console.emit(b'o');
    console.emit(b'k');
    console.newline();
    assert_eq!(console.output_str(), "ok\n");
    assert_eq!(console.read_key(), Some(b'a'));
    assert_eq!(console.read_key(), Some(b'b'));
    assert_eq!(console.read_key(), None);
}
