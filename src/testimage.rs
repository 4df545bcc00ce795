//! Hand-assembled snapshots for tests.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::console::BufferConsole;
use crate::image::Snapshot;
use crate::machine::{ForthMachine, MachineConfig};
use crate::opcode::{Primitive, DEFAULT_OPCODES};

pub const SP0: u16 = 0xBB00;
pub const RP0: u16 = 0xBE00;
pub const USER_AREA: u16 = 0xBC00;
pub const INPUT_BUFFER: u16 = 0xB000;
pub const HEADER_SP: u16 = 0xFF00;
const DICTIONARY_START: u16 = 0x8000;

/// Addresses of an entry laid down by `ImageBuilder`.
#[derive(Debug, Clone, Copy)]
pub struct Built {
    pub nfa: u16,
    pub cfa: u16,
    pub pfa: u16,
}

pub struct ImageBuilder {
    image: Snapshot,
    here: u16,
    latest: u16,
    words: HashMap<String, u16>,
}

impl ImageBuilder {
    /// Blank image with the system variables pointing at empty stacks.
    pub fn new() -> Self {
        let config = MachineConfig::default();
        let mut image = Snapshot::blank();
        image.set_word(config.sp_var, SP0);
        image.set_word(config.rp_var, RP0);
        image.set_word(config.up_var, USER_AREA);
        image.set_word(USER_AREA + 6, SP0);
        image.set_word(USER_AREA + 8, RP0);
        image.set_word(config.input_buffer_var, INPUT_BUFFER);
        image.set_header_sp(HEADER_SP);
        ImageBuilder {
            image,
            here: DICTIONARY_START,
            latest: 0,
            words: HashMap::new(),
        }
    }

    /// Every default primitive as a dictionary entry of its own.
    pub fn with_primitives() -> Self {
        let mut builder = ImageBuilder::new();
        for (name, code, prim) in DEFAULT_OPCODES.iter() {
            let runtime = matches!(
                prim,
                Primitive::DoColon
                    | Primitive::DoConstant
                    | Primitive::DoVariable
                    | Primitive::DoUser
                    | Primitive::DoDoes
            );
            if !runtime {
                builder.primitive(name, *code);
            }
        }
        builder
    }

    fn comma(&mut self, val: u16) {
        self.image.set_word(self.here, val);
        self.here += 2;
    }

    fn c_comma(&mut self, val: u8) {
        self.image.set_byte(self.here, val);
        self.here += 1;
    }

    fn header(&mut self, name: &str, code: u16) -> Built {
        let nfa = self.here;
        let bytes = name.as_bytes();
        self.c_comma(0x80 | bytes.len() as u8);
        for (i, byte) in bytes.iter().enumerate() {
            let last = if i + 1 == bytes.len() { 0x80 } else { 0 };
            self.c_comma(byte | last);
        }
        let link = self.latest;
        self.comma(link);
        let cfa = self.here;
        self.comma(code);
        self.latest = nfa;
        self.words.insert(name.to_string(), cfa);
        Built {
            nfa,
            cfa,
            pfa: cfa + 2,
        }
    }

    pub fn primitive(&mut self, name: &str, code: u16) -> Built {
        self.header(name, code)
    }

    /// Colon definition; the closing `;S` is added.
    pub fn secondary(&mut self, name: &str, body: &[u16]) -> Built {
        let built = self.header(name, opcode("DOCOL"));
        for cell in body {
            self.comma(*cell);
        }
        let exit = self.cfa(";S");
        self.comma(exit);
        built
    }

    pub fn constant(&mut self, name: &str, val: u16) -> Built {
        let built = self.header(name, opcode("CONSTANT"));
        self.comma(val);
        built
    }

    pub fn variable(&mut self, name: &str, val: u16) -> Built {
        let built = self.header(name, opcode("VARIABLE"));
        self.comma(val);
        built
    }

    pub fn user(&mut self, name: &str, offset: u8) -> Built {
        let built = self.header(name, opcode("USER"));
        self.c_comma(offset);
        self.c_comma(0);
        built
    }

    /// Word created by a DOES> defining word: runs `body` with the address
    /// of `data` on the stack.
    pub fn does(&mut self, name: &str, body: u16, data: &[u16]) -> Built {
        let built = self.header(name, opcode("DOES>"));
        self.comma(body);
        for cell in data {
            self.comma(*cell);
        }
        built
    }

    /// Raw cells outside of any entry, returning their address.
    pub fn cells(&mut self, cells: &[u16]) -> u16 {
        let addr = self.here;
        for cell in cells {
            self.comma(*cell);
        }
        addr
    }

    /// Counted string outside of any entry, returning its address.
    pub fn counted(&mut self, text: &[u8]) -> u16 {
        let addr = self.here;
        self.c_comma(text.len() as u8);
        for byte in text {
            self.c_comma(*byte);
        }
        addr
    }

    pub fn cfa(&self, name: &str) -> u16 {
        match self.words.get(name) {
            Some(cfa) => *cfa,
            None => panic!("{} was never defined", name),
        }
    }

    pub fn latest(&self) -> u16 {
        self.latest
    }

    /// Default addresses with the chain starting at this image's newest entry.
    pub fn config(&self) -> MachineConfig {
        MachineConfig {
            latest: self.latest,
            ..MachineConfig::default()
        }
    }

    pub fn finish(self) -> Snapshot {
        self.image
    }

    pub fn machine(self) -> ForthMachine<BufferConsole> {
        self.machine_with_keys(b"")
    }

    pub fn machine_with_keys(self, keys: &[u8]) -> ForthMachine<BufferConsole> {
        let config = self.config();
        self.machine_with(config, BufferConsole::with_keys(keys))
    }

    pub fn machine_with(
        self,
        config: MachineConfig,
        console: BufferConsole,
    ) -> ForthMachine<BufferConsole> {
        ForthMachine::with_console(self.finish(), config, console).unwrap()
    }
}

/// Per-process scratch file.
pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("snapforth-{}-{}", std::process::id(), name))
}

/// Code address the default table gives the primitive called `name`.
pub fn opcode(name: &str) -> u16 {
    let name = if name == "DOCOL" { ":" } else { name };
    match DEFAULT_OPCODES.iter().find(|(n, _, _)| *n == name) {
        Some((_, code, _)) => *code,
        None => panic!("no default opcode named {}", name),
    }
}
