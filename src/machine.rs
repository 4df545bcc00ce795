use std::path::{Path, PathBuf};

use crate::console::{Console, StdConsole};
use crate::dictionary::{find_entry, DictionaryIndex};
use crate::image::Snapshot;
use crate::opcode::{OpcodeTable, Primitive};
use crate::stack::Stack;
use crate::token::TokenSource;
use crate::ForthError;

pub const CELL: u16 = 2;
const FORTH_TRUE: u16 = 1;
const FORTH_FALSE: u16 = 0;
// KEY's answer when input comes from a source file.
const CARRIAGE_RETURN: u16 = 13;
// KEY's answer once the console has no more input.
const END_OF_INPUT: u16 = 0xffff;
const BLANK: u8 = b' ';

/// Fixed addresses of the snapshot family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Threaded-code cell executed first.
    pub entry: u16,
    /// Newest dictionary entry.
    pub latest: u16,
    /// Holds the parameter stack pointer.
    pub sp_var: u16,
    /// Holds the return stack pointer.
    pub rp_var: u16,
    /// Holds the user area base.
    pub up_var: u16,
    /// Holds the address tokens from a source file are written to.
    pub input_buffer_var: u16,
    /// Code field of the `WORD` secondary replaced by source file input.
    pub word_cfa: u16,
    /// SP above this is reported as a stack underflow.
    pub stack_high_water: u16,
    /// Resume address stored in the snapshot by BYE.
    pub warm_boot: u16,
    pub save_path: PathBuf,
    /// Give up building the dictionary index after this many entries.
    pub dictionary_limit: Option<usize>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            entry: 0x7099,
            latest: 0x9E4F,
            sp_var: 0x6112,
            rp_var: 0x6128,
            up_var: 0x6126,
            input_buffer_var: 0xBBB2,
            word_cfa: 0x6CE5,
            stack_high_water: 0xBB00,
            warm_boot: 0x6101,
            save_path: PathBuf::from("wl_save.sna"),
            dictionary_limit: None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Stop once the top-level word returns.
    SingleWord,
    /// Stop only on BYE.
    FreeRun,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MachineState {
    Running,
    Halted,
}

/// Anomalies seen while running. None of them stop the machine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub unknown_opcodes: u64,
    pub last_unknown: Option<u16>,
    pub stack_underflows: u64,
}

/// Inner and outer interpreter running directly on a snapshot.
pub struct ForthMachine<C = StdConsole> {
    image: Snapshot,
    config: MachineConfig,
    opcodes: OpcodeTable,
    dictionary: DictionaryIndex,
    source: Option<TokenSource>,
    console: C,
    // IP
    instruction_addr: u16,
    // W
    curr_def_addr: u16,
    // XT
    code_addr: u16,
    // Set by EXECUTE: the next cycle runs W instead of fetching from IP.
    execute_pending: bool,
    call_depth: i32,
    mode: RunMode,
    state: MachineState,
    diagnostics: Diagnostics,
}

impl ForthMachine<StdConsole> {
    pub fn new(image: Snapshot, config: MachineConfig) -> Result<Self, ForthError> {
        ForthMachine::with_console(image, config, StdConsole)
    }
}

impl<C: Console> ForthMachine<C> {
    pub fn with_console(
        image: Snapshot,
        config: MachineConfig,
        console: C,
    ) -> Result<Self, ForthError> {
        let dictionary = match config.dictionary_limit {
            None => DictionaryIndex::build(&image, config.latest),
            Some(limit) => DictionaryIndex::build_bounded(&image, config.latest, limit)?,
        };
        Ok(ForthMachine {
            instruction_addr: config.entry,
            image,
            config,
            opcodes: OpcodeTable::default(),
            dictionary,
            source: None,
            console,
            curr_def_addr: 0,
            code_addr: 0,
            execute_pending: false,
            call_depth: 0,
            mode: RunMode::FreeRun,
            state: MachineState::Running,
            diagnostics: Diagnostics::default(),
        })
    }

    pub fn with_opcodes(mut self, opcodes: OpcodeTable) -> Self {
        self.opcodes = opcodes;
        self
    }

    /// Take input from `source` until it runs out.
    pub fn set_source(&mut self, source: TokenSource) {
        self.source = Some(source);
    }

    pub fn load_source(&mut self, path: impl AsRef<Path>) -> Result<(), ForthError> {
        self.set_source(TokenSource::load(path)?);
        Ok(())
    }

    fn takes_file_input(&self) -> bool {
        self.source.as_ref().map_or(false, |s| !s.is_exhausted())
    }

    pub fn image(&self) -> &Snapshot {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Snapshot {
        &mut self.image
    }

    pub fn into_image(self) -> Snapshot {
        self.image
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn opcodes(&self) -> &OpcodeTable {
        &self.opcodes
    }

    pub fn dictionary(&self) -> &DictionaryIndex {
        &self.dictionary
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn instruction_addr(&self) -> u16 {
        self.instruction_addr
    }

    pub fn call_depth(&self) -> i32 {
        self.call_depth
    }

    pub fn data_stack(&mut self) -> Stack<'_> {
        Stack::new(&mut self.image, self.config.sp_var)
    }

    pub fn return_stack(&mut self) -> Stack<'_> {
        Stack::new(&mut self.image, self.config.rp_var)
    }

    /// Restart execution at the entry cell.
    pub fn reset(&mut self) {
        self.instruction_addr = self.config.entry;
        self.execute_pending = false;
        self.call_depth = 0;
        self.state = MachineState::Running;
    }

    /// Make the entry cell call `name` and restart there.
    pub fn prime_word(&mut self, name: &str) -> Result<(), ForthError> {
        let cfa = self
            .dictionary
            .code_field_of(name)
            .ok_or_else(|| ForthError::UnknownWord(name.to_string()))?;
        self.image.set_word(self.config.entry, cfa);
        self.reset();
        Ok(())
    }

    /// Push `input`, run `name` on its own and return what it left on the
    /// data stack, bottom first.
    pub fn run_word(&mut self, name: &str, input: &[u16]) -> Result<Vec<u16>, ForthError> {
        let base = self.data_stack().pointer();
        for val in input {
            self.data_stack().push(*val);
        }
        self.prime_word(name)?;
        self.run(RunMode::SingleWord)?;
        let mut elements = self.data_stack().elements(base);
        elements.reverse();
        Ok(elements)
    }

    /// Run until halted.
    pub fn run(&mut self, mode: RunMode) -> Result<(), ForthError> {
        self.mode = mode;
        while self.state == MachineState::Running {
            self.step()?;
        }
        tracing::debug!(ip = self.instruction_addr, ?mode, "halted");
        Ok(())
    }

    /// Execute a single fetch/dispatch cycle.
    pub fn step(&mut self) -> Result<MachineState, ForthError> {
        if self.state == MachineState::Halted {
            return Ok(self.state);
        }
        next(self);
        let maybe_primitive = self.opcodes.get(self.code_addr);
        if tracing::enabled!(tracing::Level::TRACE) {
            trace_cycle(self, maybe_primitive);
        }
        match maybe_primitive {
            Some(prim) => exec_primitive(self, prim)?,
            None => unknown_opcode(self),
        }
        if self.mode == RunMode::SingleWord && self.call_depth <= 0 && !self.execute_pending {
            self.state = MachineState::Halted;
        }
        let sp = self.data_stack().pointer();
        if sp > self.config.stack_high_water {
            self.diagnostics.stack_underflows += 1;
            tracing::warn!(sp, "stack underflow");
        }
        Ok(self.state)
    }
}

impl<C> std::fmt::Debug for ForthMachine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ForthMachine")
            .field("ip", &format_args!("{:#06x}", self.instruction_addr))
            .field("w", &format_args!("{:#06x}", self.curr_def_addr))
            .field("xt", &format_args!("{:#06x}", self.code_addr))
            .field("call_depth", &self.call_depth)
            .field("state", &self.state)
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

fn next(forth: &mut ForthMachine<impl Console>) {
    if forth.execute_pending {
        forth.execute_pending = false;
    } else {
        forth.curr_def_addr = forth.image.get_word(forth.instruction_addr);
        forth.instruction_addr = forth.instruction_addr.wrapping_add(CELL);
    }
    forth.code_addr = forth.image.get_word(forth.curr_def_addr);
}

fn trace_cycle(forth: &ForthMachine<impl Console>, maybe_primitive: Option<Primitive>) {
    let sp = forth.image.get_word(forth.config.sp_var);
    let name = match maybe_primitive {
        Some(Primitive::DoColon) => forth
            .dictionary
            .name_for_code(&forth.image, forth.curr_def_addr.wrapping_add(CELL))
            .map(|name| format!(":{}", name)),
        _ => forth.dictionary.name_for_code(&forth.image, forth.code_addr),
    };
    match name {
        Some(name) => tracing::trace!(depth = forth.call_depth, sp, "{}", name),
        None => tracing::trace!(depth = forth.call_depth, sp, "{:#06x}", forth.code_addr),
    }
}

fn unknown_opcode(forth: &mut ForthMachine<impl Console>) {
    let code = forth.code_addr;
    forth.diagnostics.unknown_opcodes += 1;
    forth.diagnostics.last_unknown = Some(code);
    match forth.dictionary.name_for_code(&forth.image, code) {
        Some(word) => tracing::warn!(code, %word, "unknown token"),
        None => tracing::warn!(code, "unknown token"),
    }
}

fn exec_primitive(forth: &mut ForthMachine<impl Console>, prim: Primitive) -> Result<(), ForthError> {
    match prim {
        Primitive::DoColon => docol(forth),
        Primitive::DoConstant => doconst(forth),
        Primitive::DoVariable => dovar(forth),
        Primitive::DoUser => douser(forth),
        Primitive::DoDoes => dodoes(forth),
        Primitive::Exit => exit_builtin(forth),
        Primitive::Dup => dup_builtin(forth),
        Primitive::Drop => drop_builtin(forth),
        Primitive::Swap => swap_builtin(forth),
        Primitive::Over => over_builtin(forth),
        Primitive::Rot => rot_builtin(forth),
        Primitive::TwoDup => two_dup_builtin(forth),
        Primitive::TwoFetch => two_fetch_builtin(forth),
        Primitive::TwoStore => two_store_builtin(forth),
        Primitive::ToR => to_rstack_builtin(forth),
        Primitive::FromR => from_rstack_builtin(forth),
        Primitive::SpFetch => sp_fetch_builtin(forth),
        Primitive::SpStore => sp_store_builtin(forth),
        Primitive::RpStore => rp_store_builtin(forth),
        Primitive::Add => add_builtin(forth),
        Primitive::Sub => sub_builtin(forth),
        Primitive::Minus => minus_builtin(forth),
        Primitive::UMul => umul_builtin(forth),
        Primitive::UDiv => udiv_builtin(forth),
        Primitive::DPlus => dplus_builtin(forth),
        Primitive::DMinus => dminus_builtin(forth),
        Primitive::SToD => s_to_d_builtin(forth),
        Primitive::Less => less_than_builtin(forth),
        Primitive::ZeroLess => zero_less_builtin(forth),
        Primitive::ZeroEqual => zero_eq_builtin(forth),
        Primitive::And => and_builtin(forth),
        Primitive::Or => or_builtin(forth),
        Primitive::Xor => xor_builtin(forth),
        Primitive::Toggle => toggle_builtin(forth),
        Primitive::Fetch => fetch_builtin(forth),
        Primitive::Store => store_builtin(forth),
        Primitive::CFetch => fetch_byte_builtin(forth),
        Primitive::CStore => store_byte_builtin(forth),
        Primitive::PlusStore => plus_store_builtin(forth),
        Primitive::Fill => fill_builtin(forth),
        Primitive::CMove => cmove_builtin(forth),
        Primitive::Lit => lit_builtin(forth),
        Primitive::Branch => branch_builtin(forth),
        Primitive::ZBranch => zbranch_builtin(forth),
        Primitive::Do => do_builtin(forth),
        Primitive::Loop => loop_step(forth, 1),
        Primitive::PlusLoop => {
            let step = forth.data_stack().pop();
            loop_step(forth, step)
        }
        Primitive::Leave => leave_builtin(forth),
        Primitive::I => loop_index_builtin(forth),
        Primitive::Execute => execute_builtin(forth),
        Primitive::Find => find_builtin(forth),
        Primitive::Digit => digit_builtin(forth),
        Primitive::Enclose => enclose_builtin(forth),
        Primitive::Constant(val) => forth.data_stack().push(val),
        Primitive::Emit => emit_builtin(forth),
        Primitive::Key => key_builtin(forth),
        Primitive::Cr => forth.console.newline(),
        // No break key on a headless console.
        Primitive::QueryTerminal => forth.data_stack().push(FORTH_FALSE),
        // Screen and sprite handling has no host counterpart.
        Primitive::Cls | Primitive::Relocate => {}
        Primitive::Bye => return bye_builtin(forth),
    }
    Ok(())
}

fn flag(cond: bool) -> u16 {
    if cond {
        FORTH_TRUE
    } else {
        FORTH_FALSE
    }
}

// DOCOL is the code field of every secondary. In file mode the WORD
// secondary is replaced by reading the token from the source directly.
fn docol(forth: &mut ForthMachine<impl Console>) {
    if forth.curr_def_addr == forth.config.word_cfa && forth.takes_file_input() {
        return word_from_source(forth);
    }
    let ret_addr = forth.instruction_addr;
    forth.return_stack().push(ret_addr);
    forth.instruction_addr = forth.curr_def_addr.wrapping_add(CELL);
    forth.call_depth += 1;
}

// ( delim -- )
// Writes the next token to the input buffer as a counted string followed by
// two blanks, the layout WORD itself produces.
fn word_from_source(forth: &mut ForthMachine<impl Console>) {
    let delim = forth.data_stack().pop() as u8;
    let token = match forth.source.as_mut() {
        Some(source) => source.get_token(delim),
        None => return,
    };
    let here = forth.image.get_word(forth.config.input_buffer_var);
    forth.image.set_byte(here, token.len() as u8);
    let mut addr = here.wrapping_add(1);
    for byte in token.iter().chain(&[BLANK, BLANK]) {
        forth.image.set_byte(addr, *byte);
        addr = addr.wrapping_add(1);
    }
}

fn exit_builtin(forth: &mut ForthMachine<impl Console>) {
    forth.instruction_addr = forth.return_stack().pop();
    forth.call_depth -= 1;
}

fn doconst(forth: &mut ForthMachine<impl Console>) {
    let val = forth.image.get_word(forth.curr_def_addr.wrapping_add(CELL));
    forth.data_stack().push(val);
}

fn dovar(forth: &mut ForthMachine<impl Console>) {
    let pfa = forth.curr_def_addr.wrapping_add(CELL);
    forth.data_stack().push(pfa);
}

// The parameter field holds a byte offset into the user area.
fn douser(forth: &mut ForthMachine<impl Console>) {
    let offset = forth.image.get_byte(forth.curr_def_addr.wrapping_add(CELL)) as u16;
    let up = forth.image.get_word(forth.config.up_var);
    forth.data_stack().push(up.wrapping_add(offset));
}

// | DODOES | body addr | data... Runs the high-level body with the data
// address on the stack.
fn dodoes(forth: &mut ForthMachine<impl Console>) {
    let ret_addr = forth.instruction_addr;
    forth.return_stack().push(ret_addr);
    let w = forth.curr_def_addr;
    forth.instruction_addr = forth.image.get_word(w.wrapping_add(CELL));
    forth.data_stack().push(w.wrapping_add(2 * CELL));
    forth.call_depth += 1;
}

fn dup_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let val = ds.pop();
    ds.push(val);
    ds.push(val);
}

fn drop_builtin(forth: &mut ForthMachine<impl Console>) {
    forth.data_stack().pop();
}

fn swap_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let a = ds.pop();
    let b = ds.pop();
    ds.push(a);
    ds.push(b);
}

fn over_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let a = ds.pop();
    let b = ds.pop();
    ds.push(b);
    ds.push(a);
    ds.push(b);
}

fn rot_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let a = ds.pop();
    let b = ds.pop();
    let c = ds.pop();
    ds.push(b);
    ds.push(a);
    ds.push(c);
}

fn two_dup_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let a = ds.pop();
    let b = ds.pop();
    ds.push(b);
    ds.push(a);
    ds.push(b);
    ds.push(a);
}

// ( addr -- d )
fn two_fetch_builtin(forth: &mut ForthMachine<impl Console>) {
    let addr = forth.data_stack().pop();
    let low = forth.image.get_word(addr.wrapping_add(CELL));
    let high = forth.image.get_word(addr);
    let mut ds = forth.data_stack();
    ds.push(low);
    ds.push(high);
}

// ( d addr -- )
fn two_store_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let addr = ds.pop();
    let high = ds.pop();
    let low = ds.pop();
    forth.image.set_word(addr, high);
    forth.image.set_word(addr.wrapping_add(CELL), low);
}

fn to_rstack_builtin(forth: &mut ForthMachine<impl Console>) {
    let val = forth.data_stack().pop();
    forth.return_stack().push(val);
}

fn from_rstack_builtin(forth: &mut ForthMachine<impl Console>) {
    let val = forth.return_stack().pop();
    forth.data_stack().push(val);
}

// Pushes the pointer as it was before the push.
fn sp_fetch_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let sp = ds.pointer();
    ds.push(sp);
}

// Empty the data stack: S0 lives at user area + 6.
fn sp_store_builtin(forth: &mut ForthMachine<impl Console>) {
    let up = forth.image.get_word(forth.config.up_var);
    let s0 = forth.image.get_word(up.wrapping_add(6));
    forth.data_stack().set_pointer(s0);
}

// Empty the return stack: R0 lives at user area + 8.
fn rp_store_builtin(forth: &mut ForthMachine<impl Console>) {
    let up = forth.image.get_word(forth.config.up_var);
    let r0 = forth.image.get_word(up.wrapping_add(8));
    forth.return_stack().set_pointer(r0);
}

fn add_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let a = ds.pop();
    let b = ds.pop();
    ds.push(b.wrapping_add(a));
}

fn sub_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let a = ds.pop();
    let b = ds.pop();
    ds.push(b.wrapping_sub(a));
}

fn minus_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let val = ds.pop() as i16;
    ds.push(val.wrapping_neg() as u16);
}

// ( u1 u2 -- ud )
fn umul_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let a = ds.pop() as u32;
    let b = ds.pop() as u32;
    ds.push_double(a * b);
}

// ( ud u1 -- rem quot )
// Division by zero answers 0xFFFF for both cells.
fn udiv_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let divisor = ds.pop() as u32;
    let dividend = ds.pop_double();
    if divisor == 0 {
        ds.push(0xffff);
        ds.push(0xffff);
    } else {
        ds.push((dividend % divisor) as u16);
        ds.push((dividend / divisor) as u16);
    }
}

fn dplus_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let a = ds.pop_double();
    let b = ds.pop_double();
    ds.push_double(b.wrapping_add(a));
}

fn dminus_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let d = ds.pop_double();
    ds.push_double(d.wrapping_neg());
}

fn s_to_d_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let val = ds.pop() as i16;
    ds.push_double(val as i32 as u32);
}

fn less_than_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let a = ds.pop() as i16;
    let b = ds.pop() as i16;
    ds.push(flag(b < a));
}

fn zero_less_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let val = ds.pop() as i16;
    ds.push(flag(val < 0));
}

fn zero_eq_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let val = ds.pop();
    ds.push(flag(val == 0));
}

fn and_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let a = ds.pop();
    let b = ds.pop();
    ds.push(a & b);
}

fn or_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let a = ds.pop();
    let b = ds.pop();
    ds.push(a | b);
}

fn xor_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let a = ds.pop();
    let b = ds.pop();
    ds.push(a ^ b);
}

// ( addr n -- )
fn toggle_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let mask = ds.pop();
    let addr = ds.pop();
    let val = forth.image.get_word(addr);
    forth.image.set_word(addr, val ^ mask);
}

fn fetch_builtin(forth: &mut ForthMachine<impl Console>) {
    let addr = forth.data_stack().pop();
    let val = forth.image.get_word(addr);
    forth.data_stack().push(val);
}

fn store_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let addr = ds.pop();
    let val = ds.pop();
    forth.image.set_word(addr, val);
}

fn fetch_byte_builtin(forth: &mut ForthMachine<impl Console>) {
    let addr = forth.data_stack().pop();
    let val = forth.image.get_byte(addr);
    forth.data_stack().push(val as u16);
}

fn store_byte_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let addr = ds.pop();
    let val = ds.pop();
    forth.image.set_byte(addr, val as u8);
}

// ( n addr -- )
fn plus_store_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let addr = ds.pop();
    let n = ds.pop();
    let val = forth.image.get_word(addr);
    forth.image.set_word(addr, val.wrapping_add(n));
}

// ( addr count byte -- )
fn fill_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let byte = ds.pop() as u8;
    let count = ds.pop();
    let addr = ds.pop();
    for i in 0..count {
        forth.image.set_byte(addr.wrapping_add(i), byte);
    }
}

// ( src dest count -- )
// Copies forwards one byte at a time, so an overlapping destination above
// the source repeats the leading bytes.
fn cmove_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let count = ds.pop();
    let dest = ds.pop();
    let src = ds.pop();
    for i in 0..count {
        let byte = forth.image.get_byte(src.wrapping_add(i));
        forth.image.set_byte(dest.wrapping_add(i), byte);
    }
}

fn lit_builtin(forth: &mut ForthMachine<impl Console>) {
    let val = forth.image.get_word(forth.instruction_addr);
    forth.instruction_addr = forth.instruction_addr.wrapping_add(CELL);
    forth.data_stack().push(val);
}

// The cell after BRANCH is a displacement relative to that cell.
fn branch_builtin(forth: &mut ForthMachine<impl Console>) {
    let offset = forth.image.get_word(forth.instruction_addr);
    forth.instruction_addr = forth.instruction_addr.wrapping_add(offset);
}

fn zbranch_builtin(forth: &mut ForthMachine<impl Console>) {
    if forth.data_stack().pop() != 0 {
        forth.instruction_addr = forth.instruction_addr.wrapping_add(CELL);
    } else {
        branch_builtin(forth);
    }
}

// ( limit start -- ) ( R: -- limit index )
fn do_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let index = ds.pop();
    let limit = ds.pop();
    let mut rs = forth.return_stack();
    rs.push(limit);
    rs.push(index);
}

// Index and limit compare unsigned.
fn loop_step(forth: &mut ForthMachine<impl Console>, step: u16) {
    let mut rs = forth.return_stack();
    let index = rs.peek(0).wrapping_add(step);
    let limit = rs.peek(1);
    if index < limit {
        rs.poke(0, index);
        branch_builtin(forth);
    } else {
        let rp = rs.pointer();
        rs.set_pointer(rp.wrapping_add(2 * CELL));
        forth.instruction_addr = forth.instruction_addr.wrapping_add(CELL);
    }
}

// The next loop test terminates.
fn leave_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut rs = forth.return_stack();
    let index = rs.peek(0);
    rs.poke(1, index);
}

fn loop_index_builtin(forth: &mut ForthMachine<impl Console>) {
    let index = forth.return_stack().peek(0);
    forth.data_stack().push(index);
}

fn execute_builtin(forth: &mut ForthMachine<impl Console>) {
    forth.curr_def_addr = forth.data_stack().pop();
    forth.execute_pending = true;
}

// ( c-addr root -- pfa flags 1 | 0 )
fn find_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let root = ds.pop();
    let name_addr = ds.pop();
    let len = forth.image.get_byte(name_addr) as u16;
    let name: Vec<u8> = (1..=len)
        .map(|i| forth.image.get_byte(name_addr.wrapping_add(i)))
        .collect();
    let found = find_entry(&forth.image, &name, root)
        .map(|entry| (entry.parameter_field_addr(), entry.flags()));
    let mut ds = forth.data_stack();
    match found {
        Some((pfa, flags)) => {
            ds.push(pfa);
            ds.push(flags as u16);
            ds.push(FORTH_TRUE);
        }
        None => ds.push(FORTH_FALSE),
    }
}

// ( c radix -- n 1 | 0 )
fn digit_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let radix = ds.pop();
    let c = ds.pop();
    let val = if (b'0' as u16..=b'9' as u16).contains(&c) {
        c - b'0' as u16
    } else if c >= b'A' as u16 {
        c - b'A' as u16 + 10
    } else {
        return ds.push(FORTH_FALSE);
    };
    if val < radix {
        ds.push(val);
        ds.push(FORTH_TRUE);
    } else {
        ds.push(FORTH_FALSE);
    }
}

// ( addr delim -- addr first delim-offset next-offset )
// The byte ending the delimiter run starts the text, whatever it is. The text
// then ends at the delimiter or at a 0 byte; the next offset only steps past
// a real delimiter.
fn enclose_builtin(forth: &mut ForthMachine<impl Console>) {
    let mut ds = forth.data_stack();
    let delim = ds.pop() as u8;
    let start = ds.pop();
    let image = &forth.image;
    let byte_at = |offset: u16| image.get_byte(start.wrapping_add(offset));
    let mut offset = 0u16;
    while byte_at(offset) == delim {
        offset = offset.wrapping_add(1);
    }
    let first = offset;
    let mut byte;
    loop {
        offset = offset.wrapping_add(1);
        byte = byte_at(offset);
        if byte == delim || byte == 0 {
            break;
        }
    }
    let next_offset = if byte == 0 {
        offset
    } else {
        offset.wrapping_add(1)
    };
    let mut ds = forth.data_stack();
    ds.push(start);
    ds.push(first);
    ds.push(offset);
    ds.push(next_offset);
}

fn emit_builtin(forth: &mut ForthMachine<impl Console>) {
    let c = forth.data_stack().pop() & 0x7f;
    forth.console.emit(c as u8);
}

fn key_builtin(forth: &mut ForthMachine<impl Console>) {
    let key = if forth.takes_file_input() {
        CARRIAGE_RETURN
    } else {
        match forth.console.read_key() {
            Some(b'\n') => BLANK as u16,
            Some(byte) => byte as u16,
            None => END_OF_INPUT,
        }
    };
    forth.data_stack().push(key);
}

// Store the warm start vector, persist the snapshot and stop.
fn bye_builtin(forth: &mut ForthMachine<impl Console>) -> Result<(), ForthError> {
    forth.image.set_stack(forth.config.warm_boot);
    forth.image.save(&forth.config.save_path)?;
    forth.state = MachineState::Halted;
    Ok(())
}

#[cfg(test)]
use crate::console::BufferConsole;
#[cfg(test)]
use crate::testimage::{temp_path, ImageBuilder, HEADER_SP, INPUT_BUFFER, RP0, SP0, USER_AREA};

#[cfg(test)]
fn run_word(forth: &mut ForthMachine<BufferConsole>, name: &str, input: &[u16]) -> Vec<u16> {
    forth.run_word(name, input).unwrap()
}

#[cfg(test)]
fn stacks_agree(name: &str, input: &[u16], expected: &[u16]) {
    let mut forth = ImageBuilder::with_primitives().machine();
    assert_eq!(run_word(&mut forth, name, input), expected, "{}", name);
}

#[test]
fn test_stack_primitives() {
    stacks_agree("DUP", &[5], &[5, 5]);
    stacks_agree("DUP", &[1, 2], &[1, 2, 2]);
    stacks_agree("DROP", &[1, 2], &[1]);
    stacks_agree("SWAP", &[1, 2], &[2, 1]);
    stacks_agree("OVER", &[1, 2], &[1, 2, 1]);
    stacks_agree("ROT", &[1, 2, 3], &[2, 3, 1]);
    stacks_agree("2DUP", &[1, 2], &[1, 2, 1, 2]);
}

#[test]
fn test_arithmetic_primitives() {
    stacks_agree("+", &[0xFFFF, 2], &[1]);
    stacks_agree("-", &[1, 2], &[0xFFFF]);
    stacks_agree("MINUS", &[5], &[(-5i16) as u16]);
    stacks_agree("MINUS", &[0x8000], &[0x8000]);
    stacks_agree("U*", &[0x1000, 0x10], &[0, 1]);
    stacks_agree("U*", &[0xFFFF, 0xFFFF], &[0x0001, 0xFFFE]);
    // ( low high divisor -- rem quot )
    stacks_agree("U/", &[100, 0, 1], &[0, 100]);
    stacks_agree("U/", &[100, 0, 7], &[2, 14]);
    stacks_agree("U/", &[0, 1, 2], &[0, 0x8000]);
    stacks_agree("U/", &[100, 0, 0], &[0xFFFF, 0xFFFF]);
    stacks_agree("D+", &[0xFFFF, 0, 1, 0], &[0, 1]);
    stacks_agree("DMINUS", &[1, 0], &[0xFFFF, 0xFFFF]);
    stacks_agree("S->D", &[0xFFFE], &[0xFFFE, 0xFFFF]);
    stacks_agree("S->D", &[7], &[7, 0]);
}

#[test]
fn test_comparison_and_bitwise_primitives() {
    stacks_agree("<", &[0xFFFF, 1], &[1]);
    stacks_agree("<", &[1, 0xFFFF], &[0]);
    stacks_agree("<", &[3, 3], &[0]);
    stacks_agree("0<", &[0x8000], &[1]);
    stacks_agree("0<", &[0], &[0]);
    stacks_agree("0=", &[0], &[1]);
    stacks_agree("0=", &[9], &[0]);
    stacks_agree("AND", &[0x0FF0, 0x00FF], &[0x00F0]);
    stacks_agree("OR", &[0x0F00, 0x00F0], &[0x0FF0]);
    stacks_agree("XOR", &[0x0FF0, 0x00FF], &[0x0F0F]);
}

#[test]
fn test_secondaries_with_branches() {
    let mut builder = ImageBuilder::with_primitives();
    let [two_dup, less, zbranch, swap, drop, dup, zero_less, minus] =
        ["2DUP", "<", "0BRANCH", "SWAP", "DROP", "DUP", "0<", "MINUS"].map(|n| builder.cfa(n));
    builder.secondary("MAX", &[two_dup, less, zbranch, 4, swap, drop]);
    builder.secondary("MIN", &[two_dup, swap, less, zbranch, 4, swap, drop]);
    builder.secondary("ABS", &[dup, zero_less, zbranch, 4, minus]);
    let mut forth = builder.machine();
    assert_eq!(run_word(&mut forth, "MAX", &[1, 0xFFFE]), [1]);
    assert_eq!(forth.call_depth(), 0);
    assert_eq!(run_word(&mut forth, "MAX", &[1, 2]), [2]);
    assert_eq!(run_word(&mut forth, "MAX", &[3, 7]), [7]);
    assert_eq!(run_word(&mut forth, "MIN", &[1, 0xFFFE]), [0xFFFE]);
    assert_eq!(run_word(&mut forth, "MIN", &[3, 7]), [3]);
    assert_eq!(run_word(&mut forth, "ABS", &[(-9i16) as u16]), [9]);
    assert_eq!(run_word(&mut forth, "ABS", &[9]), [9]);
    // The return stack is balanced after every run.
    assert_eq!(forth.return_stack().pointer(), RP0);
    assert_eq!(forth.diagnostics(), &Diagnostics::default());
}

#[test]
fn test_nested_secondaries() {
    let mut builder = ImageBuilder::with_primitives();
    let dup = builder.cfa("DUP");
    let add = builder.cfa("+");
    let double = builder.secondary("DOUBLE", &[dup, add]);
    builder.secondary("QUADRUPLE", &[double.cfa, double.cfa]);
    let mut forth = builder.machine();
    assert_eq!(run_word(&mut forth, "QUADRUPLE", &[3]), [12]);
    assert_eq!(forth.call_depth(), 0);
    assert_eq!(forth.return_stack().pointer(), RP0);
}

#[test]
fn test_branch_skips_cells() {
    let mut builder = ImageBuilder::with_primitives();
    let [lit, branch] = ["LIT", "BRANCH"].map(|n| builder.cfa(n));
    builder.secondary("SKIP", &[lit, 1, branch, 6, lit, 2, lit, 3]);
    let mut forth = builder.machine();
    assert_eq!(run_word(&mut forth, "SKIP", &[]), [1, 3]);
}

#[test]
fn test_memory_primitives() {
    let mut forth = ImageBuilder::with_primitives().machine();
    let addr = INPUT_BUFFER + 0x100;
    assert!(run_word(&mut forth, "!", &[0x1234, addr]).is_empty());
    assert_eq!(run_word(&mut forth, "@", &[addr]), [0x1234]);
    assert_eq!(run_word(&mut forth, "C@", &[addr]), [0x34]);
    run_word(&mut forth, "C!", &[0x1FF, addr + 1]);
    assert_eq!(forth.image().get_word(addr), 0xFF34);
    run_word(&mut forth, "+!", &[2, addr]);
    assert_eq!(forth.image().get_word(addr), 0xFF36);
    run_word(&mut forth, "TOGGLE", &[addr, 0x00FF]);
    assert_eq!(forth.image().get_word(addr), 0xFFC9);
    // ( low high addr -- ) stores the high cell first.
    run_word(&mut forth, "2!", &[0x5678, 0x1234, addr]);
    assert_eq!(forth.image().get_word(addr), 0x1234);
    assert_eq!(forth.image().get_word(addr + 2), 0x5678);
    assert_eq!(run_word(&mut forth, "2@", &[addr]), [0x5678, 0x1234]);
}

#[test]
fn test_fill_and_cmove() {
    let mut forth = ImageBuilder::with_primitives().machine();
    let addr = INPUT_BUFFER + 0x100;
    run_word(&mut forth, "FILL", &[addr, 4, b'*' as u16]);
    let read = |forth: &ForthMachine<BufferConsole>, len: u16| -> Vec<u8> {
        (0..len).map(|i| forth.image().get_byte(addr + i)).collect()
    };
    assert_eq!(read(&forth, 5), b"****\0");
    for (i, byte) in b"ABCD".iter().enumerate() {
        forth.image_mut().set_byte(addr + i as u16, *byte);
    }
    run_word(&mut forth, "CMOVE", &[addr, addr + 1, 0]);
    assert_eq!(read(&forth, 4), b"ABCD");
    // Overlapping forward copy repeats the first byte.
    run_word(&mut forth, "CMOVE", &[addr, addr + 1, 3]);
    assert_eq!(read(&forth, 4), b"AAAA");
}

#[test]
fn test_digit() {
    stacks_agree("DIGIT", &[b'7' as u16, 10], &[7, 1]);
    stacks_agree("DIGIT", &[b'F' as u16, 16], &[15, 1]);
    stacks_agree("DIGIT", &[b'G' as u16, 16], &[0]);
    stacks_agree("DIGIT", &[b'9' as u16, 8], &[0]);
    stacks_agree("DIGIT", &[b'/' as u16, 10], &[0]);
    stacks_agree("DIGIT", &[b':' as u16, 16], &[0]);
}

#[test]
fn test_enclose() {
    let mut forth = ImageBuilder::with_primitives().machine();
    let addr = INPUT_BUFFER + 0x100;
    let write = |forth: &mut ForthMachine<BufferConsole>, text: &[u8]| {
        for (i, byte) in text.iter().enumerate() {
            forth.image_mut().set_byte(addr + i as u16, *byte);
        }
    };
    write(&mut forth, b"  AB CD\0");
    assert_eq!(run_word(&mut forth, "ENCLOSE", &[addr, 32]), [addr, 2, 4, 5]);
    write(&mut forth, b"AB\0");
    assert_eq!(run_word(&mut forth, "ENCLOSE", &[addr, 32]), [addr, 0, 2, 2]);
    write(&mut forth, b" \0");
    assert_eq!(run_word(&mut forth, "ENCLOSE", &[addr, 32]), [addr, 1, 2, 2]);
    // A 0 byte ending the delimiter run is taken as text.
    write(&mut forth, b" \0X \0");
    assert_eq!(run_word(&mut forth, "ENCLOSE", &[addr, 32]), [addr, 1, 3, 4]);
}

#[test]
fn test_return_stack_transfer() {
    let mut builder = ImageBuilder::with_primitives();
    let [to_r, lit, from_r] = [">R", "LIT", "R>"].map(|n| builder.cfa(n));
    builder.secondary("TUCK5", &[to_r, lit, 5, from_r]);
    let mut forth = builder.machine();
    assert_eq!(run_word(&mut forth, "TUCK5", &[9]), [5, 9]);
    assert_eq!(forth.return_stack().pointer(), RP0);
}

#[test]
fn test_do_loop() {
    let mut builder = ImageBuilder::with_primitives();
    let [lit, do_, i, add, loop_] = ["LIT", "(DO)", "I", "+", "(LOOP)"].map(|n| builder.cfa(n));
    builder.secondary(
        "SUM",
        &[lit, 0, lit, 10, lit, 0, do_, i, add, loop_, (-6i16) as u16],
    );
    builder.secondary("INDICES", &[lit, 3, lit, 0, do_, i, loop_, (-4i16) as u16]);
    let mut forth = builder.machine();
    assert_eq!(run_word(&mut forth, "SUM", &[]), [45]);
    assert_eq!(forth.return_stack().pointer(), RP0);
    assert_eq!(run_word(&mut forth, "INDICES", &[]), [0, 1, 2]);
    assert_eq!(forth.return_stack().pointer(), RP0);
}

#[test]
fn test_loop_compares_unsigned() {
    let mut builder = ImageBuilder::with_primitives();
    let [lit, do_, i, loop_] = ["LIT", "(DO)", "I", "(LOOP)"].map(|n| builder.cfa(n));
    // Unsigned, -2 is already past a limit of 1.
    builder.secondary(
        "WRAP",
        &[lit, 1, lit, (-2i16) as u16, do_, i, loop_, (-4i16) as u16],
    );
    let mut forth = builder.machine();
    assert_eq!(run_word(&mut forth, "WRAP", &[]), [0xFFFE]);
}

#[test]
fn test_leave() {
    let mut builder = ImageBuilder::with_primitives();
    let [lit, do_, i, sub, zero_eq, zbranch, leave, loop_] =
        ["LIT", "(DO)", "I", "-", "0=", "0BRANCH", "LEAVE", "(LOOP)"].map(|n| builder.cfa(n));
    builder.secondary(
        "UPTO3",
        &[
            lit, 10, lit, 0, do_, i, i, lit, 3, sub, zero_eq, zbranch, 4, leave, loop_,
            (-20i16) as u16,
        ],
    );
    let mut forth = builder.machine();
    assert_eq!(run_word(&mut forth, "UPTO3", &[]), [0, 1, 2, 3]);
    assert_eq!(forth.return_stack().pointer(), RP0);
}

#[test]
fn test_plus_loop_from_custom_table() {
    const PLUS_LOOP: u16 = 0x6200;
    let mut builder = ImageBuilder::with_primitives();
    builder.primitive("(+LOOP)", PLUS_LOOP);
    let [lit, do_, i, plus_loop] = ["LIT", "(DO)", "I", "(+LOOP)"].map(|n| builder.cfa(n));
    builder.secondary(
        "BY3",
        &[lit, 10, lit, 0, do_, i, lit, 3, plus_loop, (-8i16) as u16],
    );
    let mut opcodes = OpcodeTable::default();
    opcodes.insert(PLUS_LOOP, Primitive::PlusLoop);
    let mut forth = builder.machine().with_opcodes(opcodes);
    assert_eq!(run_word(&mut forth, "BY3", &[]), [0, 3, 6, 9]);
    assert_eq!(forth.return_stack().pointer(), RP0);
}

#[test]
fn test_execute() {
    let mut builder = ImageBuilder::with_primitives();
    let [dup, add, lit, execute] = ["DUP", "+", "LIT", "EXECUTE"].map(|n| builder.cfa(n));
    let double = builder.secondary("DOUBLE", &[dup, add]);
    builder.secondary("TWICE", &[lit, double.cfa, execute, lit, double.cfa, execute]);
    let mut forth = builder.machine();
    assert_eq!(run_word(&mut forth, "TWICE", &[3]), [12]);
    // A top-level EXECUTE still runs its target before halting.
    assert_eq!(run_word(&mut forth, "EXECUTE", &[3, dup]), [3, 3]);
    assert_eq!(run_word(&mut forth, "EXECUTE", &[5, double.cfa]), [10]);
    assert_eq!(forth.call_depth(), 0);
}

#[test]
fn test_defined_word_runtimes() {
    let mut builder = ImageBuilder::with_primitives();
    builder.constant("TEN", 10);
    let var = builder.variable("COUNTER", 7);
    builder.user("BASE", 0x10);
    let fetch = builder.cfa("@");
    let exit = builder.cfa(";S");
    let body = builder.cells(&[fetch, exit]);
    let does = builder.does("SEVEN", body, &[7]);
    let mut forth = builder.machine();
    assert_eq!(run_word(&mut forth, "TEN", &[]), [10]);
    assert_eq!(run_word(&mut forth, "COUNTER", &[]), [var.pfa]);
    assert_eq!(run_word(&mut forth, "BASE", &[]), [USER_AREA + 0x10]);
    assert_eq!(run_word(&mut forth, "SEVEN", &[]), [7]);
    assert_eq!(forth.image().get_word(does.pfa + 2), 7);
    assert_eq!(forth.call_depth(), 0);
    assert_eq!(forth.return_stack().pointer(), RP0);
    assert_eq!(run_word(&mut forth, "NEW", &[]), [0x9E5E]);
}

#[test]
fn test_find() {
    let mut builder = ImageBuilder::with_primitives();
    let dup_pfa = builder.cfa("DUP") + 2;
    let found_name = builder.counted(b"DUP");
    let missing_name = builder.counted(b"NOPE");
    let latest = builder.latest();
    let mut forth = builder.machine();
    assert_eq!(
        run_word(&mut forth, "(FIND)", &[found_name, latest]),
        [dup_pfa, 0x83, 1]
    );
    assert_eq!(run_word(&mut forth, "(FIND)", &[missing_name, latest]), [0]);
}

#[test]
fn test_unknown_opcode_is_not_fatal() {
    let mut builder = ImageBuilder::with_primitives();
    let mystery = builder.primitive("MYSTERY", 0x1234);
    let dup = builder.cfa("DUP");
    builder.secondary("PROBE", &[mystery.cfa, dup]);
    let mut forth = builder.machine();
    let base = forth.data_stack().pointer();
    forth.data_stack().push(4);
    forth.prime_word("PROBE").unwrap();
    forth.mode = RunMode::SingleWord;
    assert_eq!(forth.step().unwrap(), MachineState::Running);
    assert_eq!(forth.call_depth(), 1);
    assert_eq!(forth.step().unwrap(), MachineState::Running);
    assert_eq!(forth.diagnostics().unknown_opcodes, 1);
    assert_eq!(forth.diagnostics().last_unknown, Some(0x1234));
    assert_eq!(forth.step().unwrap(), MachineState::Running);
    assert_eq!(forth.step().unwrap(), MachineState::Halted);
    assert_eq!(forth.step().unwrap(), MachineState::Halted);
    assert_eq!(forth.data_stack().elements(base), [4, 4]);
}

#[test]
fn test_stack_underflow_is_reported() {
    let mut forth = ImageBuilder::with_primitives().machine();
    assert!(run_word(&mut forth, "DROP", &[]).is_empty());
    assert_eq!(forth.diagnostics().stack_underflows, 1);
    assert_eq!(forth.data_stack().pointer(), SP0 + 2);
    assert_eq!(forth.state(), MachineState::Halted);
}

#[test]
fn test_stack_pointer_primitives() {
    let mut forth = ImageBuilder::with_primitives().machine();
    assert_eq!(run_word(&mut forth, "SP@", &[5]), [5, SP0 - 2]);
    assert!(run_word(&mut forth, "SP!", &[1, 2, 3]).is_empty());
    assert_eq!(forth.data_stack().pointer(), SP0);
    forth.return_stack().push(0x1111);
    forth.return_stack().push(0x2222);
    run_word(&mut forth, "RP!", &[]);
    assert_eq!(forth.return_stack().pointer(), RP0);
}

#[test]
fn test_console_io() {
    let mut forth = ImageBuilder::with_primitives().machine_with_keys(b"x\n");
    run_word(&mut forth, "EMIT", &[b'O' as u16]);
    // The high bit marks the end of a name and is never printed.
    run_word(&mut forth, "EMITC", &[b'K' as u16 | 0x80]);
    run_word(&mut forth, "CR", &[]);
    assert_eq!(forth.console().output_str(), "OK\n");
    assert_eq!(run_word(&mut forth, "KEY", &[]), [b'x' as u16]);
    assert_eq!(run_word(&mut forth, "KEY", &[]), [b' ' as u16]);
    assert_eq!(run_word(&mut forth, "KEY", &[]), [END_OF_INPUT]);
    assert_eq!(run_word(&mut forth, "?TERMINAL", &[]), [0]);
    assert!(run_word(&mut forth, "CLS", &[]).is_empty());
    assert!(run_word(&mut forth, "RELOCATE", &[]).is_empty());
}

#[test]
fn test_word_reads_from_source() {
    let mut builder = ImageBuilder::with_primitives();
    let word = builder.secondary("WORD", &[]);
    let lit = builder.cfa("LIT");
    builder.secondary("BL-WORD", &[lit, 32, word.cfa]);
    let config = MachineConfig {
        word_cfa: word.cfa,
        ..builder.config()
    };
    let mut forth = builder.machine_with(config, BufferConsole::with_keys(b"z"));
    forth.set_source(TokenSource::new("HELLO\n  WORLD"));
    let buffer = |forth: &ForthMachine<BufferConsole>, len: u16| -> Vec<u8> {
        (0..len).map(|i| forth.image().get_byte(INPUT_BUFFER + i)).collect()
    };
    // Source input answers KEY with a carriage return.
    assert_eq!(run_word(&mut forth, "KEY", &[]), [13]);
    assert!(run_word(&mut forth, "BL-WORD", &[]).is_empty());
    assert_eq!(buffer(&forth, 8), b"\x05HELLO  ");
    assert!(run_word(&mut forth, "WORD", &[32]).is_empty());
    assert_eq!(buffer(&forth, 8), b"\x05WORLD  ");
    assert_eq!(forth.return_stack().pointer(), RP0);
    // With the source used up WORD runs its own definition again.
    assert_eq!(run_word(&mut forth, "BL-WORD", &[]), [32]);
    assert_eq!(run_word(&mut forth, "KEY", &[]), [b'z' as u16]);
}

#[test]
fn test_bye_saves_snapshot() {
    let path = temp_path("bye.sna");
    let mut builder = ImageBuilder::with_primitives();
    let [lit, add, bye] = ["LIT", "+", "BYE"].map(|n| builder.cfa(n));
    builder.secondary("GO", &[lit, 1, lit, 2, add, bye]);
    let config = MachineConfig {
        save_path: path.clone(),
        ..builder.config()
    };
    let mut forth = builder.machine_with(config, BufferConsole::default());
    forth.prime_word("GO").unwrap();
    forth.run(RunMode::FreeRun).unwrap();
    assert_eq!(forth.state(), MachineState::Halted);
    let saved = Snapshot::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(&saved, forth.image());
    assert_eq!(saved.get_word(HEADER_SP), 0x6101);
    let sp = saved.get_word(forth.config().sp_var);
    assert_eq!(sp, SP0 - 2);
    assert_eq!(saved.get_word(sp), 3);
}

#[test]
fn test_bye_reports_unwritable_path() {
    let builder = ImageBuilder::with_primitives();
    let config = MachineConfig {
        save_path: PathBuf::from("/nonexistent-dir/wl_save.sna"),
        ..builder.config()
    };
    let mut forth = builder.machine_with(config, BufferConsole::default());
    forth.prime_word("BYE").unwrap();
    assert!(matches!(
        forth.run(RunMode::SingleWord),
        Err(ForthError::Io { .. })
    ));
}

#[test]
fn test_prime_unknown_word() {
    let mut forth = ImageBuilder::with_primitives().machine();
    assert!(matches!(
        forth.prime_word("NO-SUCH-WORD"),
        Err(ForthError::UnknownWord(name)) if name == "NO-SUCH-WORD"
    ));
}

#[test]
fn test_dictionary_limit() {
    let builder = ImageBuilder::with_primitives();
    let config = MachineConfig {
        dictionary_limit: Some(3),
        ..builder.config()
    };
    let image = builder.finish();
    assert!(matches!(
        ForthMachine::with_console(image.clone(), config.clone(), BufferConsole::default()),
        Err(ForthError::DictionaryTooLong { limit: 3 })
    ));
    let config = MachineConfig {
        dictionary_limit: Some(1000),
        ..config
    };
    let forth = ForthMachine::with_console(image, config, BufferConsole::default()).unwrap();
    assert_eq!(forth.dictionary().len(), DEFAULT_PRIMITIVE_ENTRIES);
}

#[cfg(test)]
const DEFAULT_PRIMITIVE_ENTRIES: usize = crate::opcode::DEFAULT_OPCODES.len() - 5;

#[test]
fn test_trace_names_words() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .finish();
    let mut builder = ImageBuilder::with_primitives();
    let dup = builder.cfa("DUP");
    builder.secondary("TWIN", &[dup]);
    let mut forth = builder.machine();
    let stack = tracing::subscriber::with_default(subscriber, || run_word(&mut forth, "TWIN", &[8]));
    assert_eq!(stack, [8, 8]);
}

#[test]
fn test_empty_source_is_read_once() {
    let mut builder = ImageBuilder::with_primitives();
    let word = builder.secondary("WORD", &[]);
    let config = MachineConfig {
        word_cfa: word.cfa,
        ..builder.config()
    };
    let mut forth = builder.machine_with(config, BufferConsole::default());
    forth.image_mut().set_byte(INPUT_BUFFER, 9);
    forth.set_source(TokenSource::new(""));
    assert!(run_word(&mut forth, "WORD", &[32]).is_empty());
    assert_eq!(forth.image().get_byte(INPUT_BUFFER), 0);
    assert_eq!(forth.image().get_byte(INPUT_BUFFER + 1), b' ');
    assert_eq!(run_word(&mut forth, "WORD", &[32]), [32]);
}
