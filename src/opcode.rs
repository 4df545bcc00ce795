use std::collections::HashMap;

/// Behaviours the engine can dispatch to.
///
/// A code field address selects one of these through an `OpcodeTable`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Primitive {
    // Code field runtimes
    DoColon,
    DoConstant,
    DoVariable,
    DoUser,
    DoDoes,
    Exit,
    // Stack manipulation
    Dup,
    Drop,
    Swap,
    Over,
    Rot,
    TwoDup,
    TwoFetch,
    TwoStore,
    ToR,
    FromR,
    SpFetch,
    SpStore,
    RpStore,
    // Arithmetic
    Add,
    Sub,
    Minus,
    UMul,
    UDiv,
    DPlus,
    DMinus,
    SToD,
    // Comparison
    Less,
    ZeroLess,
    ZeroEqual,
    // Bitwise
    And,
    Or,
    Xor,
    Toggle,
    // Memory
    Fetch,
    Store,
    CFetch,
    CStore,
    PlusStore,
    Fill,
    CMove,
    // Control flow
    Lit,
    Branch,
    ZBranch,
    Do,
    Loop,
    PlusLoop,
    Leave,
    I,
    Execute,
    // Outer interpreter
    Find,
    Digit,
    Enclose,
    /// Push a fixed value.
    Constant(u16),
    // Input/output
    Emit,
    Key,
    Cr,
    QueryTerminal,
    Cls,
    Relocate,
    Bye,
}

/// Code field addresses of the snapshot family this engine was built for.
pub const DEFAULT_OPCODES: [(&str, u16, Primitive); 61] = [
    // Code field runtimes
    (":", 0x6611, Primitive::DoColon),
    ("CONSTANT", 0x6653, Primitive::DoConstant),
    ("VARIABLE", 0x666D, Primitive::DoVariable),
    ("USER", 0x667F, Primitive::DoUser),
    ("DOES>", 0x6ACC, Primitive::DoDoes),
    (";S", 0x6449, Primitive::Exit),
    // Stack manipulation
    ("DUP", 0x6558, Primitive::Dup),
    ("DROP", 0x653E, Primitive::Drop),
    ("SWAP", 0x654B, Primitive::Swap),
    ("OVER", 0x652F, Primitive::Over),
    ("ROT", 0x68B3, Primitive::Rot),
    ("2DUP", 0x6566, Primitive::TwoDup),
    ("2@", 0x65B6, Primitive::TwoFetch),
    ("2!", 0x65EC, Primitive::TwoStore),
    (">R", 0x6474, Primitive::ToR),
    ("R>", 0x648A, Primitive::FromR),
    ("SP@", 0x63FD, Primitive::SpFetch),
    ("SP!", 0x640C, Primitive::SpStore),
    ("RP!", 0x6431, Primitive::RpStore),
    // Arithmetic
    ("+", 0x64CB, Primitive::Add),
    ("-", 0x6849, Primitive::Sub),
    ("MINUS", 0x64FB, Primitive::Minus),
    ("U*", 0x633C, Primitive::UMul),
    ("U/", 0x6371, Primitive::UDiv),
    ("D+", 0x64D8, Primitive::DPlus),
    ("DMINUS", 0x6511, Primitive::DMinus),
    ("S->D", 0x70F5, Primitive::SToD),
    // Comparison
    ("<", 0x6863, Primitive::Less),
    ("0<", 0x64B9, Primitive::ZeroLess),
    ("0=", 0x64A5, Primitive::ZeroEqual),
    // Bitwise
    ("AND", 0x63C5, Primitive::And),
    ("OR", 0x63D7, Primitive::Or),
    ("XOR", 0x63EA, Primitive::Xor),
    ("TOGGLE", 0x658B, Primitive::Toggle),
    // Memory
    ("@", 0x6599, Primitive::Fetch),
    ("!", 0x65D0, Primitive::Store),
    ("C@", 0x65A8, Primitive::CFetch),
    ("C!", 0x65DF, Primitive::CStore),
    ("+!", 0x6574, Primitive::PlusStore),
    ("FILL", 0x6C7C, Primitive::Fill),
    ("CMOVE", 0x631F, Primitive::CMove),
    // Control flow
    ("LIT", 0x6158, Primitive::Lit),
    ("BRANCH", 0x617C, Primitive::Branch),
    ("0BRANCH", 0x6194, Primitive::ZBranch),
    ("(DO)", 0x61F1, Primitive::Do),
    ("(LOOP)", 0x61AA, Primitive::Loop),
    ("LEAVE", 0x6460, Primitive::Leave),
    ("I", 0x620D, Primitive::I),
    ("EXECUTE", 0x616D, Primitive::Execute),
    // Outer interpreter
    ("(FIND)", 0x624F, Primitive::Find),
    ("DIGIT", 0x6221, Primitive::Digit),
    ("ENCLOSE", 0x629E, Primitive::Enclose),
    ("NEW", 0x74DD, Primitive::Constant(0x9E5E)),
    // Input/output
    ("EMIT", 0x7652, Primitive::Emit),
    ("EMITC", 0x75BC, Primitive::Emit),
    ("KEY", 0x62F4, Primitive::Key),
    ("CR", 0x6312, Primitive::Cr),
    ("?TERMINAL", 0x6305, Primitive::QueryTerminal),
    ("CLS", 0x9308, Primitive::Cls),
    ("RELOCATE", 0x87F4, Primitive::Relocate),
    ("BYE", 0x798D, Primitive::Bye),
];

/// Maps code field contents to primitives.
///
/// Any address missing from the table is an unknown opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcodeTable {
    primitives: HashMap<u16, Primitive>,
}

impl OpcodeTable {
    pub fn empty() -> Self {
        OpcodeTable {
            primitives: HashMap::new(),
        }
    }

    /// Map `addr` to `prim`, returning the primitive it replaced.
    pub fn insert(&mut self, addr: u16, prim: Primitive) -> Option<Primitive> {
        self.primitives.insert(addr, prim)
    }

    pub fn remove(&mut self, addr: u16) -> Option<Primitive> {
        self.primitives.remove(&addr)
    }

    pub fn get(&self, addr: u16) -> Option<Primitive> {
        self.primitives.get(&addr).copied()
    }

    /// Address of the first mapping to `prim`, if any.
    pub fn addr_of(&self, prim: Primitive) -> Option<u16> {
        self.primitives
            .iter()
            .filter(|(_, p)| **p == prim)
            .map(|(addr, _)| *addr)
            .min()
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }
}

impl Default for OpcodeTable {
    fn default() -> Self {
        DEFAULT_OPCODES
            .iter()
            .map(|(_, addr, prim)| (*addr, *prim))
            .collect()
    }
}

impl FromIterator<(u16, Primitive)> for OpcodeTable {
    fn from_iter<I: IntoIterator<Item = (u16, Primitive)>>(iter: I) -> Self {
        OpcodeTable {
            primitives: iter.into_iter().collect(),
        }
    }
}

#[test]
fn test_default_opcodes_are_unique() {
    let table = OpcodeTable::default();
    assert_eq!(table.len(), DEFAULT_OPCODES.len());
    assert_eq!(table.get(0x6558), Some(Primitive::Dup));
    assert_eq!(table.get(0x74DD), Some(Primitive::Constant(0x9E5E)));
    assert_eq!(table.get(0x6CE5), None);
    assert_eq!(table.addr_of(Primitive::DoColon), Some(0x6611));
    assert_eq!(table.addr_of(Primitive::PlusLoop), None);
    // EMIT and EMITC share one behaviour.
    assert_eq!(table.addr_of(Primitive::Emit), Some(0x75BC));
}

#[test]
fn test_opcode_table_override() {
    let mut table = OpcodeTable::default();
    assert_eq!(table.insert(0x6558, Primitive::Drop), Some(Primitive::Dup));
    assert_eq!(table.insert(0x1000, Primitive::PlusLoop), None);
    assert_eq!(table.get(0x6558), Some(Primitive::Drop));
    assert_eq!(table.remove(0x1000), Some(Primitive::PlusLoop));
    assert_eq!(table.get(0x1000), None);
    let custom: OpcodeTable = [(0x10, Primitive::Exit)].into_iter().collect();
    assert_eq!(custom.len(), 1);
    assert!(OpcodeTable::empty().is_empty());
}
