use std::collections::HashMap;

use crate::image::Snapshot;
use crate::ForthError;

// Mask for the name length inside the length|flags byte.
pub const NAME_LEN_MASK: u8 = 0x1f;
// Every stored name character carries a flag in its high bit.
const NAME_CHAR_MASK: u8 = 0x7f;

/// Entry in the snapshot's dictionary.
///
/// Memory layout of an entry is the following.
///
/// | flags|len: u8 | name: bytes | link: cell | code field: cell | parameter field...
///
/// The link points at the previous entry, 0 ends the chain. The code field
/// holds the address which identifies how the entry executes.
#[derive(Copy, Clone)]
pub struct DictEntryRef<'a> {
    image: &'a Snapshot,
    /// Address of the length|flags byte.
    addr: u16,
}

impl<'a> DictEntryRef<'a> {
    pub fn new(image: &'a Snapshot, addr: u16) -> Self {
        DictEntryRef { image, addr }
    }

    pub fn addr(&self) -> u16 {
        self.addr
    }

    fn flags_and_name_len(&self) -> u8 {
        self.image.get_byte(self.addr)
    }

    pub fn name_len(&self) -> u8 {
        self.flags_and_name_len() & NAME_LEN_MASK
    }

    /// The raw length|flags byte, as (FIND) reports it.
    pub fn flags(&self) -> u8 {
        self.flags_and_name_len()
    }

    fn name_bytes(&self) -> impl Iterator<Item = u8> + 'a {
        let image = self.image;
        let start = self.addr.wrapping_add(1);
        (0..self.name_len() as u16).map(move |i| image.get_byte(start.wrapping_add(i)) & NAME_CHAR_MASK)
    }

    pub fn name(&self) -> String {
        self.name_bytes().map(char::from).collect()
    }

    pub fn name_eq(&self, name: &[u8]) -> bool {
        self.name_len() as usize == name.len() && self.name_bytes().eq(name.iter().copied())
    }

    pub fn link_addr(&self) -> u16 {
        self.addr.wrapping_add(self.name_len() as u16 + 1)
    }

    pub fn prev(&self) -> Option<DictEntryRef<'a>> {
        match self.image.get_word(self.link_addr()) {
            0 => None,
            prev => Some(DictEntryRef::new(self.image, prev)),
        }
    }

    pub fn code_field_addr(&self) -> u16 {
        self.addr.wrapping_add(self.name_len() as u16 + 3)
    }

    pub fn parameter_field_addr(&self) -> u16 {
        self.code_field_addr().wrapping_add(2)
    }

    /// Contents of the code field.
    pub fn code(&self) -> u16 {
        self.image.get_word(self.code_field_addr())
    }
}

impl std::fmt::Debug for DictEntryRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "DictEntryRef {{ addr: {:#06x}, name: {}, flags: {:#x}, cfa: {:#06x}, code: {:#06x} }}",
            self.addr,
            self.name(),
            self.flags(),
            self.code_field_addr(),
            self.code(),
        )
    }
}

/// Scan the chain starting at `root` for an entry named `name`.
///
/// Names compare case sensitively against the decoded (high bit stripped)
/// characters.
pub fn find_entry<'a>(image: &'a Snapshot, name: &[u8], root: u16) -> Option<DictEntryRef<'a>> {
    let mut maybe_entry = match root {
        0 => None,
        root => Some(DictEntryRef::new(image, root)),
    };
    while let Some(entry) = maybe_entry {
        if entry.name_eq(name) {
            return maybe_entry;
        }
        maybe_entry = entry.prev();
    }
    None
}

/// Lookup tables derived from the dictionary chain.
#[derive(Debug, Default, Clone)]
pub struct DictionaryIndex {
    // Keyed by the address following the code field, which is what a
    // primitive's code field points at.
    by_code: HashMap<u16, u16>,
    by_name: HashMap<String, u16>,
    // Newest first.
    entries: Vec<u16>,
}

impl DictionaryIndex {
    /// Walk the chain from `latest` until a zero link.
    ///
    /// The chain is trusted: a cycle never terminates.
    pub fn build(image: &Snapshot, latest: u16) -> Self {
        let mut index = DictionaryIndex::default();
        let mut maybe_entry = (latest != 0).then(|| DictEntryRef::new(image, latest));
        while let Some(entry) = maybe_entry {
            index.record(entry);
            maybe_entry = entry.prev();
        }
        tracing::debug!(entries = index.entries.len(), latest, "built dictionary index");
        index
    }

    /// Like `build`, but fails once more than `limit` entries were visited.
    pub fn build_bounded(image: &Snapshot, latest: u16, limit: usize) -> Result<Self, ForthError> {
        let mut index = DictionaryIndex::default();
        let mut maybe_entry = (latest != 0).then(|| DictEntryRef::new(image, latest));
        while let Some(entry) = maybe_entry {
            if index.entries.len() == limit {
                return Err(ForthError::DictionaryTooLong { limit });
            }
            index.record(entry);
            maybe_entry = entry.prev();
        }
        tracing::debug!(entries = index.entries.len(), latest, "built dictionary index");
        Ok(index)
    }

    fn record(&mut self, entry: DictEntryRef) {
        let cfa = entry.code_field_addr();
        self.by_code.insert(cfa.wrapping_add(2), entry.addr());
        // Walking newest to oldest, so the oldest definition of a name stays.
        self.by_name.insert(entry.name(), cfa);
        self.entries.push(entry.addr());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry addresses, newest first.
    pub fn entries(&self) -> &[u16] {
        &self.entries
    }

    /// Code field address of the oldest entry called `name`.
    pub fn code_field_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    /// Entry whose code field immediately precedes `code`.
    pub fn entry_for_code(&self, code: u16) -> Option<u16> {
        self.by_code.get(&code).copied()
    }

    pub fn name_for_code(&self, image: &Snapshot, code: u16) -> Option<String> {
        self.entry_for_code(code)
            .map(|entry| DictEntryRef::new(image, entry).name())
    }
}

#[cfg(test)]
use crate::testimage::ImageBuilder;

#[test]
fn test_dict_entry_layout() {
    let mut builder = ImageBuilder::new();
    let dup = builder.primitive("DUP", 0x6558);
    let image = builder.finish();
    let entry = DictEntryRef::new(&image, dup.nfa);
    assert_eq!(entry.name(), "DUP");
    assert_eq!(entry.name_len(), 3);
    assert_eq!(entry.code_field_addr(), dup.nfa + 3 + 3);
    assert_eq!(entry.parameter_field_addr(), dup.nfa + 3 + 5);
    assert_eq!(entry.code(), 0x6558);
    assert!(entry.prev().is_none());
}

#[test]
fn test_dict_entry_name_strips_high_bit() {
    let mut builder = ImageBuilder::new();
    let swap = builder.primitive("SWAP", 0x654B);
    let image = builder.finish();
    // The builder sets the high bit on the last name character, like the
    // snapshot's own entries.
    assert_eq!(image.get_byte(swap.nfa + 4), b'P' | 0x80);
    assert_eq!(DictEntryRef::new(&image, swap.nfa).name(), "SWAP");
}

#[test]
fn test_dictionary_index() {
    let mut builder = ImageBuilder::new();
    let dup = builder.primitive("DUP", 0x6558);
    let drop = builder.primitive("DROP", 0x653E);
    let dup2 = builder.primitive("DUP", 0x1234);
    let latest = builder.latest();
    let image = builder.finish();
    let index = DictionaryIndex::build(&image, latest);
    assert_eq!(index.len(), 3);
    assert_eq!(index.entries(), &[dup2.nfa, drop.nfa, dup.nfa]);
    assert_eq!(index.code_field_of("DROP"), Some(drop.cfa));
    // The oldest definition is the one found by name.
    assert_eq!(index.code_field_of("DUP"), Some(dup.cfa));
    assert_ne!(dup.cfa, dup2.cfa);
    assert_eq!(index.code_field_of("dup"), None);
    assert_eq!(index.entry_for_code(drop.cfa + 2), Some(drop.nfa));
    assert_eq!(
        index.name_for_code(&image, dup.cfa + 2).as_deref(),
        Some("DUP")
    );
    assert_eq!(index.name_for_code(&image, 0x6558), None);
}

#[test]
fn test_dictionary_index_bounded() {
    let mut builder = ImageBuilder::new();
    builder.primitive("DUP", 0x6558);
    builder.primitive("DROP", 0x653E);
    let latest = builder.latest();
    let mut image = builder.finish();
    assert_eq!(
        DictionaryIndex::build_bounded(&image, latest, 2).unwrap().len(),
        2
    );
    assert!(matches!(
        DictionaryIndex::build_bounded(&image, latest, 1),
        Err(ForthError::DictionaryTooLong { limit: 1 })
    ));
    // Point the newest entry's link at itself.
    let entry = DictEntryRef::new(&image, latest);
    let link = entry.link_addr();
    image.set_word(link, latest);
    assert!(matches!(
        DictionaryIndex::build_bounded(&image, latest, 100),
        Err(ForthError::DictionaryTooLong { limit: 100 })
    ));
}

#[test]
fn test_find_entry() {
    let mut builder = ImageBuilder::new();
    let dup = builder.primitive("DUP", 0x6558);
    let over = builder.primitive("OVER", 0x652F);
    let latest = builder.latest();
    let image = builder.finish();
    let found = find_entry(&image, b"DUP", latest).unwrap();
    assert_eq!(found.addr(), dup.nfa);
    assert_eq!(found.parameter_field_addr(), dup.nfa + 3 + 5);
    assert_eq!(find_entry(&image, b"OVER", latest).unwrap().addr(), over.nfa);
    assert!(find_entry(&image, b"OVE", latest).is_none());
    assert!(find_entry(&image, b"over", latest).is_none());
    // Searching from an older root never sees newer entries.
    assert!(find_entry(&image, b"OVER", dup.nfa).is_none());
    assert!(find_entry(&image, b"DUP", 0).is_none());
}
