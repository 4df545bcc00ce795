use std::path::Path;

use crate::ForthError;

/// Bytes preceding the snapshot body.
pub const HEADER_SIZE: usize = 27;
/// Logical address of the first body byte.
pub const ORIGIN: u16 = 0x4000;
/// Length of a complete snapshot file.
pub const IMAGE_SIZE: usize = HEADER_SIZE + 0x10000 - ORIGIN as usize;
/// Header offset of the captured machine stack pointer.
pub const HEADER_SP_OFFSET: usize = 23;

fn offset(addr: u16) -> usize {
    addr.wrapping_sub(ORIGIN) as usize + HEADER_SIZE
}

/// Captured machine memory.
///
/// The whole machine state lives here: the dictionary, both stacks and every
/// system variable. Addresses are logical 16-bit values; anything below
/// `ORIGIN` is outside the image and indexing it panics.
#[derive(Clone, PartialEq, Eq)]
pub struct Snapshot {
    bytes: Vec<u8>,
}

impl Snapshot {
    /// Zero filled image of the standard size.
    pub fn blank() -> Self {
        Snapshot {
            bytes: vec![0; IMAGE_SIZE],
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ForthError> {
        if bytes.len() != IMAGE_SIZE {
            return Err(ForthError::ImageSize {
                path: None,
                expected: IMAGE_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Snapshot { bytes })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ForthError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ForthError::Io {
            path: path.to_owned(),
            source,
        })?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "loaded snapshot");
        Snapshot::from_bytes(bytes).map_err(|e| match e {
            ForthError::ImageSize {
                expected, actual, ..
            } => ForthError::ImageSize {
                path: Some(path.to_owned()),
                expected,
                actual,
            },
            e => e,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ForthError> {
        let path = path.as_ref();
        std::fs::write(path, &self.bytes).map_err(|source| ForthError::Io {
            path: path.to_owned(),
            source,
        })?;
        tracing::info!(path = %path.display(), bytes = self.bytes.len(), "saved snapshot");
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn get_byte(&self, addr: u16) -> u8 {
        self.bytes[offset(addr)]
    }

    pub fn set_byte(&mut self, addr: u16, val: u8) {
        self.bytes[offset(addr)] = val;
    }

    // The high byte wraps to the bottom of the buffer when `addr` is 0xFFFF.
    fn high_offset(&self, addr: u16) -> usize {
        (offset(addr) + 1) % self.bytes.len()
    }

    pub fn get_word(&self, addr: u16) -> u16 {
        let lo = self.bytes[offset(addr)];
        let hi = self.bytes[self.high_offset(addr)];
        u16::from_le_bytes([lo, hi])
    }

    pub fn set_word(&mut self, addr: u16, val: u16) {
        let [lo, hi] = val.to_le_bytes();
        let hi_offset = self.high_offset(addr);
        self.bytes[offset(addr)] = lo;
        self.bytes[hi_offset] = hi;
    }

    /// Machine stack pointer captured in the header.
    pub fn header_sp(&self) -> u16 {
        u16::from_le_bytes([
            self.bytes[HEADER_SP_OFFSET],
            self.bytes[HEADER_SP_OFFSET + 1],
        ])
    }

    pub fn set_header_sp(&mut self, sp: u16) {
        self.bytes[HEADER_SP_OFFSET..HEADER_SP_OFFSET + 2].copy_from_slice(&sp.to_le_bytes());
    }

    /// Store `addr` at the top of the captured machine stack, so the snapshot
    /// resumes there when it is next started.
    pub fn set_stack(&mut self, addr: u16) {
        let sp = self.header_sp();
        self.set_word(sp, addr);
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Snapshot {{ bytes: {}, header_sp: {:#06x} }}",
            self.bytes.len(),
            self.header_sp()
        )
    }
}

#[cfg(test)]
use crate::testimage::temp_path;

#[test]
fn test_snapshot_offsets() {
    let mut image = Snapshot::blank();
    image.set_byte(ORIGIN, 0xAB);
    assert_eq!(image.as_bytes()[HEADER_SIZE], 0xAB);
    image.set_byte(0xFFFF, 0xCD);
    assert_eq!(image.as_bytes()[IMAGE_SIZE - 1], 0xCD);
    image.set_word(0x8000, 0x1234);
    assert_eq!(image.get_byte(0x8000), 0x34);
    assert_eq!(image.get_byte(0x8001), 0x12);
}

#[test]
fn test_snapshot_word_wraps_at_top() {
    let mut image = Snapshot::blank();
    image.set_word(0xFFFF, 0xBEEF);
    assert_eq!(image.get_word(0xFFFF), 0xBEEF);
    assert_eq!(image.as_bytes()[IMAGE_SIZE - 1], 0xEF);
    assert_eq!(image.as_bytes()[0], 0xBE);
}

#[test]
fn test_snapshot_rejects_wrong_size() {
    match Snapshot::from_bytes(vec![0; 100]) {
        Err(ForthError::ImageSize {
            expected, actual, ..
        }) => {
            assert_eq!(expected, IMAGE_SIZE);
            assert_eq!(actual, 100);
        }
        r => panic!("unexpected {:?}", r),
    }
}

#[test]
fn test_snapshot_save_load() {
    let mut image = Snapshot::blank();
    for (i, addr) in (0x6000u16..0x6100).enumerate() {
        image.set_byte(addr, i as u8);
    }
    image.set_header_sp(0xFF00);
    let path = temp_path("save-load.sna");
    image.save(&path).unwrap();
    let loaded = Snapshot::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(image, loaded);
}

#[test]
fn test_snapshot_load_missing_file() {
    let path = temp_path("does-not-exist.sna");
    assert!(matches!(Snapshot::load(&path), Err(ForthError::Io { .. })));
}

#[test]
fn test_snapshot_set_stack() {
    let mut image = Snapshot::blank();
    image.set_header_sp(0xFF40);
    image.set_stack(0x6101);
    assert_eq!(image.get_word(0xFF40), 0x6101);
    assert_eq!(image.header_sp(), 0xFF40);
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::{prop_assert_eq, proptest};

    proptest! {
        #[test]
        fn word_round_trips(addr in ORIGIN..=u16::MAX, val: u16) {
            let mut image = Snapshot::blank();
            image.set_word(addr, val);
            prop_assert_eq!(image.get_word(addr), val);
        }

        #[test]
        fn byte_round_trips(addr in ORIGIN..=u16::MAX, val: u8) {
            let mut image = Snapshot::blank();
            image.set_byte(addr, val);
            prop_assert_eq!(image.get_byte(addr), val);
        }
    }
}
