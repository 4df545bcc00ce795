use std::path::Path;

use crate::ForthError;

fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b'\r' | b'\n' | b'\t')
}

/// Source text replayed one token at a time.
///
/// A source is consumed once; there is no way to rewind it.
#[derive(Debug, Clone)]
pub struct TokenSource {
    text: Vec<u8>,
    offset: usize,
    exhausted: bool,
}

impl TokenSource {
    pub fn new(text: impl Into<Vec<u8>>) -> Self {
        TokenSource {
            text: text.into(),
            offset: 0,
            exhausted: false,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ForthError> {
        let path = path.as_ref();
        let text = std::fs::read(path).map_err(|source| ForthError::Io {
            path: path.to_owned(),
            source,
        })?;
        tracing::info!(path = %path.display(), bytes = text.len(), "loaded source");
        Ok(TokenSource::new(text))
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn is_separator(&self, delim: u8) -> bool {
        let byte = self.text[self.offset];
        byte == delim || is_whitespace(byte)
    }

    /// Next token bounded by `delim` or whitespace.
    ///
    /// Leading separators are skipped and the separator ending the token is
    /// consumed. Reaching the end of the text marks the source exhausted.
    pub fn get_token(&mut self, delim: u8) -> Vec<u8> {
        while self.offset < self.text.len() && self.is_separator(delim) {
            self.offset += 1;
        }
        let start = self.offset;
        while self.offset < self.text.len() && !self.is_separator(delim) {
            self.offset += 1;
        }
        let token = self.text[start..self.offset].to_vec();
        if self.offset == self.text.len() {
            self.exhausted = true;
        } else {
            self.offset += 1;
        }
        token
    }
}

#[test]
fn test_get_token() {
    let mut source = TokenSource::new(": SQ DUP * ;\n 5 SQ .");
    let mut tokens = vec![];
    while !source.is_exhausted() {
        tokens.push(String::from_utf8(source.get_token(b' ')).unwrap());
    }
    assert_eq!(tokens, [":", "SQ", "DUP", "*", ";", "5", "SQ", "."]);
}

#[test]
fn test_get_token_skips_delimiter_runs_and_whitespace() {
    let mut source = TokenSource::new("  \r\n\tONE\t\tTWO   ");
    assert_eq!(source.get_token(b' '), b"ONE");
    assert!(!source.is_exhausted());
    assert_eq!(source.get_token(b' '), b"TWO");
    assert!(!source.is_exhausted());
    // Only trailing separators remain.
    assert_eq!(source.get_token(b' '), b"");
    assert!(source.is_exhausted());
}

#[test]
fn test_get_token_custom_delimiter() {
    // Parsing a string literal: spaces belong to the token.
    let mut source = TokenSource::new(".\" HELLO WORLD\" CR");
    assert_eq!(source.get_token(b' '), b".\"");
    assert_eq!(source.get_token(b'"'), b"HELLO WORLD");
    assert_eq!(source.get_token(b' '), b"CR");
    assert!(source.is_exhausted());
}

#[test]
fn test_get_token_consumes_one_delimiter() {
    let mut source = TokenSource::new("A,,B");
    assert_eq!(source.get_token(b','), b"A");
    assert_eq!(source.offset(), 2);
    assert_eq!(source.get_token(b','), b"B");
    assert_eq!(source.offset(), 4);
    assert!(source.is_exhausted());
}

#[test]
fn test_empty_source_yields_one_empty_token() {
    let mut source = TokenSource::new("");
    assert!(!source.is_exhausted());
    assert_eq!(source.get_token(b' '), b"");
    assert!(source.is_exhausted());
}
