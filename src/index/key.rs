//! Key descriptions over fixed-offset row bytes.
//!
//! The catalog layer describes where each indexed column lives inside a row.
//! Two encodings are understood:
//!
//! - `Binary`: `len` raw bytes compared exactly (integers, floats, fixed blobs)
//! - `Text`: a 2-byte little-endian length followed by up to `len - 2`
//!   characters, compared ASCII case-insensitively
//!
//! A [`Key`] is the list of per-field content slices, in field order, so a key
//! pulled out of a stored row and a key supplied by a caller compare the same
//! way.

use eyre::{ensure, Result};
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64_with_seed;

pub type Key<'a> = SmallVec<[&'a [u8]; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Binary,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyField {
    pub offset: usize,
    pub len: usize,
    pub kind: KeyKind,
}

impl KeyField {
    pub fn binary(offset: usize, len: usize) -> Self {
        Self {
            offset,
            len,
            kind: KeyKind::Binary,
        }
    }

    /// A text column occupying `len` bytes: 2-byte length plus `len - 2`
    /// characters of capacity.
    pub fn text(offset: usize, len: usize) -> Self {
        Self {
            offset,
            len,
            kind: KeyKind::Text,
        }
    }

    fn content<'a>(&self, row: &'a [u8]) -> &'a [u8] {
        let raw = &row[self.offset..self.offset + self.len];
        match self.kind {
            KeyKind::Binary => raw,
            KeyKind::Text => {
                let stored = u16::from_le_bytes([raw[0], raw[1]]) as usize;
                &raw[2..2 + stored.min(self.len - 2)]
            }
        }
    }
}

/// Writes `text` into a text column of `row`, truncating to its capacity.
pub fn write_text(row: &mut [u8], field: &KeyField, text: &[u8]) {
    let capacity = field.len - 2;
    let n = text.len().min(capacity);
    let col = &mut row[field.offset..field.offset + field.len];
    col[..2].copy_from_slice(&(n as u16).to_le_bytes());
    col[2..2 + n].copy_from_slice(&text[..n]);
    col[2 + n..].fill(0);
}

#[derive(Debug, Clone)]
pub struct KeySpec {
    fields: SmallVec<[KeyField; 4]>,
}

impl KeySpec {
    pub fn new<I: IntoIterator<Item = KeyField>>(fields: I) -> Result<Self> {
        let fields: SmallVec<[KeyField; 4]> = fields.into_iter().collect();
        ensure!(!fields.is_empty(), "index key needs at least one column");
        for f in &fields {
            ensure!(f.len > 0, "key column at offset {} has zero length", f.offset);
            if f.kind == KeyKind::Text {
                ensure!(
                    f.len >= 2,
                    "text key column at offset {} cannot hold its length prefix",
                    f.offset
                );
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    /// Bytes a row must span for every key column to be addressable.
    pub fn min_row_size(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.offset + f.len)
            .max()
            .unwrap_or(0)
    }

    pub fn extract<'a>(&self, row: &'a [u8]) -> Key<'a> {
        self.fields.iter().map(|f| f.content(row)).collect()
    }

    pub fn hash(&self, key: &[&[u8]]) -> u32 {
        let mut h = 0u64;
        for (field, part) in self.fields.iter().zip(key) {
            h = match field.kind {
                KeyKind::Binary => xxh3_64_with_seed(part, h),
                KeyKind::Text => {
                    let folded: SmallVec<[u8; 64]> =
                        part.iter().map(|b| b.to_ascii_lowercase()).collect();
                    xxh3_64_with_seed(&folded, h)
                }
            };
        }
        (h ^ (h >> 32)) as u32
    }

    pub fn key_eq(&self, a: &[&[u8]], b: &[&[u8]]) -> bool {
        if a.len() != self.fields.len() || b.len() != self.fields.len() {
            return false;
        }
        self.fields
            .iter()
            .zip(a.iter().zip(b))
            .all(|(field, (x, y))| match field.kind {
                KeyKind::Binary => x == y,
                KeyKind::Text => x.eq_ignore_ascii_case(y),
            })
    }

    /// True if the key stored in `row` equals `key`.
    pub fn row_matches(&self, row: &[u8], key: &[&[u8]]) -> bool {
        let stored = self.extract(row);
        self.key_eq(&stored, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> KeySpec {
        KeySpec::new([KeyField::binary(0, 4), KeyField::text(4, 10)]).unwrap()
    }

    fn row(k: u32, name: &[u8]) -> Vec<u8> {
        let mut row = vec![0u8; 16];
        row[..4].copy_from_slice(&k.to_le_bytes());
        write_text(&mut row, &KeyField::text(4, 10), name);
        row
    }

    #[test]
    fn extract_reads_text_by_length() {
        let r = row(5, b"abc");
        let key = spec().extract(&r);
        assert_eq!(key.len(), 2);
        assert_eq!(key[0], &5u32.to_le_bytes());
        assert_eq!(key[1], b"abc");
    }

    #[test]
    fn text_compares_case_insensitively() {
        let s = spec();
        let a = row(1, b"Hello");
        let b = row(1, b"hELLO");
        let ka = s.extract(&a);
        let kb = s.extract(&b);
        assert!(s.key_eq(&ka, &kb));
        assert_eq!(s.hash(&ka), s.hash(&kb));
    }

    #[test]
    fn binary_compares_exactly() {
        let s = spec();
        let a = row(1, b"x");
        let b = row(2, b"x");
        assert!(!s.key_eq(&s.extract(&a), &s.extract(&b)));
    }

    #[test]
    fn row_matches_caller_key() {
        let s = spec();
        let r = row(9, b"Name");
        let nine = 9u32.to_le_bytes();
        assert!(s.row_matches(&r, &[&nine[..], &b"NAME"[..]]));
        assert!(!s.row_matches(&r, &[&nine[..], &b"names"[..]]));
        assert!(!s.row_matches(&r, &[&nine[..]]));
    }

    #[test]
    fn write_text_truncates_to_capacity() {
        let field = KeyField::text(0, 6);
        let mut r = vec![0xFFu8; 6];
        write_text(&mut r, &field, b"abcdefgh");
        assert_eq!(&r[..2], &4u16.to_le_bytes());
        assert_eq!(&r[2..], b"abcd");
    }

    #[test]
    fn rejects_empty_and_tiny_text() {
        assert!(KeySpec::new(Vec::<KeyField>::new()).is_err());
        assert!(KeySpec::new([KeyField::text(0, 1)]).is_err());
        assert_eq!(spec().min_row_size(), 14);
    }
}
