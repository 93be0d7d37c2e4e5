//! Bencode decoder following the BitTorrent metainfo specification
//! (<http://www.bittorrent.org/beps/bep_0003.html#bencoding>).
//!
//! Bencode supports four data types:
//! - Byte strings: `<length>:<contents>` (e.g. `4:spam`)
//! - Integers: `i<number>e` (e.g. `i42e`)
//! - Lists: `l<bencoded values>e` (e.g. `l4:spami42ee`)
//! - Dictionaries: `d<bencoded string><bencoded value>e` (e.g. `d3:bar4:spam3:fooi42ee`)
//!
//! The decoder operates directly on bytes: metainfo `pieces` fields and
//! info-hashes are arbitrary binary and must never be validated as UTF-8.

use std::collections::BTreeMap;

use thiserror::Error;

use super::value::BValue;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),
    #[error("invalid integer at offset {0}: {1}")]
    InvalidInteger(usize, String),
    #[error("invalid string length at offset {0}: {1}")]
    InvalidLength(usize, String),
    #[error("dictionary keys not in ascending order at offset {0}")]
    UnsortedKeys(usize),
    #[error("dictionary key at offset {0} is not a byte string")]
    NonStringKey(usize),
    #[error("unrecognized value tag '{1}' at offset {0}")]
    UnknownTag(usize, char),
    #[error("trailing data after top-level value at offset {0}")]
    TrailingData(usize),
}

/// Malformed bencode input, surfaced to callers as a single opaque kind per
/// the spec's `MalformedBencode` error kind, while keeping the detailed
/// variant available via `source`/`Display` for logging.
#[derive(Debug, Error)]
#[error("malformed bencode: {0}")]
pub struct MalformedBencode(#[from] pub DecodeError);

pub struct Decoder<'a> {
    input: &'a [u8],
    position: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, position: 0 }
    }

    /// Parses the complete input as a single top-level bencoded value.
    pub fn parse(&mut self) -> Result<BValue, MalformedBencode> {
        let value = self.parse_value()?;
        if self.position != self.input.len() {
            return Err(DecodeError::TrailingData(self.position).into());
        }
        Ok(value)
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.position).copied()
    }

    fn parse_value(&mut self) -> Result<BValue, DecodeError> {
        match self.peek() {
            Some(b'i') => Ok(BValue::Int(self.parse_integer()?)),
            Some(b'l') => self.parse_list(),
            Some(b'd') => self.parse_dict(),
            Some(c) if c.is_ascii_digit() => Ok(BValue::Bytes(self.parse_bytestring()?)),
            Some(c) => Err(DecodeError::UnknownTag(self.position, c as char)),
            None => Err(DecodeError::UnexpectedEof(self.position)),
        }
    }

    /// `i<decimal>e`. No leading zeros except the literal `0`; `i-0e` is invalid.
    fn parse_integer(&mut self) -> Result<i64, DecodeError> {
        let start = self.position;
        self.position += 1; // consume 'i'
        let digits_start = self.position;
        while self.peek().is_some_and(|c| c != b'e') {
            self.position += 1;
        }
        if self.peek() != Some(b'e') {
            return Err(DecodeError::UnexpectedEof(self.position));
        }
        let raw = &self.input[digits_start..self.position];
        self.position += 1; // consume 'e'

        let text = std::str::from_utf8(raw)
            .map_err(|_| DecodeError::InvalidInteger(start, "not ascii".into()))?;
        validate_integer_literal(text).map_err(|e| DecodeError::InvalidInteger(start, e))?;
        text.parse::<i64>()
            .map_err(|e| DecodeError::InvalidInteger(start, e.to_string()))
    }

    /// `<length>:<bytes>`.
    fn parse_bytestring(&mut self) -> Result<Vec<u8>, DecodeError> {
        let start = self.position;
        let len_start = self.position;
        while self.peek().is_some_and(|c| c != b':') {
            self.position += 1;
        }
        if self.peek() != Some(b':') {
            return Err(DecodeError::UnexpectedEof(self.position));
        }
        let len_bytes = &self.input[len_start..self.position];
        self.position += 1; // consume ':'

        let len_text = std::str::from_utf8(len_bytes)
            .map_err(|_| DecodeError::InvalidLength(start, "not ascii".into()))?;
        if len_text.len() > 1 && len_text.starts_with('0') {
            return Err(DecodeError::InvalidLength(start, "leading zero".into()));
        }
        let len: usize = len_text
            .parse()
            .map_err(|_| DecodeError::InvalidLength(start, "not a number".into()))?;

        let end = self
            .position
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or(DecodeError::UnexpectedEof(self.position))?;
        let bytes = self.input[self.position..end].to_vec();
        self.position = end;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<BValue, DecodeError> {
        self.position += 1; // consume 'l'
        let mut values = Vec::new();
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.position += 1;
                    return Ok(BValue::List(values));
                }
                Some(_) => values.push(self.parse_value()?),
                None => return Err(DecodeError::UnexpectedEof(self.position)),
            }
        }
    }

    fn parse_dict(&mut self) -> Result<BValue, DecodeError> {
        let dict_start = self.position;
        self.position += 1; // consume 'd'
        let mut map = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;

        loop {
            match self.peek() {
                Some(b'e') => {
                    self.position += 1;
                    return Ok(BValue::Dict(map));
                }
                Some(c) if c.is_ascii_digit() => {
                    let key = self.parse_bytestring()?;
                    if let Some(prev) = &last_key {
                        if key <= *prev {
                            return Err(DecodeError::UnsortedKeys(dict_start));
                        }
                    }
                    let value = self.parse_value()?;
                    last_key = Some(key.clone());
                    map.insert(key, value);
                }
                Some(_) => return Err(DecodeError::NonStringKey(self.position)),
                None => return Err(DecodeError::UnexpectedEof(self.position)),
            }
        }
    }
}

fn validate_integer_literal(text: &str) -> Result<(), String> {
    if text.is_empty() {
        return Err("empty integer".into());
    }
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err("not a decimal integer".into());
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Err("leading zero".into());
    }
    if text == "-0" {
        return Err("negative zero".into());
    }
    Ok(())
}

pub fn decode(input: &[u8]) -> Result<BValue, MalformedBencode> {
    Decoder::new(input).parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: &[(&str, BValue)]) -> BValue {
        BValue::Dict(
            pairs
                .iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn parses_integers() {
        assert_eq!(decode(b"i42e").unwrap(), BValue::Int(42));
        assert_eq!(decode(b"i-42e").unwrap(), BValue::Int(-42));
        assert_eq!(decode(b"i0e").unwrap(), BValue::Int(0));
    }

    #[test]
    fn rejects_malformed_integers() {
        assert!(decode(b"i042e").is_err());
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"ie").is_err());
        assert!(decode(b"i42").is_err());
    }

    #[test]
    fn parses_bytestrings() {
        assert_eq!(decode(b"4:spam").unwrap(), BValue::bytes(*b"spam"));
        assert_eq!(decode(b"0:").unwrap(), BValue::bytes(*b""));
    }

    #[test]
    fn parses_binary_bytestrings_without_utf8_validation() {
        let raw = [0xffu8, 0x00, 0x80, 0x7f];
        let mut input = b"4:".to_vec();
        input.extend_from_slice(&raw);
        assert_eq!(decode(&input).unwrap(), BValue::Bytes(raw.to_vec()));
    }

    #[test]
    fn parses_lists_and_dicts() {
        assert_eq!(
            decode(b"l4:spami42ee").unwrap(),
            BValue::List(vec![BValue::bytes(*b"spam"), BValue::Int(42)])
        );
        assert_eq!(decode(b"le").unwrap(), BValue::List(vec![]));
        assert_eq!(
            decode(b"d3:bar4:spam3:fooi42ee").unwrap(),
            dict(&[("bar", BValue::bytes(*b"spam")), ("foo", BValue::Int(42))])
        );
        assert_eq!(decode(b"de").unwrap(), dict(&[]));
    }

    #[test]
    fn rejects_unsorted_dict_keys() {
        assert!(decode(b"d3:foo3:bar3:baz3:quxe").is_err());
    }

    #[test]
    fn rejects_non_string_dict_keys() {
        assert!(decode(b"di1ei2ee").is_err());
    }

    #[test]
    fn rejects_premature_eof() {
        assert!(decode(b"i42").is_err());
        assert!(decode(b"l1:a").is_err());
        assert!(decode(b"d1:a").is_err());
        assert!(decode(b"5:ab").is_err());
    }

    #[test]
    fn rejects_trailing_data() {
        assert!(decode(b"i1ei2e").is_err());
    }
}
