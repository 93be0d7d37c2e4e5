use std::collections::BTreeMap;
use std::fmt::Display;

/// A decoded Bencode value as defined in the BitTorrent specification.
///
/// Bencode supports four types of values:
/// - Byte strings (arbitrary binary data, not necessarily UTF-8)
/// - Integers
/// - Lists
/// - Dictionaries, whose keys are byte strings in ascending byte order
///
/// Unlike a `serde_json::Value`-backed representation, every string here is a
/// raw `Vec<u8>`: torrent `pieces` fields and info-hashes are binary, and
/// bouncing them through UTF-8 would corrupt them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BValue {
    /// `i<number>e`
    Int(i64),
    /// `<length>:<bytes>`
    Bytes(Vec<u8>),
    /// `l<values>e`
    List(Vec<BValue>),
    /// `d<key><value>...e`, keys MUST be in ascending byte order on the wire
    Dict(BTreeMap<Vec<u8>, BValue>),
}

impl BValue {
    pub fn bytes(s: impl Into<Vec<u8>>) -> Self {
        BValue::Bytes(s.into())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BValue]> {
        match self {
            BValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BValue>> {
        match self {
            BValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a dictionary key by its ASCII/UTF-8 name.
    pub fn get(&self, key: &str) -> Option<&BValue> {
        self.as_dict()?.get(key.as_bytes())
    }
}

impl Display for BValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BValue::Int(n) => write!(f, "{n}"),
            BValue::Bytes(s) => {
                if s.iter().any(|&b| b < 0x20 || b > 0x7e) {
                    write!(f, "\"{}\"", hex::encode(s))
                } else {
                    write!(f, "\"{}\"", String::from_utf8_lossy(s))
                }
            }
            BValue::List(list) => {
                write!(f, "[")?;
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            BValue::Dict(dict) => {
                write!(f, "{{")?;
                for (i, (key, value)) in dict.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "\"{}\":{}", String::from_utf8_lossy(key), value)?;
                }
                write!(f, "}}")
            }
        }
    }
}
