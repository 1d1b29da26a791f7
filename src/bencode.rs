//! Bencode codec: the four productions of BEP-3 (int, byte string, list,
//! dict) decoded into a tagged-variant [`Value`]. Dictionary keys are raw
//! byte strings; UTF-8 interpretation is left to callers. Encoding a `Dict`
//! always emits keys in lexicographic byte order because `Dict` is backed
//! by a `BTreeMap`: this is what lets the metadata fetcher and the KRPC
//! layer round-trip canonically without a separate "sort before encode"
//! step.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    Eof,
    #[error("expected digit at offset {0}")]
    ExpectedDigit(usize),
    #[error("invalid integer at offset {0}")]
    InvalidInt(usize),
    #[error("integer overflow at offset {0}")]
    IntOverflow(usize),
    #[error("unknown value tag {0:?} at offset {1}")]
    UnknownTag(u8, usize),
    #[error("dictionary key at offset {0} is not a byte string")]
    NonStringKey(usize),
    #[error("trailing bytes after top-level value")]
    TrailingBytes,
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a dict key by its ASCII/UTF-8 name. Absent key or
    /// non-dict value both collapse to `None` per the design note: type
    /// mismatches are never errors at this layer.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(key.as_bytes())
    }

    pub fn decode(input: &[u8]) -> Result<Value, DecodeError> {
        let mut dec = Decoder { buf: input, pos: 0 };
        let value = dec.parse_value()?;
        if dec.pos != input.len() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(value)
    }

    /// Decodes a value and returns it along with the number of bytes
    /// consumed, tolerating trailing bytes. Used by the `ut_metadata`
    /// piece protocol, where the bencoded control dict is followed by a
    /// raw binary tail.
    pub fn decode_prefix(input: &[u8]) -> Result<(Value, usize), DecodeError> {
        let mut dec = Decoder { buf: input, pos: 0 };
        let value = dec.parse_value()?;
        Ok((value, dec.pos))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                // BTreeMap already iterates in lexicographic key order.
                for (k, v) in map {
                    Value::Bytes(k.clone()).encode_into(out);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::Bytes(s.into().into_bytes())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn dict() -> DictBuilder {
        DictBuilder(BTreeMap::new())
    }
}

/// Small builder so call sites that construct outbound KRPC/extension
/// messages read as a flat list of key/value pairs instead of repeated
/// `BTreeMap::insert` calls.
pub struct DictBuilder(BTreeMap<Vec<u8>, Value>);

impl DictBuilder {
    pub fn set(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.as_bytes().to_vec(), value);
        self
    }

    pub fn build(self) -> Value {
        Value::Dict(self.0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "{s:?}"),
                Err(_) => write!(f, "<{} bytes>", b.len()),
            },
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Dict(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", String::from_utf8_lossy(k), v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8, DecodeError> {
        self.buf.get(self.pos).copied().ok_or(DecodeError::Eof)
    }

    fn parse_value(&mut self) -> Result<Value, DecodeError> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => self.parse_bytes(),
            other => Err(DecodeError::UnknownTag(other, self.pos)),
        }
    }

    fn parse_int(&mut self) -> Result<Value, DecodeError> {
        let start = self.pos;
        self.pos += 1; // 'i'
        let end = self.find(b'e', start)?;
        let s =
            std::str::from_utf8(&self.buf[self.pos..end]).map_err(|_| DecodeError::InvalidInt(start))?;
        let value: i64 = s.parse().map_err(|_| DecodeError::IntOverflow(start))?;
        self.pos = end + 1;
        Ok(Value::Int(value))
    }

    fn parse_bytes(&mut self) -> Result<Value, DecodeError> {
        let start = self.pos;
        let colon = self.find(b':', start)?;
        let len_str =
            std::str::from_utf8(&self.buf[start..colon]).map_err(|_| DecodeError::ExpectedDigit(start))?;
        let len: usize = len_str.parse().map_err(|_| DecodeError::ExpectedDigit(start))?;
        let data_start = colon + 1;
        let data_end = data_start
            .checked_add(len)
            .ok_or(DecodeError::IntOverflow(start))?;
        if data_end > self.buf.len() {
            return Err(DecodeError::Eof);
        }
        self.pos = data_end;
        Ok(Value::Bytes(self.buf[data_start..data_end].to_vec()))
    }

    fn parse_list(&mut self) -> Result<Value, DecodeError> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(Value::List(items));
            }
            items.push(self.parse_value()?);
        }
    }

    fn parse_dict(&mut self) -> Result<Value, DecodeError> {
        self.pos += 1; // 'd'
        let mut map = BTreeMap::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(Value::Dict(map));
            }
            let key_pos = self.pos;
            let key = match self.parse_bytes()? {
                Value::Bytes(b) => b,
                _ => return Err(DecodeError::NonStringKey(key_pos)),
            };
            let value = self.parse_value()?;
            map.insert(key, value);
        }
    }

    fn find(&self, needle: u8, from: usize) -> Result<usize, DecodeError> {
        self.buf[from..]
            .iter()
            .position(|&b| b == needle)
            .map(|i| i + from)
            .ok_or(DecodeError::Eof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_scenario_s1() {
        let input = b"d3:cow3:moo4:spam4:eggse";
        let value = Value::decode(input).unwrap();
        assert_eq!(value.get("cow").and_then(Value::as_str), Some("moo"));
        assert_eq!(value.get("spam").and_then(Value::as_str), Some("eggs"));
        assert_eq!(value.encode(), input);
    }

    #[test]
    fn decode_never_panics_on_garbage() {
        for input in [&b""[..], b"x", b"i1", b"d", b"l", b"5:ab", b"i9999999999999999999999e"] {
            assert!(Value::decode(input).is_err());
        }
    }

    #[test]
    fn decode_prefix_leaves_binary_tail() {
        let mut input = b"d8:msg_typei1e5:piecei0ee".to_vec();
        input.extend_from_slice(b"raw-piece-bytes");
        let (value, consumed) = Value::decode_prefix(&input).unwrap();
        assert_eq!(value.get("msg_type").and_then(Value::as_int), Some(1));
        assert_eq!(&input[consumed..], b"raw-piece-bytes");
    }

    #[test]
    fn dict_encodes_keys_in_lexicographic_order() {
        let value = Value::dict()
            .set("zebra", Value::Int(1))
            .set("apple", Value::Int(2))
            .build();
        assert_eq!(value.encode(), b"d5:applei2e5:zebrai1ee");
    }

    #[test]
    fn missing_key_is_none_not_error() {
        let value = Value::dict().set("a", Value::Int(1)).build();
        assert_eq!(value.get("b"), None);
        assert_eq!(Value::Int(1).get("a"), None);
    }
}
