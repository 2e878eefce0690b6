//! Binary codec for call arguments and results.
//!
//! The permitted value space for user arguments and returns is closed:
//! tagged nulls, booleans, integers, floats, strings, byte strings,
//! ordered sequences, and string-keyed ordered mappings. [`Value`] models
//! exactly that space; [`encode`] and [`decode`] are a round-trip pair
//! over a compact tagged binary form.
//!
//! Wire layout: one tag byte per value, fixed-width big-endian scalars,
//! `u32` big-endian lengths for strings, byte strings, sequences, and
//! mappings. The encoding is self-delimiting; trailing bytes after a
//! complete value are a decode error.
//!
//! Values nested deeper than [`MAX_DEPTH`] are rejected on both sides:
//! at encode time as [`CodecError::Unencodable`] (the caller's fault), at
//! decode time as [`CodecError::DepthExceeded`] (the peer's fault).

use bytes::{Buf, BufMut};

/// Maximum nesting depth accepted by [`encode`] and [`decode`].
pub const MAX_DEPTH: usize = 64;

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_SEQ: u8 = 0x07;
const TAG_MAP: u8 = 0x08;

/// A value in the permitted argument/result space.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Tagged null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// IEEE-754 double.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Ordered sequence.
    Seq(Vec<Value>),
    /// String-keyed mapping with preserved entry order.
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Build a sequence value.
    pub fn seq<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Self::Seq(items.into_iter().collect())
    }

    /// Build a mapping value.
    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// The integer payload, if this is an [`Value::Int`].
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// The string payload, if this is a [`Value::Str`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl TryFrom<u64> for Value {
    type Error = CodecError;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        i64::try_from(v)
            .map(Self::Int)
            .map_err(|_| CodecError::Unencodable {
                reason: format!("integer {v} does not fit the signed 64-bit range"),
            })
    }
}

/// Codec failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// Value lies outside the permitted space or its limits.
    #[error("unencodable argument: {reason}")]
    Unencodable {
        /// Why the value was rejected.
        reason: String,
    },

    /// Unknown tag byte in the input.
    #[error("unknown value tag 0x{0:02x}")]
    UnknownTag(u8),

    /// Input ended inside a value.
    #[error("truncated value")]
    Truncated,

    /// Input continued past the end of the value.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// A string payload was not valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,

    /// Input nested deeper than [`MAX_DEPTH`].
    #[error("value nested deeper than {MAX_DEPTH}")]
    DepthExceeded,
}

/// Encode a value into its tagged binary form.
///
/// # Errors
///
/// Returns [`CodecError::Unencodable`] when the value nests deeper than
/// [`MAX_DEPTH`] or an aggregate exceeds the `u32` length space.
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(32);
    encode_into(value, &mut buf, 0)?;
    Ok(buf)
}

fn encode_into(value: &Value, buf: &mut Vec<u8>, depth: usize) -> Result<(), CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::Unencodable {
            reason: format!("value nested deeper than {MAX_DEPTH}"),
        });
    }
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Bool(false) => buf.put_u8(TAG_FALSE),
        Value::Bool(true) => buf.put_u8(TAG_TRUE),
        Value::Int(n) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*n);
        },
        Value::Float(x) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_u64(x.to_bits());
        },
        Value::Str(s) => {
            buf.put_u8(TAG_STR);
            put_len_prefixed(buf, s.as_bytes())?;
        },
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            put_len_prefixed(buf, b)?;
        },
        Value::Seq(items) => {
            buf.put_u8(TAG_SEQ);
            buf.put_u32(aggregate_len(items.len())?);
            for item in items {
                encode_into(item, buf, depth + 1)?;
            }
        },
        Value::Map(entries) => {
            buf.put_u8(TAG_MAP);
            buf.put_u32(aggregate_len(entries.len())?);
            for (key, item) in entries {
                put_len_prefixed(buf, key.as_bytes())?;
                encode_into(item, buf, depth + 1)?;
            }
        },
    }
    Ok(())
}

fn put_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    buf.put_u32(aggregate_len(bytes.len())?);
    buf.put_slice(bytes);
    Ok(())
}

fn aggregate_len(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::Unencodable {
        reason: format!("aggregate of {len} entries exceeds the length space"),
    })
}

/// Decode one complete value from `input`.
///
/// # Errors
///
/// Returns a [`CodecError`] on unknown tags, truncation, non-UTF-8
/// string payloads, excessive nesting, or trailing bytes.
pub fn decode(input: &[u8]) -> Result<Value, CodecError> {
    let mut buf = input;
    let value = decode_one(&mut buf, 0)?;
    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }
    Ok(value)
}

fn decode_one(buf: &mut &[u8], depth: usize) -> Result<Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::DepthExceeded);
    }
    if !buf.has_remaining() {
        return Err(CodecError::Truncated);
    }
    let tag = buf.get_u8();
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INT => {
            ensure_remaining(*buf, 8)?;
            Ok(Value::Int(buf.get_i64()))
        },
        TAG_FLOAT => {
            ensure_remaining(*buf, 8)?;
            Ok(Value::Float(f64::from_bits(buf.get_u64())))
        },
        TAG_STR => {
            let bytes = take_len_prefixed(buf)?;
            String::from_utf8(bytes)
                .map(Value::Str)
                .map_err(|_| CodecError::InvalidUtf8)
        },
        TAG_BYTES => Ok(Value::Bytes(take_len_prefixed(buf)?)),
        TAG_SEQ => {
            let count = take_count(buf)?;
            let mut items = Vec::with_capacity(count.min(1_024));
            for _ in 0..count {
                items.push(decode_one(buf, depth + 1)?);
            }
            Ok(Value::Seq(items))
        },
        TAG_MAP => {
            let count = take_count(buf)?;
            let mut entries = Vec::with_capacity(count.min(1_024));
            for _ in 0..count {
                let key_bytes = take_len_prefixed(buf)?;
                let key = String::from_utf8(key_bytes).map_err(|_| CodecError::InvalidUtf8)?;
                entries.push((key, decode_one(buf, depth + 1)?));
            }
            Ok(Value::Map(entries))
        },
        other => Err(CodecError::UnknownTag(other)),
    }
}

fn ensure_remaining(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated);
    }
    Ok(())
}

fn take_count(buf: &mut &[u8]) -> Result<usize, CodecError> {
    ensure_remaining(*buf, 4)?;
    Ok(buf.get_u32() as usize)
}

fn take_len_prefixed(buf: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = take_count(buf)?;
    ensure_remaining(*buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}
