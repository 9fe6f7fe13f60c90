//! Typed leaf values and the attributes that read them.
//!
//! An [`Attribute`] is the leaf of a format specification: it knows how many
//! bytes it occupies, how to turn them into a [`Value`], and which values are
//! acceptable. Attributes marked as bound publish their value into the decode
//! context so that later specs (lengths, counts, conditionals) can use it.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ATTRIBUTE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an attribute, used as the key in decode context frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeId(u64);

impl AttributeId {
    fn next() -> Self {
        Self(NEXT_ATTRIBUTE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fixed-size integer kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Signed 8-bit
    I8,
    /// Unsigned 8-bit
    U8,
    /// Signed 16-bit
    I16,
    /// Unsigned 16-bit
    U16,
    /// Signed 32-bit
    I32,
    /// Unsigned 32-bit
    U32,
    /// Signed 64-bit
    I64,
    /// Unsigned 64-bit
    U64,
}

impl DataType {
    /// Width in bytes
    pub const fn width(self) -> usize {
        match self {
            DataType::I8 | DataType::U8 => 1,
            DataType::I16 | DataType::U16 => 2,
            DataType::I32 | DataType::U32 => 4,
            DataType::I64 | DataType::U64 => 8,
        }
    }

    /// Whether values of this type are signed
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            DataType::I8 | DataType::I16 | DataType::I32 | DataType::I64
        )
    }

    /// Decodes a value of this type from the first `width()` bytes of `data`.
    ///
    /// Callers guarantee `data.len() >= self.width()`.
    pub fn read(self, data: &[u8], endian: Endian) -> Value {
        match (self, endian) {
            (DataType::I8, _) => Value::Signed(data[0] as i8 as i64),
            (DataType::U8, _) => Value::Unsigned(data[0] as u64),
            (DataType::I16, Endian::Little) => Value::Signed(LittleEndian::read_i16(data) as i64),
            (DataType::I16, Endian::Big) => Value::Signed(BigEndian::read_i16(data) as i64),
            (DataType::U16, Endian::Little) => Value::Unsigned(LittleEndian::read_u16(data) as u64),
            (DataType::U16, Endian::Big) => Value::Unsigned(BigEndian::read_u16(data) as u64),
            (DataType::I32, Endian::Little) => Value::Signed(LittleEndian::read_i32(data) as i64),
            (DataType::I32, Endian::Big) => Value::Signed(BigEndian::read_i32(data) as i64),
            (DataType::U32, Endian::Little) => Value::Unsigned(LittleEndian::read_u32(data) as u64),
            (DataType::U32, Endian::Big) => Value::Unsigned(BigEndian::read_u32(data) as u64),
            (DataType::I64, Endian::Little) => Value::Signed(LittleEndian::read_i64(data)),
            (DataType::I64, Endian::Big) => Value::Signed(BigEndian::read_i64(data)),
            (DataType::U64, Endian::Little) => Value::Unsigned(LittleEndian::read_u64(data)),
            (DataType::U64, Endian::Big) => Value::Unsigned(BigEndian::read_u64(data)),
        }
    }
}

/// Byte order of multi-byte integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    /// Least significant byte first
    Little,
    /// Most significant byte first
    Big,
}

/// A decoded attribute value
#[derive(Debug, Clone)]
pub enum Value {
    /// Signed integer
    Signed(i64),
    /// Unsigned integer
    Unsigned(u64),
    /// Text (lossily decoded)
    String(String),
    /// Raw bytes
    Bytes(Bytes),
}

impl Value {
    /// Returns the value as a non-negative integer, if it is one
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Unsigned(v) => Some(*v),
            Value::Signed(v) => u64::try_from(*v).ok(),
            Value::String(_) | Value::Bytes(_) => None,
        }
    }

    /// Returns the value as text, if it is text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as bytes, if it is a string or byte array
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Signed(v) => Some(*v as i128),
            Value::Unsigned(v) => Some(*v as i128),
            _ => None,
        }
    }
}

// Integers compare numerically regardless of signedness so that a final
// value written as `8u8` matches an unsigned field decoded as `Unsigned(8)`.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self.as_i128(), other.as_i128()) {
            (Some(a), Some(b)) => a == b,
            _ => match (self, other) {
                (Value::String(a), Value::String(b)) => a == b,
                (Value::Bytes(a), Value::Bytes(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Signed(v) => write!(f, "{}", v),
            Value::Unsigned(v) => write!(f, "{} (0x{:X})", v, v),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => {
                const PREVIEW: usize = 16;
                for (i, byte) in b.iter().take(PREVIEW).enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{:02X}", byte)?;
                }
                if b.len() > PREVIEW {
                    write!(f, " .. ({} bytes)", b.len())?;
                }
                Ok(())
            }
        }
    }
}

macro_rules! value_from_int {
    ($variant:ident: $($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v.into())
            }
        })*
    };
}

value_from_int!(Unsigned: u8, u16, u32, u64);
value_from_int!(Signed: i8, i16, i32, i64);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(v))
    }
}

impl<const N: usize> From<[u8; N]> for Value {
    fn from(v: [u8; N]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(&v))
    }
}

/// Length of a variable-size field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Length {
    /// Known when the spec is built
    Fixed(u64),
    /// Read from a previously bound attribute
    Attribute(AttributeId),
}

impl Length {
    /// Length taken from the bound value of `attribute`
    pub fn of(attribute: &Attribute) -> Self {
        Length::Attribute(attribute.id())
    }

    /// Size known before decode, or 0 when it depends on bound values
    pub fn static_size(&self) -> u64 {
        match self {
            Length::Fixed(n) => *n,
            Length::Attribute(_) => 0,
        }
    }
}

/// What an attribute reads and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeKind {
    /// Fixed-width integer
    Integer {
        /// Integer type
        ty: DataType,
        /// Byte order
        endian: Endian,
    },
    /// Text of the given length, decoded lossily as UTF-8
    String(Length),
    /// Raw bytes of the given length
    Bytes(Length),
    /// Bytes of the given length that are skipped rather than read
    Opaque(Length),
    /// NUL-terminated text of at most `max` bytes (terminator included)
    CString {
        /// Maximum length including the terminator
        max: u64,
    },
}

/// A named, typed leaf specification
#[derive(Debug, Clone)]
pub struct Attribute {
    id: AttributeId,
    name: String,
    kind: AttributeKind,
    final_value: Option<Value>,
    allowed: Option<Vec<Value>>,
    bound: bool,
}

impl Attribute {
    /// Creates an attribute with a fresh identity
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            id: AttributeId::next(),
            name: name.into(),
            kind,
            final_value: None,
            allowed: None,
            bound: false,
        }
    }

    /// Integer attribute of the given type and byte order
    pub fn integer(name: impl Into<String>, ty: DataType, endian: Endian) -> Self {
        Self::new(name, AttributeKind::Integer { ty, endian })
    }

    /// Unsigned 8-bit attribute
    pub fn u8(name: impl Into<String>) -> Self {
        Self::integer(name, DataType::U8, Endian::Little)
    }

    /// Little-endian unsigned 16-bit attribute
    pub fn u16_le(name: impl Into<String>) -> Self {
        Self::integer(name, DataType::U16, Endian::Little)
    }

    /// Big-endian unsigned 16-bit attribute
    pub fn u16_be(name: impl Into<String>) -> Self {
        Self::integer(name, DataType::U16, Endian::Big)
    }

    /// Little-endian unsigned 32-bit attribute
    pub fn u32_le(name: impl Into<String>) -> Self {
        Self::integer(name, DataType::U32, Endian::Little)
    }

    /// Big-endian unsigned 32-bit attribute
    pub fn u32_be(name: impl Into<String>) -> Self {
        Self::integer(name, DataType::U32, Endian::Big)
    }

    /// Little-endian unsigned 64-bit attribute
    pub fn u64_le(name: impl Into<String>) -> Self {
        Self::integer(name, DataType::U64, Endian::Little)
    }

    /// Text attribute of the given length
    pub fn string(name: impl Into<String>, length: Length) -> Self {
        Self::new(name, AttributeKind::String(length))
    }

    /// Byte array attribute of the given length
    pub fn bytes(name: impl Into<String>, length: Length) -> Self {
        Self::new(name, AttributeKind::Bytes(length))
    }

    /// Skipped byte range of the given length; its value is never materialized
    pub fn opaque(name: impl Into<String>, length: Length) -> Self {
        Self::new(name, AttributeKind::Opaque(length))
    }

    /// NUL-terminated text attribute
    pub fn cstring(name: impl Into<String>, max: u64) -> Self {
        Self::new(name, AttributeKind::CString { max })
    }

    /// Requires the decoded value to equal `value` (e.g. a magic number)
    pub fn final_value(mut self, value: impl Into<Value>) -> Self {
        self.final_value = Some(value.into());
        self
    }

    /// Requires the decoded value to be one of `values`
    pub fn one_of<V: Into<Value>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Publishes the decoded value into the decode context
    pub fn bind(mut self) -> Self {
        self.bound = true;
        self
    }

    /// Identity of this attribute
    pub fn id(&self) -> AttributeId {
        self.id
    }

    /// Attribute name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What this attribute reads
    pub fn kind(&self) -> &AttributeKind {
        &self.kind
    }

    /// Required constant, if any
    pub fn required_value(&self) -> Option<&Value> {
        self.final_value.as_ref()
    }

    /// Whether the decoded value is published into the context
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Bytes needed to probe this attribute, 0 if only known at decode time
    pub fn match_size(&self) -> u64 {
        match &self.kind {
            AttributeKind::Integer { ty, .. } => ty.width() as u64,
            AttributeKind::String(length)
            | AttributeKind::Bytes(length)
            | AttributeKind::Opaque(length) => length.static_size(),
            AttributeKind::CString { .. } => 0,
        }
    }

    /// Converts exactly-sized raw bytes into this attribute's value
    pub fn parse(&self, data: &[u8]) -> Value {
        match &self.kind {
            AttributeKind::Integer { ty, endian } => ty.read(data, *endian),
            AttributeKind::String(_) => Value::String(String::from_utf8_lossy(data).into_owned()),
            AttributeKind::CString { .. } => {
                let text = data.strip_suffix(&[0]).unwrap_or(data);
                Value::String(String::from_utf8_lossy(text).into_owned())
            }
            AttributeKind::Bytes(_) | AttributeKind::Opaque(_) => {
                Value::Bytes(Bytes::copy_from_slice(data))
            }
        }
    }

    /// Checks `value` against the final value and the allowed set
    pub fn accepts(&self, value: &Value) -> bool {
        if let Some(required) = &self.final_value {
            if required != value {
                return false;
            }
        }
        match &self.allowed {
            Some(allowed) => allowed.iter().any(|v| v == value),
            None => true,
        }
    }
}
