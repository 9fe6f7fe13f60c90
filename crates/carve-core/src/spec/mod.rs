//! Declarative format specifications.
//!
//! A [`FormatSpec`] describes how to probe and decode a byte range. Every
//! variant implements the same two-phase protocol:
//!
//! 1. **Probe**: [`match_size`](FormatSpec::match_size) says how many bytes
//!    the node can check up front (0 when that depends on decoded values),
//!    and [`matches`](FormatSpec::matches) checks those bytes in an in-memory
//!    [`ProbeBuffer`], advancing it only on success. Probing performs no I/O
//!    and never fails with an error: the outcome is a [`Probe`].
//! 2. **Decode**: [`decode`](FormatSpec::decode) runs only after a probe
//!    succeeded. It reads from the input through a [`DecodeContext`], binds
//!    attributes, records sections and creates result nodes, and returns the
//!    number of bytes consumed.
//!
//! ## Example
//!
//! ```
//! use carve_core::attribute::{Attribute, Length};
//! use carve_core::spec::{FormatSpec, StructSpec};
//!
//! let name_len = Attribute::u16_le("name length").bind();
//! let header: FormatSpec = StructSpec::new("header")
//!     .child(Attribute::u32_le("signature").final_value(0x0403_4b50u32))
//!     .child(&name_len)
//!     .child(Attribute::string("name", Length::of(&name_len)))
//!     .into();
//!
//! // Only the fixed-size prefix is probed
//! assert_eq!(header.match_size(), 6);
//! assert!(header.probe_bytes(&[0x50, 0x4B, 0x03, 0x04, 0x01, 0x00]).is_match());
//! ```

mod composite;
mod deferred;

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::attribute::{Attribute, AttributeKind, Length};
use crate::context::DecodeContext;
use crate::error::{Error, Result};
use crate::result::Renderable;

pub use composite::{FixedArraySpec, Repeat, StructSpec, VarArraySpec};
pub use deferred::{ConditionalSpec, DecoderFactory, EncodedSpec, SpecSupplier};

/// Outcome of probing a spec against buffered bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The bytes satisfy the spec
    Matched,
    /// The bytes contradict the spec
    Mismatch,
    /// The buffer ran out before the spec could be checked
    Incomplete,
}

impl Probe {
    /// Whether the probe succeeded
    pub fn is_match(self) -> bool {
        self == Probe::Matched
    }
}

/// Read cursor over bytes buffered for probing
#[derive(Debug, Clone)]
pub struct ProbeBuffer<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ProbeBuffer<'a> {
    /// Creates a buffer positioned at the first byte
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Current position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left after the position
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Takes the next `n` bytes, or `None` without advancing if fewer remain
    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.remaining() {
            return None;
        }
        let slice = &self.data[self.position..self.position + n];
        self.position += n;
        Some(slice)
    }

    /// Moves the position back to a previously observed value
    pub fn reset(&mut self, position: usize) {
        self.position = position.min(self.data.len());
    }
}

/// A node of a format specification tree
#[derive(Clone)]
pub enum FormatSpec {
    /// Typed leaf
    Attribute(Arc<Attribute>),
    /// Sequence of child specs
    Struct(Arc<StructSpec>),
    /// Child spec repeated a constant number of times
    FixedArray(Arc<FixedArraySpec>),
    /// Child spec repeated a bound or open-ended number of times
    VarArray(Arc<VarArraySpec>),
    /// Spec chosen at decode time
    Conditional(Arc<ConditionalSpec>),
    /// Byte range handed to a decoder and rescanned
    Encoded(Arc<EncodedSpec>),
}

impl FormatSpec {
    /// Name used in logs and errors
    pub fn name(&self) -> &str {
        match self {
            FormatSpec::Attribute(a) => a.name(),
            FormatSpec::Struct(s) => s.name(),
            FormatSpec::FixedArray(a) => a.name(),
            FormatSpec::VarArray(a) => a.name(),
            FormatSpec::Conditional(c) => c.name(),
            FormatSpec::Encoded(e) => e.name(),
        }
    }

    /// Bytes this node can probe before decoding, 0 if unknowable
    pub fn match_size(&self) -> u64 {
        match self {
            FormatSpec::Attribute(a) => a.match_size(),
            FormatSpec::Struct(s) => s.match_size(),
            FormatSpec::FixedArray(a) => a.match_size(),
            FormatSpec::VarArray(a) => a.match_size(),
            FormatSpec::Conditional(_) | FormatSpec::Encoded(_) => 0,
        }
    }

    /// Checks buffered bytes against this node, advancing `buf` only on a match
    pub fn matches(&self, buf: &mut ProbeBuffer<'_>) -> Probe {
        match self {
            FormatSpec::Attribute(a) => match_attribute(a, buf),
            FormatSpec::Struct(s) => s.matches(buf),
            FormatSpec::FixedArray(a) => a.matches(buf),
            FormatSpec::VarArray(a) => a.matches(buf),
            // Nothing to check before decode
            FormatSpec::Conditional(_) | FormatSpec::Encoded(_) => Probe::Matched,
        }
    }

    /// Probes `data` from its first byte
    pub fn probe_bytes(&self, data: &[u8]) -> Probe {
        self.matches(&mut ProbeBuffer::new(data))
    }

    /// Probes the bytes at the context's current position without consuming them
    pub fn probe_at(&self, cx: &DecodeContext<'_>) -> Result<Probe> {
        let size = self.match_size();
        if size == 0 {
            return Ok(Probe::Incomplete);
        }
        let bytes = cx.peek(size)?;
        Ok(self.probe_bytes(&bytes))
    }

    /// Decodes this node at the context's position, returning bytes consumed
    pub fn decode(&self, cx: &mut DecodeContext<'_>) -> Result<u64> {
        match self {
            FormatSpec::Attribute(a) => decode_attribute(a, cx),
            FormatSpec::Struct(s) => s.decode(cx),
            FormatSpec::FixedArray(a) => a.decode(cx),
            FormatSpec::VarArray(a) => a.decode(cx),
            FormatSpec::Conditional(c) => c.decode(cx),
            FormatSpec::Encoded(e) => e.decode(cx),
        }
    }
}

impl fmt::Debug for FormatSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self {
            FormatSpec::Attribute(_) => "Attribute",
            FormatSpec::Struct(_) => "Struct",
            FormatSpec::FixedArray(_) => "FixedArray",
            FormatSpec::VarArray(_) => "VarArray",
            FormatSpec::Conditional(_) => "Conditional",
            FormatSpec::Encoded(_) => "Encoded",
        };
        f.debug_tuple(variant).field(&self.name()).finish()
    }
}

impl From<Attribute> for FormatSpec {
    fn from(attribute: Attribute) -> Self {
        FormatSpec::Attribute(Arc::new(attribute))
    }
}

/// Shares the attribute's identity, so bindings made by this spec are
/// visible to anything referring to the original attribute.
impl From<&Attribute> for FormatSpec {
    fn from(attribute: &Attribute) -> Self {
        FormatSpec::Attribute(Arc::new(attribute.clone()))
    }
}

impl From<StructSpec> for FormatSpec {
    fn from(spec: StructSpec) -> Self {
        FormatSpec::Struct(Arc::new(spec))
    }
}

impl From<FixedArraySpec> for FormatSpec {
    fn from(spec: FixedArraySpec) -> Self {
        FormatSpec::FixedArray(Arc::new(spec))
    }
}

impl From<VarArraySpec> for FormatSpec {
    fn from(spec: VarArraySpec) -> Self {
        FormatSpec::VarArray(Arc::new(spec))
    }
}

impl From<ConditionalSpec> for FormatSpec {
    fn from(spec: ConditionalSpec) -> Self {
        FormatSpec::Conditional(Arc::new(spec))
    }
}

impl From<EncodedSpec> for FormatSpec {
    fn from(spec: EncodedSpec) -> Self {
        FormatSpec::Encoded(Arc::new(spec))
    }
}

/// Resolves a length against the context
pub(crate) fn resolve_length(length: &Length, cx: &DecodeContext<'_>) -> Result<u64> {
    match length {
        Length::Fixed(n) => Ok(*n),
        Length::Attribute(id) => cx.resolve_u64(*id),
    }
}

fn match_attribute(attribute: &Attribute, buf: &mut ProbeBuffer<'_>) -> Probe {
    let size = attribute.match_size();
    if size == 0 {
        return Probe::Matched;
    }
    let mark = buf.position();
    let Some(data) = usize::try_from(size).ok().and_then(|n| buf.take(n)) else {
        return Probe::Incomplete;
    };
    if attribute.accepts(&attribute.parse(data)) {
        Probe::Matched
    } else {
        trace!("attribute '{}' mismatched at probe offset {}", attribute.name(), mark);
        buf.reset(mark);
        Probe::Mismatch
    }
}

fn decode_attribute(attribute: &Attribute, cx: &mut DecodeContext<'_>) -> Result<u64> {
    let start = cx.position();
    let data = match attribute.kind() {
        AttributeKind::Opaque(length) => return skip_opaque(attribute, length, cx),
        AttributeKind::Integer { ty, .. } => cx.read_exact(ty.width() as u64)?,
        AttributeKind::String(length) | AttributeKind::Bytes(length) => {
            let len = resolve_length(length, cx)?;
            cx.read_exact(len)?
        }
        AttributeKind::CString { max } => read_cstring(attribute, *max, cx)?,
    };

    let value = attribute.parse(&data);
    if !attribute.accepts(&value) {
        return Err(Error::invalid_value(attribute.name(), start, value.to_string()));
    }
    trace!("{} = {} at {}", attribute.name(), value, start);

    if attribute.is_bound() {
        cx.set_attribute(attribute.id(), value.clone())?;
    }
    cx.record_section(
        start..cx.position(),
        Renderable::Value {
            name: attribute.name().to_string(),
            value,
        },
    );
    Ok(cx.position() - start)
}

fn skip_opaque(attribute: &Attribute, length: &Length, cx: &mut DecodeContext<'_>) -> Result<u64> {
    let start = cx.position();
    let len = resolve_length(length, cx)?;
    if len > cx.remaining() {
        return Err(Error::truncated(start, len, cx.remaining()));
    }
    cx.advance(len);
    trace!("{} skipped {} bytes at {}", attribute.name(), len, start);
    cx.record_section(
        start..start + len,
        Renderable::Raw {
            name: attribute.name().to_string(),
        },
    );
    Ok(len)
}

fn read_cstring(attribute: &Attribute, max: u64, cx: &mut DecodeContext<'_>) -> Result<Vec<u8>> {
    let window = cx.peek(max)?;
    match window.iter().position(|&b| b == 0) {
        Some(nul) => cx.read_exact(nul as u64 + 1),
        None if (window.len() as u64) < max => Err(Error::truncated(
            cx.position(),
            window.len() as u64 + 1,
            window.len() as u64,
        )),
        None => Err(Error::invalid_value(
            attribute.name(),
            cx.position(),
            format!("no terminator within {} bytes", max),
        )),
    }
}
