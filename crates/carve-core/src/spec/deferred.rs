//! Specs whose shape is only known at decode time.

use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::trace;

use super::{resolve_length, FormatSpec};
use crate::attribute::{Attribute, AttributeId, Length};
use crate::context::DecodeContext;
use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::input::Input;
use crate::result::Renderable;

/// Chooses a spec from the values bound so far; `None` skips the node
pub type SpecSupplier = Arc<dyn Fn(&DecodeContext<'_>) -> Option<FormatSpec> + Send + Sync>;

/// Chooses a decoder from the values bound so far
pub type DecoderFactory = Arc<dyn Fn(&DecodeContext<'_>) -> Box<dyn Decoder> + Send + Sync>;

/// Spec supplied lazily at decode time.
///
/// The supplier runs when the node is decoded, never while probing, so it can
/// consult attributes bound earlier in the same structure. A supplier that
/// returns `None` contributes zero bytes; that is not a failure.
#[derive(Clone)]
pub struct ConditionalSpec {
    name: String,
    supplier: SpecSupplier,
}

impl ConditionalSpec {
    /// Creates a conditional node
    pub fn new<F>(name: impl Into<String>, supplier: F) -> Self
    where
        F: Fn(&DecodeContext<'_>) -> Option<FormatSpec> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            supplier: Arc::new(supplier),
        }
    }

    /// Includes `spec` only when `flag` is bound and has any bit of `mask` set
    pub fn when_flag(name: impl Into<String>, flag: &Attribute, mask: u64, spec: impl Into<FormatSpec>) -> Self {
        let id = flag.id();
        let spec = spec.into();
        Self::new(name, move |cx| {
            let bits = cx.get_attribute(id)?.as_u64()?;
            (bits & mask != 0).then(|| spec.clone())
        })
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn decode(&self, cx: &mut DecodeContext<'_>) -> Result<u64> {
        match (self.supplier)(cx) {
            Some(spec) => spec.decode(cx),
            None => {
                trace!("'{}' absent at {}", self.name, cx.position());
                Ok(0)
            }
        }
    }
}

impl fmt::Debug for ConditionalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionalSpec")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Byte range handed to a decoder.
///
/// Decoding materializes the decoded stream in the decode cache, adds an
/// encoded-input node for it and schedules it for scanning. With a known
/// length the spec consumes exactly that many bytes; without one it consumes
/// whatever the decoder reports having used.
#[derive(Clone)]
pub struct EncodedSpec {
    name: String,
    length: Option<Length>,
    name_from: Option<AttributeId>,
    decoder: DecoderFactory,
}

impl EncodedSpec {
    /// Creates an encoded node using the decoder chosen by `decoder`
    pub fn new<F>(name: impl Into<String>, decoder: F) -> Self
    where
        F: Fn(&DecodeContext<'_>) -> Box<dyn Decoder> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            length: None,
            name_from: None,
            decoder: Arc::new(decoder),
        }
    }

    /// Bounds the encoded range
    pub fn length(mut self, length: Length) -> Self {
        self.length = Some(length);
        self
    }

    /// Names the decoded stream after the bound text value of `attribute`
    pub fn name_from(mut self, attribute: &Attribute) -> Self {
        self.name_from = Some(attribute.id());
        self
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn decode(&self, cx: &mut DecodeContext<'_>) -> Result<u64> {
        let start = cx.position();
        let limit = match &self.length {
            Some(length) => {
                let limit = resolve_length(length, cx)?;
                if limit > cx.remaining() {
                    return Err(Error::truncated(start, limit, cx.remaining()));
                }
                Some(limit)
            }
            None => None,
        };

        let cache = cx
            .cache()
            .ok_or_else(|| Error::internal(format!("'{}' decoded without a decode cache", self.name)))?;
        let name = self
            .name_from
            .and_then(|id| cx.get_attribute(id))
            .and_then(|value| value.as_str().map(str::to_string))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.name.clone());
        let decoder = (self.decoder)(cx);
        trace!("decoding '{}' at {} with {}", name, start, decoder.name());

        let range = cache.decode_input(name.clone(), cx.input(), start, limit, decoder)?;
        let consumed = limit.unwrap_or(range.consumed);
        let end = start + consumed;
        let failure = range
            .input
            .failure()
            .map(|e| io::Error::new(e.kind(), e.to_string()));

        let content: Arc<dyn Input> = range.input;
        let node = cx.add_encoded(&name, start..end, content);
        cx.record_section(start..end, Renderable::Encoded { name: name.clone() });
        cx.advance(consumed);

        if let Some(e) = failure {
            node.set_failure(Error::decode(&name, io::Error::new(e.kind(), e.to_string())));
            // Without a declared length the end of the stream is unknown, so
            // nothing after it can be decoded reliably.
            if limit.is_none() {
                return Err(Error::decode(name, e));
            }
            cx.note_stream_failure();
        }
        Ok(consumed)
    }
}

impl fmt::Debug for EncodedSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedSpec")
            .field("name", &self.name)
            .field("length", &self.length)
            .field("name_from", &self.name_from)
            .finish_non_exhaustive()
    }
}
