//! Sequential and repeated specs.

use tracing::{trace, warn};

use super::{FormatSpec, Probe, ProbeBuffer};
use crate::attribute::{Attribute, AttributeId};
use crate::context::DecodeContext;
use crate::error::{Error, Result};

/// Sequence of child specs, probed and decoded in order.
///
/// A struct may declare attributes that its children bind and read, and may
/// be a result boundary, in which case decoding it creates a result node
/// covering its span. Decode failures inside a result boundary are attached
/// to that node and do not propagate to the enclosing spec.
#[derive(Debug, Clone)]
pub struct StructSpec {
    name: String,
    result: bool,
    declarations: Vec<AttributeId>,
    children: Vec<FormatSpec>,
}

impl StructSpec {
    /// Creates an empty struct
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: false,
            declarations: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Makes this struct a result boundary
    pub fn result(mut self) -> Self {
        self.result = true;
        self
    }

    /// Declares `attribute` in this struct's scope
    pub fn declare(mut self, attribute: &Attribute) -> Self {
        self.declarations.push(attribute.id());
        self
    }

    /// Appends a child spec
    pub fn child(mut self, spec: impl Into<FormatSpec>) -> Self {
        self.children.push(spec.into());
        self
    }

    /// Appends several child specs
    pub fn children<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<FormatSpec>,
    {
        self.children.extend(specs.into_iter().map(Into::into));
        self
    }

    /// Struct name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether decoding creates a result node
    pub fn is_result(&self) -> bool {
        self.result
    }

    /// Sum of the children's match sizes up to the first variable-size child
    pub fn match_size(&self) -> u64 {
        let mut total = 0u64;
        for child in &self.children {
            let size = child.match_size();
            if size == 0 {
                break;
            }
            total = total.saturating_add(size);
        }
        total
    }

    pub(super) fn matches(&self, buf: &mut ProbeBuffer<'_>) -> Probe {
        let mark = buf.position();
        for child in &self.children {
            if child.match_size() == 0 {
                break;
            }
            let outcome = child.matches(buf);
            if !outcome.is_match() {
                buf.reset(mark);
                return outcome;
            }
        }
        Probe::Matched
    }

    pub(super) fn decode(&self, cx: &mut DecodeContext<'_>) -> Result<u64> {
        let start = cx.position();

        if self.result {
            cx.enter_result(&self.name);
        } else if !self.declarations.is_empty() {
            cx.push_scope();
        }
        for id in &self.declarations {
            cx.declare_attribute(*id);
        }

        let outcome = self.decode_children(cx);

        if self.result {
            return match outcome {
                Ok(_) => {
                    cx.leave_result(None);
                    Ok(cx.position() - start)
                }
                Err(e) if e.is_fatal() => {
                    cx.leave_result(None);
                    Err(e)
                }
                Err(e) => {
                    warn!("'{}' at {} failed: {}", self.name, start, e);
                    cx.leave_result(Some(e));
                    Ok(cx.position() - start)
                }
            };
        }
        if !self.declarations.is_empty() {
            cx.pop_scope();
        }
        outcome
    }

    fn decode_children(&self, cx: &mut DecodeContext<'_>) -> Result<u64> {
        let mut consumed = 0u64;
        for child in &self.children {
            consumed += child.decode(cx)?;
        }
        Ok(consumed)
    }
}

/// A child spec repeated a constant number of times
#[derive(Debug, Clone)]
pub struct FixedArraySpec {
    name: String,
    count: u64,
    element: FormatSpec,
}

impl FixedArraySpec {
    /// Repeats `element` exactly `count` times
    pub fn new(name: impl Into<String>, count: u64, element: impl Into<FormatSpec>) -> Self {
        Self {
            name: name.into(),
            count,
            element: element.into(),
        }
    }

    /// Array name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of repetitions
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Element size times count, 0 if the element size is unknowable
    pub fn match_size(&self) -> u64 {
        self.element.match_size().saturating_mul(self.count)
    }

    pub(super) fn matches(&self, buf: &mut ProbeBuffer<'_>) -> Probe {
        repeat_matches(&self.element, self.count, buf)
    }

    pub(super) fn decode(&self, cx: &mut DecodeContext<'_>) -> Result<u64> {
        let mut consumed = 0u64;
        for _ in 0..self.count {
            consumed += self.element.decode(cx)?;
        }
        Ok(consumed)
    }
}

/// How many times a [`VarArraySpec`] repeats its element
#[derive(Debug, Clone)]
pub enum Repeat {
    /// As many times as a previously bound attribute says
    Counted(AttributeId),
    /// Until `terminal` matches at the position (not consumed), or the input ends
    Until(FormatSpec),
    /// Until the input ends
    ToEnd,
}

/// A child spec repeated a decode-time number of times
#[derive(Debug, Clone)]
pub struct VarArraySpec {
    name: String,
    repeat: Repeat,
    element: FormatSpec,
    min: u64,
}

impl VarArraySpec {
    /// Repeats `element` as many times as `count` is bound to
    pub fn counted(name: impl Into<String>, count: &Attribute, element: impl Into<FormatSpec>) -> Self {
        Self {
            name: name.into(),
            repeat: Repeat::Counted(count.id()),
            element: element.into(),
            min: 0,
        }
    }

    /// Repeats `element` at least once, until `terminal` matches
    pub fn until(
        name: impl Into<String>,
        element: impl Into<FormatSpec>,
        terminal: impl Into<FormatSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            repeat: Repeat::Until(terminal.into()),
            element: element.into(),
            min: 1,
        }
    }

    /// Repeats `element` until the input ends
    pub fn to_end(name: impl Into<String>, element: impl Into<FormatSpec>) -> Self {
        Self {
            name: name.into(),
            repeat: Repeat::ToEnd,
            element: element.into(),
            min: 0,
        }
    }

    /// Sets the minimum number of elements for open-ended modes
    pub fn min(mut self, min: u64) -> Self {
        self.min = min;
        self
    }

    /// Array name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Repetition mode
    pub fn repeat(&self) -> &Repeat {
        &self.repeat
    }

    /// Size of the mandatory leading elements, 0 for counted arrays
    pub fn match_size(&self) -> u64 {
        match self.repeat {
            Repeat::Counted(_) => 0,
            Repeat::Until(_) | Repeat::ToEnd => self.element.match_size().saturating_mul(self.min),
        }
    }

    pub(super) fn matches(&self, buf: &mut ProbeBuffer<'_>) -> Probe {
        match self.repeat {
            Repeat::Counted(_) => Probe::Matched,
            Repeat::Until(_) | Repeat::ToEnd => repeat_matches(&self.element, self.min, buf),
        }
    }

    pub(super) fn decode(&self, cx: &mut DecodeContext<'_>) -> Result<u64> {
        match &self.repeat {
            Repeat::Counted(id) => {
                let count = cx.resolve_u64(*id)?;
                trace!("'{}' repeats {} times", self.name, count);
                let mut consumed = 0u64;
                for _ in 0..count {
                    let n = self.element.decode(cx)?;
                    // A bound count is untrusted; repeating a zero-width element
                    // cannot consume anything further.
                    if n == 0 {
                        break;
                    }
                    consumed += n;
                }
                Ok(consumed)
            }
            Repeat::Until(terminal) => self.decode_open(cx, Some(terminal)),
            Repeat::ToEnd => self.decode_open(cx, None),
        }
    }

    fn decode_open(&self, cx: &mut DecodeContext<'_>, terminal: Option<&FormatSpec>) -> Result<u64> {
        let start = cx.position();
        let mut count = 0u64;

        while !cx.at_end() {
            if count >= self.min {
                if let Some(terminal) = terminal {
                    if terminal.probe_at(cx)?.is_match() {
                        trace!("'{}' reached '{}' after {} elements", self.name, terminal.name(), count);
                        break;
                    }
                }
            }

            let failures = cx.failures();
            let n = self.element.decode(cx)?;
            count += 1;
            // A failed element leaves the position unreliable
            if n == 0 || cx.failures() > failures {
                break;
            }
        }

        if count < self.min {
            return Err(Error::truncated(
                cx.position(),
                self.element.match_size().max(1),
                cx.remaining(),
            ));
        }
        Ok(cx.position() - start)
    }
}

fn repeat_matches(element: &FormatSpec, count: u64, buf: &mut ProbeBuffer<'_>) -> Probe {
    if element.match_size() == 0 {
        return Probe::Matched;
    }
    let mark = buf.position();
    for _ in 0..count {
        let outcome = element.matches(buf);
        if !outcome.is_match() {
            buf.reset(mark);
            return outcome;
        }
    }
    Probe::Matched
}
