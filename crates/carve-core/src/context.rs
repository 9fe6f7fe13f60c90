//! Scoped state threaded through a decode pass.
//!
//! A [`DecodeContext`] holds a stack of frames mirroring the result tree
//! ancestry of whatever is being decoded. Result frames belong to a
//! [`ResultNode`] and collect its attributes and recorded sections; scope
//! frames are opened by structs that declare attributes without being result
//! boundaries and are discarded when the struct finishes.
//!
//! Attribute lookups only walk the ancestor chain: the frame stack from the
//! top down, then the committed attributes of the root node's ancestors in
//! the result tree. Sibling subtrees are never visited because their frames
//! have already been popped.

use std::collections::HashMap;
use std::mem;
use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::attribute::{AttributeId, Value};
use crate::cache::DecodeCache;
use crate::error::{Error, Result};
use crate::input::{read_fully, Input};
use crate::result::{Renderable, ResultNode, ResultSection, SectionHandle};

/// What `set_attribute` does when no frame in scope declared the attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndeclaredWrite {
    /// Bind the value in the current frame as if it had been declared there.
    ///
    /// Format specs rely on this for attributes that are only ever read by
    /// siblings within the same struct.
    #[default]
    DeclareLocal,
    /// Fail with [`Error::UndeclaredAttribute`]
    Reject,
}

enum FrameKind {
    Result(Arc<ResultNode>),
    Scope,
}

struct Frame {
    kind: FrameKind,
    attributes: HashMap<AttributeId, Option<Value>>,
    sections: Vec<ResultSection>,
}

impl Frame {
    fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            attributes: HashMap::new(),
            sections: Vec::new(),
        }
    }
}

/// Decode state for one pass over one input
pub struct DecodeContext<'a> {
    input: Arc<dyn Input>,
    position: u64,
    frames: Vec<Frame>,
    cache: Option<&'a DecodeCache>,
    policy: UndeclaredWrite,
    discovered: Vec<Arc<ResultNode>>,
    failures: usize,
    stream_failures: usize,
}

impl<'a> DecodeContext<'a> {
    /// Creates a context decoding into `node`, starting at its start offset
    pub fn new(node: Arc<ResultNode>) -> Self {
        let input = node
            .content()
            .cloned()
            .unwrap_or_else(|| node.input().clone());
        let position = node.start();
        Self {
            input,
            position,
            frames: vec![Frame::new(FrameKind::Result(node))],
            cache: None,
            policy: UndeclaredWrite::default(),
            discovered: Vec::new(),
            failures: 0,
            stream_failures: 0,
        }
    }

    /// Attaches the decode cache used by encoded specs
    pub fn with_cache(mut self, cache: &'a DecodeCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the policy for writes to undeclared attributes
    pub fn with_policy(mut self, policy: UndeclaredWrite) -> Self {
        self.policy = policy;
        self
    }

    /// Input being decoded
    pub fn input(&self) -> &Arc<dyn Input> {
        &self.input
    }

    /// Current absolute position in the input
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left between the position and the end of the input
    pub fn remaining(&self) -> u64 {
        self.input.size().saturating_sub(self.position)
    }

    /// Whether the position has reached the end of the input
    pub fn at_end(&self) -> bool {
        self.remaining() == 0
    }

    /// Decode cache, if one is attached
    pub fn cache(&self) -> Option<&'a DecodeCache> {
        self.cache
    }

    /// Number of result nodes that failed during this pass
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Number of decoded streams that failed without ending their parent
    pub fn stream_failures(&self) -> usize {
        self.stream_failures
    }

    /// Counts a stream failure that decoding continued past
    pub(crate) fn note_stream_failure(&mut self) {
        self.stream_failures += 1;
    }

    /// Moves the position forward by `n` bytes
    pub fn advance(&mut self, n: u64) {
        self.position = self.position.saturating_add(n);
    }

    /// Reads `len` bytes at the position without advancing.
    ///
    /// Returns fewer bytes only at the end of the input.
    pub fn peek(&self, len: u64) -> Result<Vec<u8>> {
        let len = len.min(self.remaining());
        let mut buf = vec![0u8; len as usize];
        let n = read_fully(self.input.as_ref(), &mut buf, self.position)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Reads exactly `len` bytes at the position and advances past them
    pub fn read_exact(&mut self, len: u64) -> Result<Vec<u8>> {
        let available = self.remaining();
        if len > available {
            return Err(Error::truncated(self.position, len, available));
        }
        let buf = self.peek(len)?;
        if (buf.len() as u64) < len {
            return Err(Error::truncated(self.position, len, buf.len() as u64));
        }
        self.position += len;
        Ok(buf)
    }

    /// Result node of the innermost result frame
    pub fn current_node(&self) -> &Arc<ResultNode> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| match &frame.kind {
                FrameKind::Result(node) => Some(node),
                FrameKind::Scope => None,
            })
            .unwrap_or_else(|| unreachable!("the root frame is always a result frame"))
    }

    /// Registers an unbound slot for `id` in the current frame
    pub fn declare_attribute(&mut self, id: AttributeId) {
        self.top_mut().attributes.entry(id).or_insert(None);
    }

    /// Binds `value` to `id` in the nearest frame that declared it.
    ///
    /// When no frame in the stack declared `id`, the outcome depends on the
    /// [`UndeclaredWrite`] policy.
    pub fn set_attribute(&mut self, id: AttributeId, value: Value) -> Result<()> {
        if let Some(frame) = self
            .frames
            .iter_mut()
            .rev()
            .find(|frame| frame.attributes.contains_key(&id))
        {
            frame.attributes.insert(id, Some(value));
            return Ok(());
        }

        match self.policy {
            UndeclaredWrite::DeclareLocal => {
                trace!("implicitly declaring attribute {} in current frame", id);
                self.top_mut().attributes.insert(id, Some(value));
                Ok(())
            }
            UndeclaredWrite::Reject => Err(Error::undeclared_attribute(id.to_string())),
        }
    }

    /// First bound value for `id` on the ancestor chain
    pub fn get_attribute(&self, id: AttributeId) -> Option<Value> {
        for frame in self.frames.iter().rev() {
            if let Some(Some(value)) = frame.attributes.get(&id) {
                return Some(value.clone());
            }
        }

        // Frames of enclosing inputs were committed to their nodes
        let mut ancestor = self.root_node().parent();
        while let Some(node) = ancestor {
            if let Some(value) = node.attribute(id) {
                return Some(value);
            }
            ancestor = node.parent();
        }
        None
    }

    /// Bound value for `id` as an integer, or an unresolved-attribute error
    pub fn resolve_u64(&self, id: AttributeId) -> Result<u64> {
        self.get_attribute(id)
            .and_then(|value| value.as_u64())
            .ok_or_else(|| Error::unresolved_attribute(id.to_string()))
    }

    /// Records a section on the innermost result frame
    pub fn record_section(&mut self, range: Range<u64>, renderable: Renderable) -> SectionHandle {
        let frame = self
            .frames
            .iter_mut()
            .rev()
            .find(|frame| matches!(frame.kind, FrameKind::Result(_)))
            .unwrap_or_else(|| unreachable!("the root frame is always a result frame"));
        frame.sections.push(ResultSection { range, renderable });
        SectionHandle(frame.sections.len() - 1)
    }

    /// Opens a result node named `name` at the current position
    pub fn enter_result(&mut self, name: &str) -> Arc<ResultNode> {
        let node = ResultNode::add_format(self.current_node(), name, self.position);
        trace!("entering result '{}' at {}", name, self.position);
        self.frames.push(Frame::new(FrameKind::Result(node.clone())));
        node
    }

    /// Closes the innermost frame, which must be a result frame.
    ///
    /// The node's span ends at the current position; its attributes and
    /// sections are committed and `failure`, if any, is attached.
    pub fn leave_result(&mut self, failure: Option<Error>) {
        if self.frames.len() <= 1 {
            return;
        }
        if let Some(frame) = self.frames.pop() {
            self.commit(frame, failure);
        }
    }

    /// Opens an anonymous scope for struct-local declarations
    pub fn push_scope(&mut self) {
        self.frames.push(Frame::new(FrameKind::Scope));
    }

    /// Closes the innermost scope frame, discarding its attributes
    pub fn pop_scope(&mut self) {
        if self.frames.len() > 1 && matches!(self.top_mut().kind, FrameKind::Scope) {
            self.frames.pop();
        }
    }

    /// Creates an encoded-input node for a decoded stream and schedules it
    pub fn add_encoded(
        &mut self,
        name: &str,
        span: Range<u64>,
        content: Arc<dyn Input>,
    ) -> Arc<ResultNode> {
        let node = ResultNode::add_encoded(self.current_node(), name, span, content);
        self.discovered.push(node.clone());
        node
    }

    /// Ends the pass: closes every open frame and returns discovered inputs.
    ///
    /// `failure` is attached to the root node.
    pub fn finish(mut self, failure: Option<Error>) -> Vec<Arc<ResultNode>> {
        while self.frames.len() > 1 {
            if let Some(frame) = self.frames.pop() {
                self.commit(frame, None);
            }
        }
        if let Some(root) = self.frames.pop() {
            self.commit(root, failure);
        }
        debug!(
            "decode pass finished at {} with {} discovered input(s)",
            self.position,
            self.discovered.len()
        );
        mem::take(&mut self.discovered)
    }

    fn commit(&mut self, mut frame: Frame, failure: Option<Error>) {
        let FrameKind::Result(node) = &frame.kind else {
            return;
        };
        if failure.is_some() {
            self.failures += 1;
        }
        node.commit(
            self.position,
            mem::take(&mut frame.attributes),
            mem::take(&mut frame.sections),
            failure,
        );
    }

    fn top_mut(&mut self) -> &mut Frame {
        self.frames
            .last_mut()
            .unwrap_or_else(|| unreachable!("the root frame is never popped while decoding"))
    }

    fn root_node(&self) -> &Arc<ResultNode> {
        match self.frames.first().map(|frame| &frame.kind) {
            Some(FrameKind::Result(node)) => node,
            _ => unreachable!("the root frame is always a result frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use crate::input::MemoryInput;
    use pretty_assertions::assert_eq;

    fn root(data: &[u8]) -> Arc<ResultNode> {
        let input: Arc<dyn Input> = Arc::new(MemoryInput::new("test", data.to_vec()));
        let root = ResultNode::new_input(input);
        ResultNode::add_format(&root, "format", 0)
    }

    #[test]
    fn test_declared_in_outer_set_in_inner_visible_to_sibling() {
        let name_len = Attribute::u16_le("name length").bind();
        let mut cx = DecodeContext::new(root(&[0; 8]));

        cx.push_scope();
        cx.declare_attribute(name_len.id());
        {
            // inner child sets the value
            cx.push_scope();
            cx.set_attribute(name_len.id(), Value::Unsigned(5)).unwrap();
            cx.pop_scope();
        }
        // sibling of the inner child reads it
        assert_eq!(cx.get_attribute(name_len.id()), Some(Value::Unsigned(5)));
        cx.pop_scope();

        assert_eq!(cx.get_attribute(name_len.id()), None);
    }

    #[test]
    fn test_sibling_scopes_are_isolated() {
        let attr = Attribute::u8("flag").bind();
        let mut cx = DecodeContext::new(root(&[0; 8]));

        cx.push_scope();
        cx.declare_attribute(attr.id());
        cx.set_attribute(attr.id(), Value::Unsigned(1)).unwrap();
        cx.pop_scope();

        cx.push_scope();
        assert_eq!(cx.get_attribute(attr.id()), None);
        cx.pop_scope();
    }

    #[test]
    fn test_undeclared_write_policy() {
        let attr = Attribute::u8("implicit").bind();

        let mut cx = DecodeContext::new(root(&[0; 8]));
        cx.push_scope();
        cx.set_attribute(attr.id(), Value::Unsigned(3)).unwrap();
        assert_eq!(cx.resolve_u64(attr.id()).unwrap(), 3);
        cx.pop_scope();
        assert!(cx.resolve_u64(attr.id()).is_err());

        let mut strict = DecodeContext::new(root(&[0; 8])).with_policy(UndeclaredWrite::Reject);
        let err = strict.set_attribute(attr.id(), Value::Unsigned(3)).unwrap_err();
        assert!(matches!(err, Error::UndeclaredAttribute { .. }));
    }

    #[test]
    fn test_result_frames_commit_to_nodes() {
        let attr = Attribute::u8("kind").bind();
        let format = root(&[0; 8]);
        let mut cx = DecodeContext::new(format.clone());

        let entry = cx.enter_result("entry");
        cx.declare_attribute(attr.id());
        cx.set_attribute(attr.id(), Value::Unsigned(9)).unwrap();
        cx.advance(3);
        let handle = cx.record_section(
            0..3,
            Renderable::Value {
                name: "kind".into(),
                value: Value::Unsigned(9),
            },
        );
        assert!(!entry.is_complete());
        cx.leave_result(None);

        assert_eq!(entry.span(), Some(0..3));
        assert_eq!(entry.attribute(attr.id()), Some(Value::Unsigned(9)));
        assert_eq!(entry.section(handle).map(|s| s.range), Some(0..3));
        assert_eq!(format.child_count(), 1);

        let discovered = cx.finish(None);
        assert!(discovered.is_empty());
        assert_eq!(format.span(), Some(0..3));
    }

    #[test]
    fn test_lookup_falls_back_to_committed_ancestors() {
        let file_name = Attribute::string("file name", crate::attribute::Length::Fixed(4)).bind();
        let outer = root(b"outer data");
        let mut cx = DecodeContext::new(outer.clone());
        cx.set_attribute(file_name.id(), Value::from("a.gz")).unwrap();
        let inner_input: Arc<dyn Input> = Arc::new(MemoryInput::new("inner", b"xyz".to_vec()));
        let encoded = cx.add_encoded("a.gz", 0..4, inner_input);
        let discovered = cx.finish(None);
        assert_eq!(discovered.len(), 1);

        let inner_format = ResultNode::add_format(&encoded, "gzip", 0);
        let inner = DecodeContext::new(inner_format);
        assert_eq!(inner.input().size(), 3);
        assert_eq!(inner.get_attribute(file_name.id()), Some(Value::from("a.gz")));
    }

    #[test]
    fn test_read_exact_truncation() {
        let mut cx = DecodeContext::new(root(&[1, 2, 3]));
        assert_eq!(cx.read_exact(2).unwrap(), vec![1, 2]);
        let err = cx.read_exact(2).unwrap_err();
        assert!(matches!(err, Error::Truncated { offset: 2, needed: 2, available: 1 }));
        assert_eq!(cx.position(), 2);
    }
}
