//! Hierarchical tree of decoded regions.
//!
//! Nodes are created before their content is decoded and grow as the worker
//! thread decodes: children are appended, the end offset is frozen when the
//! decode completes, and a failure may be attached. Only the worker thread
//! mutates nodes; other threads may read them at any time and must tolerate
//! children arriving after they first see a parent.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use crate::attribute::{AttributeId, Value};
use crate::error::Error;
use crate::input::Input;

/// What a result node represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A root input submitted to the scan
    Input,
    /// A region decoded by a format specification
    Format,
    /// An encoded substream materialized through the decode cache
    EncodedInput,
}

impl NodeKind {
    /// Stable lowercase label
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Input => "input",
            NodeKind::Format => "format",
            NodeKind::EncodedInput => "encoded",
        }
    }
}

/// What a recorded section should display
#[derive(Debug, Clone, PartialEq)]
pub enum Renderable {
    /// A decoded attribute value
    Value {
        /// Attribute name
        name: String,
        /// Decoded value
        value: Value,
    },
    /// A byte range skipped without reading its value
    Raw {
        /// Field name
        name: String,
    },
    /// An encoded byte range handed to a decoder
    Encoded {
        /// Stream name
        name: String,
    },
}

impl Renderable {
    /// Name of the rendered item
    pub fn name(&self) -> &str {
        match self {
            Renderable::Value { name, .. }
            | Renderable::Raw { name }
            | Renderable::Encoded { name } => name,
        }
    }
}

/// A byte range recorded during decode for later rendering
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSection {
    /// Absolute byte range in the node's input
    pub range: Range<u64>,
    /// What to render for the range
    pub renderable: Renderable,
}

/// Stable handle to a recorded section, valid for the node that recorded it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionHandle(pub(crate) usize);

impl SectionHandle {
    /// Insertion index of the section within its node
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Default)]
struct NodeState {
    end: Option<u64>,
    failure: Option<Arc<Error>>,
    children: Vec<Arc<ResultNode>>,
    attributes: HashMap<AttributeId, Option<Value>>,
    sections: Vec<ResultSection>,
}

/// An entry in the result tree
pub struct ResultNode {
    kind: NodeKind,
    name: String,
    input: Arc<dyn Input>,
    content: Option<Arc<dyn Input>>,
    start: u64,
    parent: Weak<ResultNode>,
    state: RwLock<NodeState>,
}

impl ResultNode {
    /// Creates a root node for a submitted input
    pub fn new_input(input: Arc<dyn Input>) -> Arc<Self> {
        let end = input.size();
        Arc::new(Self {
            kind: NodeKind::Input,
            name: input.name().to_string(),
            input: input.clone(),
            content: Some(input),
            start: 0,
            parent: Weak::new(),
            state: RwLock::new(NodeState {
                end: Some(end),
                ..NodeState::default()
            }),
        })
    }

    /// Appends a format node starting at `start` in the parent's content
    pub fn add_format(parent: &Arc<Self>, name: impl Into<String>, start: u64) -> Arc<Self> {
        let input = parent
            .content
            .clone()
            .unwrap_or_else(|| parent.input.clone());
        let node = Arc::new(Self {
            kind: NodeKind::Format,
            name: name.into(),
            input,
            content: None,
            start,
            parent: Arc::downgrade(parent),
            state: RwLock::new(NodeState::default()),
        });
        parent.push_child(node.clone());
        node
    }

    /// Appends a node for a decoded substream occupying `span` of the parent's input
    pub fn add_encoded(
        parent: &Arc<Self>,
        name: impl Into<String>,
        span: Range<u64>,
        content: Arc<dyn Input>,
    ) -> Arc<Self> {
        let node = Arc::new(Self {
            kind: NodeKind::EncodedInput,
            name: name.into(),
            input: parent.input.clone(),
            content: Some(content),
            start: span.start,
            parent: Arc::downgrade(parent),
            state: RwLock::new(NodeState {
                end: Some(span.end),
                ..NodeState::default()
            }),
        });
        parent.push_child(node.clone());
        node
    }

    fn read_state(&self) -> RwLockReadGuard<'_, NodeState> {
        // Node state holds no invariants a panicking writer could break
        // halfway, so a poisoned lock is still readable.
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn push_child(&self, child: Arc<ResultNode>) {
        self.write_state().children.push(child);
    }

    /// Node kind
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input the node's span refers to
    pub fn input(&self) -> &Arc<dyn Input> {
        &self.input
    }

    /// Input to scan for this node, for input and encoded-input nodes
    pub fn content(&self) -> Option<&Arc<dyn Input>> {
        self.content.as_ref()
    }

    /// Absolute start offset in [`input`](Self::input)
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Absolute end offset, `None` while the decode is pending
    pub fn end(&self) -> Option<u64> {
        self.read_state().end
    }

    /// Span of the node once its decode has completed
    pub fn span(&self) -> Option<Range<u64>> {
        self.end().map(|end| self.start..end)
    }

    /// Whether the node's decode has completed
    pub fn is_complete(&self) -> bool {
        self.end().is_some()
    }

    /// Decode failure attached to this node
    pub fn failure(&self) -> Option<Arc<Error>> {
        self.read_state().failure.clone()
    }

    /// Parent node, `None` for roots
    pub fn parent(&self) -> Option<Arc<ResultNode>> {
        self.parent.upgrade()
    }

    /// Snapshot of the current children
    pub fn children(&self) -> Vec<Arc<ResultNode>> {
        self.read_state().children.clone()
    }

    /// Number of children appended so far
    pub fn child_count(&self) -> usize {
        self.read_state().children.len()
    }

    /// Value committed for `id` in this node's scope
    pub fn attribute(&self, id: AttributeId) -> Option<Value> {
        self.read_state().attributes.get(&id).cloned().flatten()
    }

    /// Snapshot of the recorded sections, in insertion order
    pub fn sections(&self) -> Vec<ResultSection> {
        self.read_state().sections.clone()
    }

    /// Looks up a section by the handle returned when it was recorded
    pub fn section(&self, handle: SectionHandle) -> Option<ResultSection> {
        self.read_state().sections.get(handle.0).cloned()
    }

    /// Number of ancestors, 0 for roots
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(node) = current {
            depth += 1;
            current = node.parent();
        }
        depth
    }

    /// Number of encoded-input nodes on the path from the root to this node
    pub fn encoded_depth(&self) -> usize {
        let mut depth = usize::from(self.kind == NodeKind::EncodedInput);
        let mut current = self.parent();
        while let Some(node) = current {
            if node.kind == NodeKind::EncodedInput {
                depth += 1;
            }
            current = node.parent();
        }
        depth
    }

    /// Names from the root down to this node
    pub fn path(&self) -> Vec<String> {
        let mut names = vec![self.name.clone()];
        let mut current = self.parent();
        while let Some(node) = current {
            names.push(node.name.clone());
            current = node.parent();
        }
        names.reverse();
        names
    }

    /// Attaches a failure without touching the span
    pub fn set_failure(&self, failure: Error) {
        self.write_state().failure = Some(Arc::new(failure));
    }

    /// Freezes the node after decode: end offset, scope contents and failure.
    pub(crate) fn commit(
        &self,
        end: u64,
        attributes: HashMap<AttributeId, Option<Value>>,
        sections: Vec<ResultSection>,
        failure: Option<Error>,
    ) {
        let mut state = self.write_state();
        state.end = Some(end.max(self.start));
        state.attributes.extend(attributes);
        state.sections.extend(sections);
        if let Some(failure) = failure {
            state.failure = Some(Arc::new(failure));
        }
    }

    /// Visits this node and all descendants depth-first, pre-order
    pub fn walk(self: &Arc<Self>, visit: &mut dyn FnMut(&Arc<ResultNode>, usize)) {
        fn go(node: &Arc<ResultNode>, depth: usize, visit: &mut dyn FnMut(&Arc<ResultNode>, usize)) {
            visit(node, depth);
            for child in node.children() {
                go(&child, depth + 1, visit);
            }
        }
        go(self, 0, visit);
    }
}

impl fmt::Debug for ResultNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read_state();
        f.debug_struct("ResultNode")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("start", &self.start)
            .field("end", &state.end)
            .field("failure", &state.failure)
            .field("children", &state.children.len())
            .finish()
    }
}

/// Roots of a scan session's result tree
#[derive(Debug, Default)]
pub struct ResultTree {
    roots: RwLock<Vec<Arc<ResultNode>>>,
}

impl ResultTree {
    /// Creates an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a root node for a submitted input
    pub fn add_input(&self, input: Arc<dyn Input>) -> Arc<ResultNode> {
        let node = ResultNode::new_input(input);
        self.roots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(node.clone());
        node
    }

    /// Snapshot of the root nodes
    pub fn roots(&self) -> Vec<Arc<ResultNode>> {
        self.roots.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Visits every node of every root depth-first
    pub fn walk(&self, visit: &mut dyn FnMut(&Arc<ResultNode>, usize)) {
        for root in self.roots() {
            root.walk(visit);
        }
    }

    /// Total number of nodes currently in the tree
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_, _| count += 1);
        count
    }

    /// Whether no input has been added
    pub fn is_empty(&self) -> bool {
        self.roots().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::MemoryInput;
    use pretty_assertions::assert_eq;

    fn memory(name: &str, data: &[u8]) -> Arc<dyn Input> {
        Arc::new(MemoryInput::new(name, data.to_vec()))
    }

    #[test]
    fn test_input_node_span() {
        let tree = ResultTree::new();
        let root = tree.add_input(memory("a.bin", &[0; 10]));
        assert_eq!(root.kind(), NodeKind::Input);
        assert_eq!(root.span(), Some(0..10));
        assert!(root.parent().is_none());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_format_node_pending_until_commit() {
        let root = ResultNode::new_input(memory("a.bin", &[0; 10]));
        let format = ResultNode::add_format(&root, "zip", 0);
        assert!(!format.is_complete());
        assert_eq!(root.child_count(), 1);

        format.commit(6, HashMap::new(), Vec::new(), None);
        assert_eq!(format.span(), Some(0..6));
        assert!(format.failure().is_none());
    }

    #[test]
    fn test_encoded_depth_and_path() {
        let root = ResultNode::new_input(memory("outer.zip", &[0; 32]));
        let format = ResultNode::add_format(&root, "zip", 0);
        let inner = ResultNode::add_encoded(&format, "inner.gz", 4..20, memory("inner", &[0; 8]));
        let inner_format = ResultNode::add_format(&inner, "gzip", 0);

        assert_eq!(root.depth(), 0);
        assert_eq!(inner_format.depth(), 3);
        assert_eq!(root.encoded_depth(), 0);
        assert_eq!(inner.encoded_depth(), 1);
        assert_eq!(inner_format.encoded_depth(), 1);
        assert_eq!(inner_format.path(), vec!["outer.zip", "zip", "inner.gz", "gzip"]);
        assert_eq!(inner.span(), Some(4..20));
        assert_eq!(inner_format.input().size(), 8);
    }

    #[test]
    fn test_sections_by_handle() {
        let root = ResultNode::new_input(memory("a.bin", &[0; 4]));
        let section = ResultSection {
            range: 0..2,
            renderable: Renderable::Value {
                name: "magic".into(),
                value: Value::Unsigned(1),
            },
        };
        root.commit(4, HashMap::new(), vec![section.clone()], None);
        assert_eq!(root.section(SectionHandle(0)), Some(section));
        assert_eq!(root.section(SectionHandle(1)), None);
    }

    #[test]
    fn test_walk_order() {
        let root = ResultNode::new_input(memory("a", &[0; 4]));
        let first = ResultNode::add_format(&root, "first", 0);
        ResultNode::add_format(&first, "nested", 0);
        ResultNode::add_format(&root, "second", 2);

        let mut seen = Vec::new();
        root.walk(&mut |node, depth| seen.push((node.name().to_string(), depth)));
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), 0),
                ("first".to_string(), 1),
                ("nested".to_string(), 2),
                ("second".to_string(), 1),
            ]
        );
    }
}
