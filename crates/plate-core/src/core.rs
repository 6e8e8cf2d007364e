use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::markers::{MarkerId, MarkerRange, RangeMarkers};
use crate::ops::{Op, Transaction};
use crate::plugin::{CommandError, PluginRegistry, QueryError};

pub type Path = Vec<usize>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Carried by freshly built nodes until the editor hands them a real id.
    pub const UNASSIGNED: NodeId = NodeId(0);
    pub const ROOT: NodeId = NodeId(1);

    pub fn is_assigned(self) -> bool {
        self != Self::UNASSIGNED
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn starting_after(doc: &Document) -> Self {
        Self {
            next: doc.max_id().0.max(NodeId::ROOT.0) + 1,
        }
    }

    pub fn fresh(&mut self) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;
        id
    }

    fn assign(&mut self, node: &mut Node) {
        if !node.id().is_assigned() {
            node.set_id(self.fresh());
        }
        if let Node::Element(el) = node {
            for child in &mut el.children {
                self.assign(child);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Paragraph,
    Heading { level: u8 },
    List { ordered: bool },
    ListItem,
    Quote,
    Code,
}

impl BlockKind {
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::Paragraph => "paragraph",
            BlockKind::Heading { .. } => "heading",
            BlockKind::List { .. } => "list",
            BlockKind::ListItem => "list_item",
            BlockKind::Quote => "quote",
            BlockKind::Code => "code",
        }
    }

    /// Text blocks hold text leaves only; every other kind holds blocks.
    pub fn is_text_block(&self) -> bool {
        !self.is_list()
    }

    pub fn is_list(&self) -> bool {
        matches!(self, BlockKind::List { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Document {
    #[serde(default)]
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Element(ElementNode),
    Text(TextNode),
}

impl Node {
    pub fn id(&self) -> NodeId {
        match self {
            Node::Element(el) => el.id,
            Node::Text(t) => t.id,
        }
    }

    fn set_id(&mut self, id: NodeId) {
        match self {
            Node::Element(el) => el.id = id,
            Node::Text(t) => t.id = id,
        }
    }

    pub fn block(kind: BlockKind, text: impl Into<String>) -> Self {
        Node::Element(ElementNode::new(kind, vec![Node::text(text)]))
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::block(BlockKind::Paragraph, text)
    }

    pub fn heading(level: u8, text: impl Into<String>) -> Self {
        Self::block(BlockKind::Heading { level }, text)
    }

    pub fn quote(text: impl Into<String>) -> Self {
        Self::block(BlockKind::Quote, text)
    }

    pub fn code(text: impl Into<String>) -> Self {
        Self::block(BlockKind::Code, text)
    }

    pub fn list_item(text: impl Into<String>) -> Self {
        Self::block(BlockKind::ListItem, text)
    }

    pub fn list(ordered: bool, items: Vec<Node>) -> Self {
        Node::Element(ElementNode::new(BlockKind::List { ordered }, items))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(TextNode::new(text))
    }

    pub fn as_element(&self) -> Option<&ElementNode> {
        match self {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextNode> {
        match self {
            Node::Text(t) => Some(t),
            Node::Element(_) => None,
        }
    }

    fn collect_ids(&self, out: &mut Vec<NodeId>) {
        out.push(self.id());
        if let Node::Element(el) = self {
            for child in &el.children {
                child.collect_ids(out);
            }
        }
    }

    fn subtree_contains(&self, id: NodeId) -> bool {
        if self.id() == id {
            return true;
        }
        match self {
            Node::Element(el) => el.children.iter().any(|child| child.subtree_contains(id)),
            Node::Text(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    #[serde(default)]
    pub id: NodeId,
    pub kind: BlockKind,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl ElementNode {
    pub fn new(kind: BlockKind, children: Vec<Node>) -> Self {
        Self {
            id: NodeId::UNASSIGNED,
            kind,
            children,
        }
    }

    pub fn text_leaves(&self) -> impl Iterator<Item = &TextNode> {
        self.children.iter().filter_map(Node::as_text)
    }

    pub fn text(&self) -> String {
        self.text_leaves().map(|t| t.text.as_str()).collect()
    }

    pub fn text_len(&self) -> usize {
        self.text_leaves().map(|t| t.text.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    #[serde(default)]
    pub id: NodeId,
    pub text: String,
    #[serde(default)]
    pub marks: Marks,
}

impl TextNode {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: NodeId::UNASSIGNED,
            text: text.into(),
            marks: Marks::default(),
        }
    }

    pub fn with_marks(mut self, marks: Marks) -> Self {
        self.marks = marks;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkKind {
    Bold,
    Italic,
    Underline,
    Code,
    Highlight,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Marks {
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default)]
    pub underline: bool,
    #[serde(default)]
    pub code: bool,
    #[serde(default)]
    pub highlight: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl Marks {
    pub fn has(&self, kind: MarkKind) -> bool {
        match kind {
            MarkKind::Bold => self.bold,
            MarkKind::Italic => self.italic,
            MarkKind::Underline => self.underline,
            MarkKind::Code => self.code,
            MarkKind::Highlight => self.highlight,
        }
    }

    pub fn set(&mut self, kind: MarkKind, on: bool) {
        let slot = match kind {
            MarkKind::Bold => &mut self.bold,
            MarkKind::Italic => &mut self.italic,
            MarkKind::Underline => &mut self.underline,
            MarkKind::Code => &mut self.code,
            MarkKind::Highlight => &mut self.highlight,
        };
        *slot = on;
    }

    pub fn with(mut self, kind: MarkKind, on: bool) -> Self {
        self.set(kind, on);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub node: NodeId,
    pub offset: usize,
}

impl Point {
    pub fn new(node: NodeId, offset: usize) -> Self {
        Self { node, offset }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Point,
    pub focus: Point,
}

impl Selection {
    pub fn new(anchor: Point, focus: Point) -> Self {
        Self { anchor, focus }
    }

    pub fn collapsed(point: Point) -> Self {
        Self {
            anchor: point,
            focus: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }
}

impl Default for Selection {
    fn default() -> Self {
        Self::collapsed(Point::new(NodeId::ROOT, 0))
    }
}

/// A position expressed against a text block's concatenated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockOffset {
    pub block: NodeId,
    pub offset: usize,
}

impl Document {
    pub fn new(children: Vec<Node>) -> Self {
        Self { children }
    }

    pub fn empty() -> Self {
        Self::new(vec![Node::paragraph("")])
    }

    pub fn path_of(&self, id: NodeId) -> Option<Path> {
        fn walk(children: &[Node], id: NodeId, path: &mut Path) -> bool {
            for (ix, node) in children.iter().enumerate() {
                path.push(ix);
                if node.id() == id {
                    return true;
                }
                if let Node::Element(el) = node {
                    if walk(&el.children, id, path) {
                        return true;
                    }
                }
                path.pop();
            }
            false
        }

        if id == NodeId::ROOT {
            return Some(Vec::new());
        }
        let mut path = Vec::new();
        walk(&self.children, id, &mut path).then_some(path)
    }

    pub fn node_at_path(&self, path: &[usize]) -> Option<&Node> {
        let (first, rest) = path.split_first()?;
        let mut node = self.children.get(*first)?;
        for &ix in rest {
            node = match node {
                Node::Element(el) => el.children.get(ix)?,
                Node::Text(_) => return None,
            };
        }
        Some(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        let path = self.path_of(id)?;
        self.node_at_path(&path)
    }

    pub fn element(&self, id: NodeId) -> Option<&ElementNode> {
        self.node(id).and_then(Node::as_element)
    }

    pub fn text_node(&self, id: NodeId) -> Option<&TextNode> {
        self.node(id).and_then(Node::as_text)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.path_of(id).is_some()
    }

    pub fn children_of(&self, parent: NodeId) -> Option<&[Node]> {
        if parent == NodeId::ROOT {
            return Some(&self.children);
        }
        self.element(parent).map(|el| el.children.as_slice())
    }

    /// Parent id and index of `id` among its siblings.
    pub fn position_of(&self, id: NodeId) -> Option<(NodeId, usize)> {
        let path = self.path_of(id)?;
        let (index, parent_path) = path.split_last()?;
        let parent = if parent_path.is_empty() {
            NodeId::ROOT
        } else {
            self.node_at_path(parent_path)?.id()
        };
        Some((parent, *index))
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.position_of(id).map(|(parent, _)| parent)
    }

    /// True when `node` is `ancestor` or lives somewhere below it.
    pub fn contains_within(&self, ancestor: NodeId, node: NodeId) -> bool {
        if ancestor == NodeId::ROOT {
            return self.contains(node);
        }
        self.node(ancestor)
            .is_some_and(|subtree| subtree.subtree_contains(node))
    }

    pub fn ids(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        for node in &self.children {
            node.collect_ids(&mut out);
        }
        out
    }

    pub fn max_id(&self) -> NodeId {
        self.ids().into_iter().max().unwrap_or(NodeId::UNASSIGNED)
    }

    /// Text blocks in document order.
    pub fn text_blocks(&self) -> Vec<&ElementNode> {
        fn walk<'a>(children: &'a [Node], out: &mut Vec<&'a ElementNode>) {
            for node in children {
                let Node::Element(el) = node else {
                    continue;
                };
                if el.kind.is_text_block() {
                    out.push(el);
                } else {
                    walk(&el.children, out);
                }
            }
        }

        let mut out = Vec::new();
        walk(&self.children, &mut out);
        out
    }

    /// Text blocks joined by `\n`; every offset the selection tracker reports
    /// indexes into this string.
    pub fn plain_text(&self) -> String {
        self.text_blocks()
            .iter()
            .map(|block| block.text())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn first_text_point(&self) -> Option<Point> {
        first_text_point_in(&self.children)
    }

    /// Block containing the text leaf and the offset at which the leaf starts.
    pub fn leaf_position(&self, leaf: NodeId) -> Option<BlockOffset> {
        let path = self.path_of(leaf)?;
        let (index, block_path) = path.split_last()?;
        let Node::Element(block) = self.node_at_path(block_path)? else {
            return None;
        };
        block.children.get(*index)?.as_text()?;
        let offset = block.children[..*index]
            .iter()
            .filter_map(Node::as_text)
            .map(|t| t.text.len())
            .sum();
        Some(BlockOffset {
            block: block.id,
            offset,
        })
    }

    pub fn block_offset(&self, point: &Point) -> Option<BlockOffset> {
        let leaf = self.text_node(point.node)?;
        let base = self.leaf_position(point.node)?;
        Some(BlockOffset {
            block: base.block,
            offset: base.offset + clamp_to_char_boundary(&leaf.text, point.offset),
        })
    }

    /// Resolves a block offset to a leaf point, preferring the start of the
    /// next leaf when the offset falls on a leaf boundary.
    pub fn point_at(&self, at: BlockOffset) -> Option<Point> {
        let block = self.element(at.block)?;
        if !block.kind.is_text_block() {
            return None;
        }
        let mut remaining = at.offset;
        for (ix, node) in block.children.iter().enumerate() {
            let Node::Text(t) = node else {
                continue;
            };
            if remaining < t.text.len() {
                return Some(Point::new(t.id, clamp_to_char_boundary(&t.text, remaining)));
            }
            if remaining == t.text.len() {
                if let Some(Node::Text(next)) = block.children.get(ix + 1) {
                    return Some(Point::new(next.id, 0));
                }
                return Some(Point::new(t.id, t.text.len()));
            }
            remaining -= t.text.len();
        }
        block
            .text_leaves()
            .last()
            .map(|t| Point::new(t.id, t.text.len()))
    }

    pub fn absolute_offset(&self, point: &Point) -> Option<usize> {
        self.absolute_of(self.block_offset(point)?)
    }

    pub fn absolute_of(&self, at: BlockOffset) -> Option<usize> {
        let mut base = 0;
        for block in self.text_blocks() {
            let len = block.text_len();
            if block.id == at.block {
                return Some(base + at.offset.min(len));
            }
            base += len + 1;
        }
        None
    }

    pub fn block_offset_at_absolute(&self, offset: usize) -> Option<BlockOffset> {
        let blocks = self.text_blocks();
        let mut base = 0;
        for (ix, block) in blocks.iter().enumerate() {
            let len = block.text_len();
            if offset <= base + len || ix + 1 == blocks.len() {
                return Some(BlockOffset {
                    block: block.id,
                    offset: offset.saturating_sub(base).min(len),
                });
            }
            base += len + 1;
        }
        None
    }

    pub fn point_at_absolute(&self, offset: usize) -> Option<Point> {
        self.point_at(self.block_offset_at_absolute(offset)?)
    }

    /// Selection endpoints in document order.
    pub fn ordered(&self, selection: &Selection) -> Option<(Point, Point)> {
        let anchor = self.absolute_offset(&selection.anchor)?;
        let focus = self.absolute_offset(&selection.focus)?;
        if focus < anchor {
            Some((selection.focus, selection.anchor))
        } else {
            Some((selection.anchor, selection.focus))
        }
    }

    /// Per-block local ranges covered by `start..end`, in document order.
    pub fn block_ranges(&self, start: BlockOffset, end: BlockOffset) -> Vec<(NodeId, Range<usize>)> {
        let mut out = Vec::new();
        let mut inside = false;
        for block in self.text_blocks() {
            let len = block.text_len();
            let from = if block.id == start.block {
                inside = true;
                start.offset.min(len)
            } else {
                0
            };
            if !inside {
                continue;
            }
            if block.id == end.block {
                out.push((block.id, from..end.offset.min(len).max(from)));
                break;
            }
            out.push((block.id, from..len));
        }
        out
    }

    /// Text blocks touched by the selection; a collapsed selection touches one.
    pub fn selected_blocks(&self, selection: &Selection) -> Vec<NodeId> {
        let Some((start, end)) = self.ordered(selection) else {
            return Vec::new();
        };
        let (Some(start), Some(end)) = (self.block_offset(&start), self.block_offset(&end)) else {
            return Vec::new();
        };
        self.block_ranges(start, end)
            .into_iter()
            .map(|(block, _)| block)
            .collect()
    }

    /// Non-empty text leaves overlapping the selection.
    pub fn selected_leaves(&self, selection: &Selection) -> Vec<&TextNode> {
        let Some((start, end)) = self.ordered(selection) else {
            return Vec::new();
        };
        let (Some(start), Some(end)) = (self.block_offset(&start), self.block_offset(&end)) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (block, range) in self.block_ranges(start, end) {
            let Some(el) = self.element(block) else {
                continue;
            };
            let mut cursor = 0;
            for leaf in el.text_leaves() {
                let leaf_range = cursor..cursor + leaf.text.len();
                cursor = leaf_range.end;
                if !leaf.text.is_empty()
                    && leaf_range.start < range.end
                    && leaf_range.end > range.start
                {
                    out.push(leaf);
                }
            }
        }
        out
    }
}

pub(crate) fn first_text_point_in(children: &[Node]) -> Option<Point> {
    for node in children {
        match node {
            Node::Text(t) => return Some(Point::new(t.id, 0)),
            Node::Element(el) => {
                if let Some(point) = first_text_point_in(&el.children) {
                    return Some(point);
                }
            }
        }
    }
    None
}

pub(crate) fn last_text_point_in(children: &[Node]) -> Option<Point> {
    for node in children.iter().rev() {
        match node {
            Node::Text(t) => return Some(Point::new(t.id, t.text.len())),
            Node::Element(el) => {
                if let Some(point) = last_text_point_in(&el.children) {
                    return Some(point);
                }
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct UndoRecord {
    pub inverse_ops: Vec<Op>,
    pub selection_before: Selection,
    pub selection_after: Selection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub max_undo: usize,
    pub max_normalize_iterations: usize,
}

impl EditorConfig {
    pub(crate) fn with_defaults(mut self) -> Self {
        if self.max_undo == 0 {
            self.max_undo = 200;
        }
        if self.max_normalize_iterations == 0 {
            self.max_normalize_iterations = 100;
        }
        self
    }
}

pub struct Editor {
    doc: Document,
    selection: Selection,
    registry: PluginRegistry,
    config: EditorConfig,
    ids: IdAllocator,
    markers: RangeMarkers,
    caret_marks: Option<Marks>,
    undo_stack: Vec<UndoRecord>,
    redo_stack: Vec<UndoRecord>,
    version: u64,
}

impl Editor {
    pub fn new(doc: Document, selection: Selection, registry: PluginRegistry) -> Self {
        Self::with_config(doc, selection, registry, EditorConfig::default())
    }

    pub fn with_config(
        mut doc: Document,
        selection: Selection,
        registry: PluginRegistry,
        config: EditorConfig,
    ) -> Self {
        let ids = assign_document_ids(&mut doc);
        let mut editor = Self {
            doc,
            selection,
            registry,
            config: config.with_defaults(),
            ids,
            markers: RangeMarkers::default(),
            caret_marks: None,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            version: 0,
        };
        editor.normalize_in_place();
        editor
    }

    /// Caret at the start of the first text leaf.
    pub fn with_document(doc: Document, registry: PluginRegistry) -> Self {
        Self::new(doc, Selection::default(), registry)
    }

    pub fn with_note_plugins() -> Self {
        Self::with_document(Document::empty(), PluginRegistry::notes())
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn set_selection(&mut self, selection: Selection) {
        if selection != self.selection {
            self.caret_marks = None;
        }
        self.selection = selection;
        self.normalize_selection_in_place();
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    /// Bumped on every change to the document.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn fresh_id(&mut self) -> NodeId {
        self.ids.fresh()
    }

    /// Marks the next inserted text will carry at a collapsed caret.
    pub fn caret_marks(&self) -> Option<Marks> {
        self.caret_marks.clone()
    }

    pub fn set_caret_marks(&mut self, marks: Option<Marks>) {
        self.caret_marks = marks;
    }

    pub fn markers(&self) -> &RangeMarkers {
        &self.markers
    }

    pub fn add_marker(&mut self, start: BlockOffset, end: BlockOffset) -> MarkerId {
        self.markers.insert(MarkerRange { start, end })
    }

    pub fn marker(&self, id: MarkerId) -> Option<MarkerRange> {
        self.markers.get(id)
    }

    pub fn remove_marker(&mut self, id: MarkerId) -> Option<MarkerRange> {
        self.markers.remove(id)
    }

    /// Text currently covered by a marker.
    pub fn marker_text(&self, id: MarkerId) -> Option<String> {
        let range = self.markers.get(id)?;
        let start = self.doc.absolute_of(range.start)?;
        let end = self.doc.absolute_of(range.end)?;
        self.doc.plain_text().get(start..end.max(start)).map(str::to_string)
    }

    /// Swaps in a new document wholesale. History and markers are reset since
    /// they describe the previous content.
    pub fn replace_document(&mut self, mut doc: Document) {
        self.ids = assign_document_ids(&mut doc);
        self.doc = doc;
        self.markers.clear();
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.caret_marks = None;
        self.selection = Selection::default();
        self.normalize_in_place();
        self.version += 1;
        debug!(version = self.version, "replaced document");
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo(&mut self) -> bool {
        let Some(record) = self.undo_stack.pop() else {
            return false;
        };

        let UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
        } = record;

        let mut redo_ops: Vec<Op> = Vec::new();
        for (ix, op) in inverse_ops.iter().cloned().enumerate() {
            match self.apply_op(op) {
                Ok(inv) => redo_ops.push(inv),
                Err(err) => {
                    warn!(%err, applied = ix, total = inverse_ops.len(), "undo stopped early");
                    break;
                }
            }
        }
        redo_ops.reverse();

        self.selection = selection_before;
        self.caret_marks = None;
        self.normalize_in_place();
        self.version += 1;
        debug!(version = self.version, "undo");

        self.redo_stack.push(UndoRecord {
            selection_before,
            selection_after,
            inverse_ops: redo_ops,
        });
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(record) = self.redo_stack.pop() else {
            return false;
        };

        let UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
        } = record;

        let mut undo_ops: Vec<Op> = Vec::new();
        for (ix, op) in inverse_ops.iter().cloned().enumerate() {
            match self.apply_op(op) {
                Ok(inv) => undo_ops.push(inv),
                Err(err) => {
                    warn!(%err, applied = ix, total = inverse_ops.len(), "redo stopped early");
                    break;
                }
            }
        }
        undo_ops.reverse();

        self.selection = selection_after;
        self.caret_marks = None;
        self.normalize_in_place();
        self.version += 1;
        debug!(version = self.version, "redo");

        self.undo_stack.push(UndoRecord {
            selection_before,
            selection_after,
            inverse_ops: undo_ops,
        });
        true
    }

    /// Applies a transaction atomically: if any op fails, the ops already
    /// applied are rolled back before the error is returned.
    pub fn apply(&mut self, mut tx: Transaction) -> Result<(), ApplyError> {
        assign_transaction_ids(&mut tx, &mut self.ids);
        let (mut tx, ids) = self.transform_transaction(tx);
        self.ids = ids;
        assign_transaction_ids(&mut tx, &mut self.ids);

        let selection_before = self.selection;

        let mut inverse_ops: Vec<Op> = Vec::new();
        for op in tx.ops.iter().cloned() {
            match self.apply_op(op) {
                Ok(inv) => inverse_ops.push(inv),
                Err(err) => {
                    self.rollback(inverse_ops, selection_before);
                    return Err(err);
                }
            }
        }

        if let Some(sel) = tx.selection_after {
            self.selection = sel;
        }

        if let Err(err) = self.normalize_into(&mut inverse_ops) {
            self.rollback(inverse_ops, selection_before);
            return Err(err);
        }
        self.normalize_selection_in_place();

        if self.selection != selection_before {
            self.caret_marks = None;
        }
        if let Some(marks) = tx.meta.caret_marks.take() {
            self.caret_marks = Some(marks);
        }

        if inverse_ops.is_empty() {
            return Ok(());
        }
        inverse_ops.reverse();

        let selection_after = self.selection;
        self.undo_stack.push(UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
        });
        self.redo_stack.clear();
        if self.undo_stack.len() > self.config.max_undo {
            self.undo_stack.remove(0);
        }

        self.version += 1;
        debug!(
            source = tx.meta.source.as_deref().unwrap_or("-"),
            ops = tx.ops.len(),
            version = self.version,
            "applied transaction"
        );
        Ok(())
    }

    fn rollback(&mut self, mut inverse_ops: Vec<Op>, selection: Selection) {
        while let Some(op) = inverse_ops.pop() {
            if let Err(err) = self.apply_op(op) {
                warn!(%err, remaining = inverse_ops.len(), "rollback step failed");
            }
        }
        self.selection = selection;
    }

    fn transform_transaction(&self, mut tx: Transaction) -> (Transaction, IdAllocator) {
        let mut ids = self.ids.clone();
        for transform in self.registry.transaction_transforms() {
            if let Some(next) = transform.transform(self, &tx, &mut ids) {
                tx = next;
            }
        }
        (tx, ids)
    }

    pub fn run_command(&mut self, id: &str, args: Option<Value>) -> Result<(), CommandError> {
        let Some(command) = self.registry.command(id) else {
            return Err(CommandError::new(format!("Unknown command: {id}")));
        };
        debug!(command = id, "run command");
        (command.handler)(self, args)
    }

    pub fn run_query_json(&self, id: &str, args: Option<Value>) -> Result<Value, QueryError> {
        let Some(query) = self.registry.query(id) else {
            return Err(QueryError::new(format!("Unknown query: {id}")));
        };
        (query.handler)(self, args)
    }

    pub fn run_query<T>(&self, id: &str, args: Option<Value>) -> Result<T, QueryError>
    where
        T: DeserializeOwned,
    {
        let value = self.run_query_json(id, args)?;
        serde_json::from_value(value)
            .map_err(|err| QueryError::new(format!("Failed to decode query result: {err}")))
    }

    fn normalize_in_place(&mut self) {
        let mut discarded = Vec::new();
        let _ = self.normalize_into(&mut discarded);
        self.normalize_selection_in_place();
    }

    fn normalize_selection_in_place(&mut self) {
        self.selection = self
            .registry
            .normalize_selection(&self.doc, &self.selection);
    }

    fn normalize_into(&mut self, inverse_ops: &mut Vec<Op>) -> Result<(), ApplyError> {
        for _ in 0..self.config.max_normalize_iterations {
            let ops = self.registry.normalize(&self.doc, &mut self.ids);
            if ops.is_empty() {
                return Ok(());
            }
            for op in ops {
                let inv = self.apply_op(op)?;
                inverse_ops.push(inv);
            }
        }
        Err(ApplyError::NormalizeDidNotConverge)
    }

    fn apply_op(&mut self, op: Op) -> Result<Op, ApplyError> {
        apply_op_to(&mut self.doc, &mut self.selection, &mut self.markers, op)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("node id {0} is already in use")]
    DuplicateId(NodeId),
    #[error("moving {node} under {parent} would place it inside itself")]
    Cycle { node: NodeId, parent: NodeId },
    #[error("invalid operation: {0}")]
    InvalidOp(String),
    #[error("normalization did not converge")]
    NormalizeDidNotConverge,
}

fn assign_document_ids(doc: &mut Document) -> IdAllocator {
    fn walk(nodes: &mut [Node], ids: &mut IdAllocator, seen: &mut HashSet<NodeId>) {
        for node in nodes {
            let id = node.id();
            if !id.is_assigned() || id == NodeId::ROOT || !seen.insert(id) {
                let fresh = ids.fresh();
                seen.insert(fresh);
                node.set_id(fresh);
            }
            if let Node::Element(el) = node {
                walk(&mut el.children, ids, seen);
            }
        }
    }

    let mut ids = IdAllocator::starting_after(doc);
    walk(&mut doc.children, &mut ids, &mut HashSet::new());
    ids
}

fn assign_transaction_ids(tx: &mut Transaction, ids: &mut IdAllocator) {
    for op in &mut tx.ops {
        match op {
            Op::InsertNode { node, .. } => ids.assign(node),
            Op::SplitText { new_id, .. } if !new_id.is_assigned() => *new_id = ids.fresh(),
            _ => {}
        }
    }
}

pub(crate) fn apply_op_to(
    doc: &mut Document,
    selection: &mut Selection,
    markers: &mut RangeMarkers,
    op: Op,
) -> Result<Op, ApplyError> {
    match op {
        Op::InsertText { node, offset, text } => {
            let base = doc.leaf_position(node);
            let leaf = text_mut(doc, node)?;
            let offset = clamp_to_char_boundary(&leaf.text, offset);
            leaf.text.insert_str(offset, &text);
            transform_selection_insert_text(selection, node, offset, text.len());
            if let Some(base) = base {
                markers.text_inserted(base.block, base.offset + offset, text.len());
            }
            Ok(Op::RemoveText {
                node,
                range: offset..offset + text.len(),
            })
        }
        Op::RemoveText { node, range } => {
            let base = doc.leaf_position(node);
            let leaf = text_mut(doc, node)?;
            let start = clamp_to_char_boundary(&leaf.text, range.start);
            let end = clamp_to_char_boundary(&leaf.text, range.end);
            if start >= end {
                return Ok(Op::InsertText {
                    node,
                    offset: start,
                    text: String::new(),
                });
            }
            let removed = leaf.text[start..end].to_string();
            leaf.text.replace_range(start..end, "");
            transform_selection_remove_text(selection, node, start..end);
            if let Some(base) = base {
                markers.text_removed(base.block, base.offset + start..base.offset + end);
            }
            Ok(Op::InsertText {
                node,
                offset: start,
                text: removed,
            })
        }
        Op::InsertNode { parent, index, node } => {
            validate_new_ids(doc, &node)?;
            check_parent_accepts(doc, parent, &node)?;
            let children = children_mut(doc, parent)?;
            if index > children.len() {
                return Err(ApplyError::InvalidOp(format!(
                    "insert index {index} out of bounds for {parent} ({} children)",
                    children.len()
                )));
            }
            let id = node.id();
            let text_len = node.as_text().map(|t| t.text.len()).unwrap_or(0);
            children.insert(index, node);
            if text_len > 0 {
                if let Some(base) = doc.leaf_position(id) {
                    markers.text_inserted(base.block, base.offset, text_len);
                }
            }
            Ok(Op::RemoveNode { node: id })
        }
        Op::RemoveNode { node } => {
            let (parent, index) = doc.position_of(node).ok_or(ApplyError::UnknownNode(node))?;
            if let (Some(base), Some(leaf)) = (doc.leaf_position(node), doc.text_node(node)) {
                markers.text_removed(base.block, base.offset..base.offset + leaf.text.len());
            }
            let removed = children_mut(doc, parent)?.remove(index);
            if let Node::Element(_) = &removed {
                let mut ids = Vec::new();
                removed.collect_ids(&mut ids);
                markers.blocks_removed(&ids);
            }
            transform_selection_remove_node(selection, doc, &removed, parent, index);
            Ok(Op::InsertNode {
                parent,
                index,
                node: removed,
            })
        }
        Op::MoveNode {
            node,
            parent,
            index,
        } => {
            if doc.contains_within(node, parent) {
                return Err(ApplyError::Cycle { node, parent });
            }
            let (old_parent, old_index) =
                doc.position_of(node).ok_or(ApplyError::UnknownNode(node))?;
            let moving = doc.node(node).ok_or(ApplyError::UnknownNode(node))?;
            check_parent_accepts(doc, parent, moving)?;
            let target_len = doc
                .children_of(parent)
                .map(|children| children.len())
                .ok_or(ApplyError::UnknownNode(parent))?
                - usize::from(parent == old_parent);
            if index > target_len {
                return Err(ApplyError::InvalidOp(format!(
                    "move index {index} out of bounds for {parent} ({target_len} children)"
                )));
            }

            let old_leaf = doc
                .leaf_position(node)
                .zip(doc.text_node(node).map(|t| t.text.len()));
            let detached = children_mut(doc, old_parent)?.remove(old_index);
            children_mut(doc, parent)?.insert(index, detached);

            if let Some((old, len)) = old_leaf {
                let old_range = old.offset..old.offset + len;
                match doc.leaf_position(node) {
                    Some(new) => markers.text_moved(old.block, old_range, new.block, new.offset),
                    None => markers.text_removed(old.block, old_range),
                }
            }

            Ok(Op::MoveNode {
                node,
                parent: old_parent,
                index: old_index,
            })
        }
        Op::SetBlockKind { node, kind } => {
            let el = element_mut(doc, node)?;
            if el.kind.is_text_block() != kind.is_text_block() && !el.children.is_empty() {
                return Err(ApplyError::InvalidOp(format!(
                    "cannot turn non-empty {} {node} into a {}",
                    el.kind.name(),
                    kind.name()
                )));
            }
            let old = std::mem::replace(&mut el.kind, kind);
            Ok(Op::SetBlockKind { node, kind: old })
        }
        Op::SetTextMarks { node, marks } => {
            let leaf = text_mut(doc, node)?;
            let old = std::mem::replace(&mut leaf.marks, marks);
            Ok(Op::SetTextMarks { node, marks: old })
        }
        Op::SplitText {
            node,
            offset,
            new_id,
        } => {
            if !new_id.is_assigned() || new_id == NodeId::ROOT || doc.contains(new_id) {
                return Err(ApplyError::DuplicateId(new_id));
            }
            let (parent, index) = doc.position_of(node).ok_or(ApplyError::UnknownNode(node))?;
            let leaf = text_mut(doc, node)?;
            let offset = clamp_to_char_boundary(&leaf.text, offset);
            let tail = TextNode {
                id: new_id,
                text: leaf.text.split_off(offset),
                marks: leaf.marks.clone(),
            };
            children_mut(doc, parent)?.insert(index + 1, Node::Text(tail));
            for point in [&mut selection.anchor, &mut selection.focus] {
                if point.node == node && point.offset > offset {
                    point.node = new_id;
                    point.offset -= offset;
                }
            }
            Ok(Op::MergeText { node, next: new_id })
        }
        Op::MergeText { node, next } => {
            let (parent, index) = doc.position_of(node).ok_or(ApplyError::UnknownNode(node))?;
            let left_marks = doc.text_node(node).map(|t| t.marks.clone());
            let right = doc
                .children_of(parent)
                .and_then(|children| children.get(index + 1))
                .and_then(Node::as_text)
                .filter(|t| t.id == next);
            match (left_marks, right) {
                (Some(marks), Some(right)) if right.marks == marks => {}
                _ => {
                    return Err(ApplyError::InvalidOp(format!(
                        "{next} is not a text leaf following {node} with equal marks"
                    )));
                }
            }

            let Node::Text(right) = children_mut(doc, parent)?.remove(index + 1) else {
                return Err(ApplyError::InvalidOp(format!("{next} is not a text leaf")));
            };
            let leaf = text_mut(doc, node)?;
            let left_len = leaf.text.len();
            leaf.text.push_str(&right.text);
            for point in [&mut selection.anchor, &mut selection.focus] {
                if point.node == next {
                    point.node = node;
                    point.offset += left_len;
                }
            }
            Ok(Op::SplitText {
                node,
                offset: left_len,
                new_id: next,
            })
        }
    }
}

pub(crate) fn clamp_to_char_boundary(s: &str, mut ix: usize) -> usize {
    ix = ix.min(s.len());
    while ix > 0 && !s.is_char_boundary(ix) {
        ix -= 1;
    }
    ix
}

fn validate_new_ids(doc: &Document, node: &Node) -> Result<(), ApplyError> {
    let existing: HashSet<NodeId> = doc.ids().into_iter().collect();
    let mut incoming = Vec::new();
    node.collect_ids(&mut incoming);
    let mut seen = HashSet::new();
    for id in incoming {
        if !id.is_assigned() {
            return Err(ApplyError::InvalidOp("inserted node has no id".into()));
        }
        if id == NodeId::ROOT || existing.contains(&id) || !seen.insert(id) {
            return Err(ApplyError::DuplicateId(id));
        }
    }
    Ok(())
}

fn check_parent_accepts(doc: &Document, parent: NodeId, child: &Node) -> Result<(), ApplyError> {
    let holds_text = if parent == NodeId::ROOT {
        false
    } else {
        match doc.node(parent) {
            Some(Node::Element(el)) => el.kind.is_text_block(),
            Some(Node::Text(_)) => {
                return Err(ApplyError::InvalidOp(format!("{parent} is a text leaf")));
            }
            None => return Err(ApplyError::UnknownNode(parent)),
        }
    };
    match (child, holds_text) {
        (Node::Text(_), true) | (Node::Element(_), false) => Ok(()),
        (Node::Text(_), false) => Err(ApplyError::InvalidOp(format!(
            "{parent} cannot hold text leaves"
        ))),
        (Node::Element(_), true) => Err(ApplyError::InvalidOp(format!(
            "{parent} only holds text leaves"
        ))),
    }
}

fn node_at_path_mut<'a>(children: &'a mut [Node], path: &[usize]) -> Option<&'a mut Node> {
    let (first, rest) = path.split_first()?;
    let node = children.get_mut(*first)?;
    if rest.is_empty() {
        return Some(node);
    }
    match node {
        Node::Element(el) => node_at_path_mut(&mut el.children, rest),
        Node::Text(_) => None,
    }
}

fn node_mut(doc: &mut Document, id: NodeId) -> Result<&mut Node, ApplyError> {
    let path = doc.path_of(id).ok_or(ApplyError::UnknownNode(id))?;
    node_at_path_mut(&mut doc.children, &path).ok_or(ApplyError::UnknownNode(id))
}

fn element_mut(doc: &mut Document, id: NodeId) -> Result<&mut ElementNode, ApplyError> {
    match node_mut(doc, id)? {
        Node::Element(el) => Ok(el),
        Node::Text(_) => Err(ApplyError::InvalidOp(format!("{id} is not an element"))),
    }
}

fn text_mut(doc: &mut Document, id: NodeId) -> Result<&mut TextNode, ApplyError> {
    match node_mut(doc, id)? {
        Node::Text(t) => Ok(t),
        Node::Element(_) => Err(ApplyError::InvalidOp(format!("{id} is not a text leaf"))),
    }
}

fn children_mut(doc: &mut Document, parent: NodeId) -> Result<&mut Vec<Node>, ApplyError> {
    if parent == NodeId::ROOT {
        return Ok(&mut doc.children);
    }
    Ok(&mut element_mut(doc, parent)?.children)
}

fn transform_selection_insert_text(
    selection: &mut Selection,
    node: NodeId,
    offset: usize,
    len: usize,
) {
    for point in [&mut selection.anchor, &mut selection.focus] {
        if point.node == node && point.offset >= offset {
            point.offset = point.offset.saturating_add(len);
        }
    }
}

fn transform_selection_remove_text(selection: &mut Selection, node: NodeId, range: Range<usize>) {
    let removed_len = range.end.saturating_sub(range.start);
    for point in [&mut selection.anchor, &mut selection.focus] {
        if point.node != node || point.offset <= range.start {
            continue;
        }
        if point.offset >= range.end {
            point.offset = point.offset.saturating_sub(removed_len);
        } else {
            point.offset = range.start;
        }
    }
}

fn transform_selection_remove_node(
    selection: &mut Selection,
    doc_after_remove: &Document,
    removed: &Node,
    parent: NodeId,
    index: usize,
) {
    let mut removed_ids = Vec::new();
    removed.collect_ids(&mut removed_ids);
    if !removed_ids.contains(&selection.anchor.node) && !removed_ids.contains(&selection.focus.node)
    {
        return;
    }

    // Prefer the end of the previous sibling, then the start of the next one.
    let replacement = doc_after_remove.children_of(parent).and_then(|siblings| {
        index
            .checked_sub(1)
            .and_then(|ix| siblings.get(ix))
            .and_then(|prev| last_text_point_in(std::slice::from_ref(prev)))
            .or_else(|| {
                siblings
                    .get(index)
                    .and_then(|next| first_text_point_in(std::slice::from_ref(next)))
            })
    });

    for point in [&mut selection.anchor, &mut selection.focus] {
        if removed_ids.contains(&point.node) {
            if let Some(replacement) = replacement {
                *point = replacement;
            }
        }
    }
}
