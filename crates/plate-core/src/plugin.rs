use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::autoformat::AutoformatPlugin;
use crate::blocks::{BlockCommandsPlugin, BlockKindsPlugin, ListStructurePlugin};
use crate::core::{
    BlockKind, Document, Editor, ElementNode, IdAllocator, Node, NodeId, Point, Selection, TextNode,
    clamp_to_char_boundary, first_text_point_in,
};
use crate::editing::TextEditingPlugin;
use crate::marks::MarksCommandsPlugin;
use crate::ops::{Op, Transaction};

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CommandError {
    message: String,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct QueryError {
    message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type CommandHandler =
    Arc<dyn Fn(&mut Editor, Option<Value>) -> Result<(), CommandError> + Send + Sync>;

pub type QueryHandler =
    Arc<dyn Fn(&Editor, Option<Value>) -> Result<Value, QueryError> + Send + Sync>;

#[derive(Clone)]
pub struct CommandSpec {
    pub id: String,
    pub label: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    /// Kept out of user-facing menus.
    pub hidden: bool,
    pub handler: CommandHandler,
}

impl CommandSpec {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        handler: impl Fn(&mut Editor, Option<Value>) -> Result<(), CommandError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: None,
            keywords: Vec::new(),
            hidden: false,
            handler: Arc::new(handler),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }
}

#[derive(Clone)]
pub struct QuerySpec {
    pub id: String,
    pub handler: QueryHandler,
}

impl QuerySpec {
    pub fn new(
        id: impl Into<String>,
        handler: impl Fn(&Editor, Option<Value>) -> Result<Value, QueryError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            handler: Arc::new(handler),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildConstraint {
    BlockOnly,
    InlineOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub kind: String,
    pub children: ChildConstraint,
}

impl NodeSpec {
    pub fn text_block(kind: &BlockKind) -> Self {
        Self {
            kind: kind.name().to_string(),
            children: ChildConstraint::InlineOnly,
        }
    }

    pub fn container(kind: &BlockKind) -> Self {
        Self {
            kind: kind.name().to_string(),
            children: ChildConstraint::BlockOnly,
        }
    }
}

/// A structural fix-up run to a fixed point after every transaction. Passes
/// allocate ids for any node they insert from `ids`.
pub trait NormalizePass: Send + Sync {
    fn id(&self) -> &'static str;
    fn run(&self, doc: &Document, registry: &PluginRegistry, ids: &mut IdAllocator) -> Vec<Op>;
}

pub trait TransactionTransform: Send + Sync {
    fn id(&self) -> &'static str;
    fn transform(
        &self,
        editor: &Editor,
        tx: &Transaction,
        ids: &mut IdAllocator,
    ) -> Option<Transaction>;
}

pub trait EditorPlugin: Send + Sync {
    fn id(&self) -> &'static str;
    fn node_specs(&self) -> Vec<NodeSpec> {
        Vec::new()
    }
    fn transaction_transforms(&self) -> Vec<Box<dyn TransactionTransform>> {
        Vec::new()
    }
    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        Vec::new()
    }
    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }
    fn queries(&self) -> Vec<QuerySpec> {
        Vec::new()
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    node_specs: HashMap<String, NodeSpec>,
    transaction_transforms: Vec<Box<dyn TransactionTransform>>,
    normalize_passes: Vec<Box<dyn NormalizePass>>,
    commands: HashMap<String, CommandSpec>,
    queries: HashMap<String, QuerySpec>,
}

impl PluginRegistry {
    pub fn new(plugins: impl IntoIterator<Item = Box<dyn EditorPlugin>>) -> Result<Self, String> {
        let mut registry = Self::default();
        for plugin in plugins {
            registry.register_plugin(plugin)?;
        }
        Ok(registry)
    }

    /// Paragraphs, structural normalization and plain text editing.
    #[allow(clippy::expect_used)]
    pub fn core() -> Self {
        let plugins: Vec<Box<dyn EditorPlugin>> = vec![
            Box::new(CoreParagraphPlugin),
            Box::new(CoreNormalizePlugin),
            Box::new(TextEditingPlugin),
        ];
        Self::new(plugins).expect("core registry must be valid")
    }

    /// Everything the note editor mounts.
    #[allow(clippy::expect_used)]
    pub fn notes() -> Self {
        let plugins: Vec<Box<dyn EditorPlugin>> = vec![
            Box::new(CoreParagraphPlugin),
            Box::new(CoreNormalizePlugin),
            Box::new(TextEditingPlugin),
            Box::new(BlockKindsPlugin),
            Box::new(ListStructurePlugin),
            Box::new(BlockCommandsPlugin),
            Box::new(MarksCommandsPlugin),
            Box::new(AutoformatPlugin),
        ];
        Self::new(plugins).expect("notes registry must be valid")
    }

    pub fn register_plugin(&mut self, plugin: Box<dyn EditorPlugin>) -> Result<(), String> {
        for spec in plugin.node_specs() {
            if self.node_specs.contains_key(&spec.kind) {
                return Err(format!("Duplicate node spec kind: {}", spec.kind));
            }
            self.node_specs.insert(spec.kind.clone(), spec);
        }

        self.transaction_transforms
            .extend(plugin.transaction_transforms());

        self.normalize_passes.extend(plugin.normalize_passes());

        for cmd in plugin.commands() {
            if self.commands.contains_key(&cmd.id) {
                return Err(format!("Duplicate command id: {}", cmd.id));
            }
            self.commands.insert(cmd.id.clone(), cmd);
        }

        for query in plugin.queries() {
            if self.queries.contains_key(&query.id) {
                return Err(format!("Duplicate query id: {}", query.id));
            }
            self.queries.insert(query.id.clone(), query);
        }

        Ok(())
    }

    pub fn node_specs(&self) -> &HashMap<String, NodeSpec> {
        &self.node_specs
    }

    pub fn transaction_transforms(&self) -> &[Box<dyn TransactionTransform>] {
        &self.transaction_transforms
    }

    pub fn normalize_passes(&self) -> &[Box<dyn NormalizePass>] {
        &self.normalize_passes
    }

    pub fn commands(&self) -> &HashMap<String, CommandSpec> {
        &self.commands
    }

    pub fn command(&self, id: &str) -> Option<CommandSpec> {
        self.commands.get(id).cloned()
    }

    pub fn queries(&self) -> &HashMap<String, QuerySpec> {
        &self.queries
    }

    pub fn query(&self, id: &str) -> Option<QuerySpec> {
        self.queries.get(id).cloned()
    }

    pub fn children_constraint(&self, kind: &BlockKind) -> ChildConstraint {
        match self.node_specs.get(kind.name()) {
            Some(spec) => spec.children.clone(),
            None if kind.is_text_block() => ChildConstraint::InlineOnly,
            None => ChildConstraint::BlockOnly,
        }
    }

    /// Ops of the first pass with something to fix. Passes see the same
    /// snapshot, so running them one at a time keeps their positions valid.
    pub fn normalize(&self, doc: &Document, ids: &mut IdAllocator) -> Vec<Op> {
        for pass in &self.normalize_passes {
            let ops = pass.run(doc, self, ids);
            if !ops.is_empty() {
                trace!(pass = pass.id(), ops = ops.len(), "normalize");
                return ops;
            }
        }
        Vec::new()
    }

    pub fn normalize_selection(&self, doc: &Document, selection: &Selection) -> Selection {
        let fallback = doc
            .first_text_point()
            .unwrap_or(Point::new(NodeId::ROOT, 0));

        let anchor = normalize_point_to_existing_text(doc, &selection.anchor)
            .or_else(|| normalize_point_to_existing_text(doc, &selection.focus))
            .unwrap_or(fallback);
        let focus = normalize_point_to_existing_text(doc, &selection.focus).unwrap_or(anchor);

        Selection { anchor, focus }
    }
}

fn normalize_point_to_existing_text(doc: &Document, point: &Point) -> Option<Point> {
    if point.node == NodeId::ROOT {
        return doc.first_text_point();
    }
    match doc.node(point.node)? {
        Node::Text(t) => Some(Point::new(
            t.id,
            clamp_to_char_boundary(&t.text, point.offset),
        )),
        Node::Element(el) => first_text_point_in(&el.children),
    }
}

/// Applies a command's transaction, skipping empty ones.
pub(crate) fn commit(editor: &mut Editor, tx: Transaction, what: &str) -> Result<(), CommandError> {
    if tx.is_empty() {
        return Ok(());
    }
    editor
        .apply(tx)
        .map_err(|e| CommandError::new(format!("Failed to {what}: {e}")))
}

struct CoreParagraphPlugin;

impl EditorPlugin for CoreParagraphPlugin {
    fn id(&self) -> &'static str {
        "core.paragraph"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec::text_block(&BlockKind::Paragraph)]
    }
}

struct CoreNormalizePlugin;

impl EditorPlugin for CoreNormalizePlugin {
    fn id(&self) -> &'static str {
        "core.normalize"
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![
            Box::new(EnsureNonEmptyDocument),
            Box::new(EnsureTextBlocksHaveTextLeaf),
            Box::new(MergeAdjacentTextLeaves),
        ]
    }
}

struct EnsureNonEmptyDocument;

impl NormalizePass for EnsureNonEmptyDocument {
    fn id(&self) -> &'static str {
        "core.ensure_non_empty_document"
    }

    fn run(&self, doc: &Document, _registry: &PluginRegistry, ids: &mut IdAllocator) -> Vec<Op> {
        if !doc.text_blocks().is_empty() {
            return Vec::new();
        }
        let mut paragraph = Node::paragraph("");
        if let Node::Element(el) = &mut paragraph {
            el.id = ids.fresh();
            for child in &mut el.children {
                if let Node::Text(t) = child {
                    t.id = ids.fresh();
                }
            }
        }
        vec![Op::InsertNode {
            parent: NodeId::ROOT,
            index: doc.children.len(),
            node: paragraph,
        }]
    }
}

/// Every node in `doc` that holds children, including the root.
pub(crate) fn containers(doc: &Document) -> Vec<(NodeId, Option<&ElementNode>, &[Node])> {
    fn walk<'a>(
        children: &'a [Node],
        out: &mut Vec<(NodeId, Option<&'a ElementNode>, &'a [Node])>,
    ) {
        for node in children {
            if let Node::Element(el) = node {
                out.push((el.id, Some(el), &el.children));
                walk(&el.children, out);
            }
        }
    }

    let mut out = vec![(NodeId::ROOT, None, doc.children.as_slice())];
    walk(&doc.children, &mut out);
    out
}

struct EnsureTextBlocksHaveTextLeaf;

impl NormalizePass for EnsureTextBlocksHaveTextLeaf {
    fn id(&self) -> &'static str {
        "core.ensure_text_blocks_have_text_leaf"
    }

    fn run(&self, doc: &Document, registry: &PluginRegistry, ids: &mut IdAllocator) -> Vec<Op> {
        let mut ops = Vec::new();
        for (id, el, children) in containers(doc) {
            let Some(el) = el else {
                continue;
            };
            if registry.children_constraint(&el.kind) != ChildConstraint::InlineOnly {
                continue;
            }
            if !children.iter().any(|n| matches!(n, Node::Text(_))) {
                let mut leaf = TextNode::new("");
                leaf.id = ids.fresh();
                ops.push(Op::InsertNode {
                    parent: id,
                    index: 0,
                    node: Node::Text(leaf),
                });
            }
        }
        ops
    }
}

struct MergeAdjacentTextLeaves;

impl NormalizePass for MergeAdjacentTextLeaves {
    fn id(&self) -> &'static str {
        "core.merge_adjacent_text_leaves"
    }

    fn run(&self, doc: &Document, _registry: &PluginRegistry, _ids: &mut IdAllocator) -> Vec<Op> {
        let blocks = doc.text_blocks();

        // Empty leaves go first; a block always keeps at least one leaf.
        let mut ops: Vec<Op> = Vec::new();
        for block in &blocks {
            let leaves: Vec<&TextNode> = block.text_leaves().collect();
            if leaves.len() < 2 {
                continue;
            }
            let keep = leaves
                .iter()
                .find(|t| !t.text.is_empty())
                .unwrap_or(&leaves[0])
                .id;
            ops.extend(
                leaves
                    .iter()
                    .filter(|t| t.text.is_empty() && t.id != keep)
                    .map(|t| Op::RemoveNode { node: t.id }),
            );
        }
        if !ops.is_empty() {
            return ops;
        }

        for block in &blocks {
            let mut run_head: Option<&TextNode> = None;
            for child in &block.children {
                let Node::Text(leaf) = child else {
                    run_head = None;
                    continue;
                };
                match run_head {
                    Some(head) if head.marks == leaf.marks => ops.push(Op::MergeText {
                        node: head.id,
                        next: leaf.id,
                    }),
                    _ => run_head = Some(leaf),
                }
            }
        }
        ops
    }
}
