use serde::Deserialize;
use serde_json::Value;

use crate::core::{BlockKind, Document, Editor, ElementNode, IdAllocator, Node, NodeId};
use crate::drag::DropSide;
use crate::ops::{Op, Transaction};
use crate::plugin::{
    CommandError, CommandSpec, EditorPlugin, NodeSpec, NormalizePass, PluginRegistry, QueryError,
    QuerySpec, commit, containers,
};

pub(crate) struct BlockKindsPlugin;

impl EditorPlugin for BlockKindsPlugin {
    fn id(&self) -> &'static str {
        "blocks.kinds"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![
            NodeSpec::text_block(&BlockKind::Heading { level: 1 }),
            NodeSpec::text_block(&BlockKind::Quote),
            NodeSpec::text_block(&BlockKind::Code),
            NodeSpec::text_block(&BlockKind::ListItem),
            NodeSpec::container(&BlockKind::List { ordered: false }),
        ]
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![Box::new(NormalizeHeadingLevels)]
    }
}

struct NormalizeHeadingLevels;

impl NormalizePass for NormalizeHeadingLevels {
    fn id(&self) -> &'static str {
        "blocks.normalize_heading_levels"
    }

    fn run(&self, doc: &Document, _registry: &PluginRegistry, _ids: &mut IdAllocator) -> Vec<Op> {
        doc.text_blocks()
            .into_iter()
            .filter_map(|el| match el.kind {
                BlockKind::Heading { level } if !(1..=6).contains(&level) => Some(Op::SetBlockKind {
                    node: el.id,
                    kind: BlockKind::Heading {
                        level: level.clamp(1, 6),
                    },
                }),
                _ => None,
            })
            .collect()
    }
}

pub(crate) struct ListStructurePlugin;

impl EditorPlugin for ListStructurePlugin {
    fn id(&self) -> &'static str {
        "blocks.lists"
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![Box::new(NormalizeListStructure)]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("list.toggle_bulleted", "Bulleted list", |editor, _args| {
                toggle_list(editor, false)
                    .map_err(CommandError::new)
                    .and_then(|tx| commit(editor, tx, "toggle bulleted list"))
            })
            .description("Turn the selected blocks into a bulleted list, or back into paragraphs.")
            .keywords(["list", "bullet", "unordered"]),
            CommandSpec::new("list.toggle_numbered", "Numbered list", |editor, _args| {
                toggle_list(editor, true)
                    .map_err(CommandError::new)
                    .and_then(|tx| commit(editor, tx, "toggle numbered list"))
            })
            .description("Turn the selected blocks into a numbered list, or back into paragraphs.")
            .keywords(["list", "number", "numbered", "ordered"]),
        ]
    }
}

fn is_list_item(node: &Node) -> bool {
    matches!(node, Node::Element(el) if el.kind == BlockKind::ListItem)
}

pub(crate) fn empty_list(id: NodeId, kind: BlockKind) -> Node {
    Node::Element(ElementNode {
        id,
        kind,
        children: Vec::new(),
    })
}

/// Lists hold only list items, list items live only in lists, no list is
/// empty, and neighbouring lists of the same kind are one list.
struct NormalizeListStructure;

impl NormalizePass for NormalizeListStructure {
    fn id(&self) -> &'static str {
        "blocks.normalize_list_structure"
    }

    fn run(&self, doc: &Document, _registry: &PluginRegistry, ids: &mut IdAllocator) -> Vec<Op> {
        let ops = lift_non_items(doc, ids);
        if !ops.is_empty() {
            return ops;
        }
        let ops = wrap_stray_items(doc, ids);
        if !ops.is_empty() {
            return ops;
        }
        let ops = remove_empty_lists(doc);
        if !ops.is_empty() {
            return ops;
        }
        merge_adjacent_lists(doc)
    }
}

/// Splits the first list holding non-items around them, one list per run.
fn lift_non_items(doc: &Document, ids: &mut IdAllocator) -> Vec<Op> {
    for (id, el, children) in containers(doc) {
        let Some(el) = el.filter(|el| el.kind.is_list()) else {
            continue;
        };
        if children.iter().all(is_list_item) {
            continue;
        }
        let Some((parent, index)) = doc.position_of(id) else {
            continue;
        };

        let mut segments: Vec<(bool, Vec<NodeId>)> = Vec::new();
        for child in children {
            let item = is_list_item(child);
            match segments.last_mut() {
                Some((kind, members)) if *kind == item => members.push(child.id()),
                _ => segments.push((item, vec![child.id()])),
            }
        }

        let mut ops = Vec::new();
        let mut insert_at = index + 1;
        for (seg_ix, (item, members)) in segments.into_iter().enumerate() {
            if seg_ix == 0 && item {
                continue;
            }
            if item {
                let list_id = ids.fresh();
                ops.push(Op::InsertNode {
                    parent,
                    index: insert_at,
                    node: empty_list(list_id, el.kind),
                });
                insert_at += 1;
                ops.extend(members.iter().enumerate().map(|(j, member)| Op::MoveNode {
                    node: *member,
                    parent: list_id,
                    index: j,
                }));
            } else {
                for member in members {
                    ops.push(Op::MoveNode {
                        node: member,
                        parent,
                        index: insert_at,
                    });
                    insert_at += 1;
                }
            }
        }
        return ops;
    }
    Vec::new()
}

fn wrap_stray_items(doc: &Document, ids: &mut IdAllocator) -> Vec<Op> {
    let mut ops = Vec::new();
    for (id, el, children) in containers(doc) {
        if el.is_some_and(|el| el.kind.is_list() || el.kind.is_text_block()) {
            continue;
        }
        // Each wrap leaves the sibling count unchanged, so indices stay valid.
        for (ix, child) in children.iter().enumerate() {
            if !is_list_item(child) {
                continue;
            }
            let list_id = ids.fresh();
            ops.push(Op::InsertNode {
                parent: id,
                index: ix,
                node: empty_list(list_id, BlockKind::List { ordered: false }),
            });
            ops.push(Op::MoveNode {
                node: child.id(),
                parent: list_id,
                index: 0,
            });
        }
    }
    ops
}

fn remove_empty_lists(doc: &Document) -> Vec<Op> {
    containers(doc)
        .into_iter()
        .filter_map(|(id, el, children)| {
            el.filter(|el| el.kind.is_list() && children.is_empty())
                .map(|_| Op::RemoveNode { node: id })
        })
        .collect()
}

fn merge_adjacent_lists(doc: &Document) -> Vec<Op> {
    let mut ops = Vec::new();
    for (_, _, children) in containers(doc) {
        let mut head: Option<(&ElementNode, usize)> = None;
        for child in children {
            let Node::Element(el) = child else {
                head = None;
                continue;
            };
            if !el.kind.is_list() {
                head = None;
                continue;
            }
            match &mut head {
                Some((first, len)) if first.kind == el.kind => {
                    for item in &el.children {
                        ops.push(Op::MoveNode {
                            node: item.id(),
                            parent: first.id,
                            index: *len,
                        });
                        *len += 1;
                    }
                    ops.push(Op::RemoveNode { node: el.id });
                }
                _ => head = Some((el, el.children.len())),
            }
        }
    }
    ops
}

fn focus_block(editor: &Editor) -> Option<&ElementNode> {
    let doc = editor.doc();
    let block = doc.parent_of(editor.selection().focus.node)?;
    doc.element(block)
}

pub(crate) struct BlockCommandsPlugin;

fn set_kind_command(id: &'static str, label: &'static str, kind: BlockKind) -> CommandSpec {
    CommandSpec::new(id, label, move |editor, _args| {
        set_blocks_kind(editor, kind)
            .map_err(CommandError::new)
            .and_then(|tx| commit(editor, tx, label))
    })
}

#[derive(Debug, Deserialize)]
struct MoveArgs {
    source: NodeId,
    target: NodeId,
    side: DropSide,
}

impl EditorPlugin for BlockCommandsPlugin {
    fn id(&self) -> &'static str {
        "blocks.commands"
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            set_kind_command("block.set_paragraph", "Text", BlockKind::Paragraph)
                .description("Turn the selected blocks into plain paragraphs.")
                .keywords(["text", "paragraph", "p"]),
            CommandSpec::new("block.set_heading", "Heading", |editor, args| {
                let level = args
                    .as_ref()
                    .and_then(|v| v.get("level"))
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| CommandError::new("Missing args.level"))?;
                let level = u8::try_from(level.clamp(1, 6)).unwrap_or(1);
                set_blocks_kind(editor, BlockKind::Heading { level })
                    .map_err(CommandError::new)
                    .and_then(|tx| commit(editor, tx, "set heading"))
            })
            .description("Turn the selected blocks into a heading of args.level.")
            .keywords(["heading", "title", "h1", "h2", "h3"]),
            set_kind_command("block.set_quote", "Quote", BlockKind::Quote)
                .description("Turn the selected blocks into quotes.")
                .keywords(["quote", "blockquote", "citation"]),
            set_kind_command("block.set_code", "Code", BlockKind::Code)
                .description("Turn the selected blocks into code blocks.")
                .keywords(["code", "codeblock", "snippet"]),
            CommandSpec::new("block.move", "Move block", |editor, args| {
                let args: MoveArgs = args
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|err| CommandError::new(format!("Invalid move args: {err}")))?
                    .ok_or_else(|| CommandError::new("Missing move args"))?;
                move_block(editor, args.source, args.target, args.side)
                    .map_err(CommandError::new)
                    .and_then(|tx| commit(editor, tx, "move block"))
            })
            .description("Move a block before or after another block.")
            .hidden(true),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![
            QuerySpec::new("block.kind", |editor, _args| {
                let Some(block) = focus_block(editor) else {
                    return Ok(Value::Null);
                };
                serde_json::to_value(block.kind)
                    .map_err(|err| QueryError::new(format!("Failed to encode block kind: {err}")))
            }),
            QuerySpec::new("block.heading_level", |editor, _args| {
                Ok(match focus_block(editor).map(|el| el.kind) {
                    Some(BlockKind::Heading { level }) => Value::from(level),
                    _ => Value::Null,
                })
            }),
        ]
    }
}

/// List items given another kind end up lifted out of their list by
/// normalization.
fn set_blocks_kind(editor: &mut Editor, kind: BlockKind) -> Result<Transaction, String> {
    let doc = editor.doc();
    let blocks = doc.selected_blocks(editor.selection());
    if blocks.is_empty() {
        return Err("Selection is not in a text block".into());
    }
    let ops = blocks
        .iter()
        .filter_map(|id| doc.element(*id))
        .filter(|el| el.kind != kind)
        .map(|el| Op::SetBlockKind { node: el.id, kind })
        .collect();
    Ok(Transaction::new(ops).source(format!("command:block.set_{}", kind.name())))
}

fn toggle_list(editor: &mut Editor, ordered: bool) -> Result<Transaction, String> {
    let target = BlockKind::List { ordered };
    let doc = editor.doc();
    let blocks = doc.selected_blocks(editor.selection());
    if blocks.is_empty() {
        return Err("Selection is not in a text block".into());
    }

    let list_of = |id: NodeId| -> Option<(NodeId, BlockKind)> {
        if doc.element(id)?.kind != BlockKind::ListItem {
            return None;
        }
        let parent = doc.parent_of(id)?;
        let kind = doc.element(parent)?.kind;
        kind.is_list().then_some((parent, kind))
    };

    if blocks
        .iter()
        .all(|id| list_of(*id).is_some_and(|(_, kind)| kind == target))
    {
        let ops = blocks
            .iter()
            .map(|id| Op::SetBlockKind {
                node: *id,
                kind: BlockKind::Paragraph,
            })
            .collect();
        return Ok(Transaction::new(ops).source("command:list.unwrap"));
    }

    let mut relabel: Vec<NodeId> = Vec::new();
    let mut wrap: Vec<(NodeId, NodeId, usize)> = Vec::new();
    for id in &blocks {
        match list_of(*id) {
            Some((list, kind)) => {
                if kind != target && !relabel.contains(&list) {
                    relabel.push(list);
                }
            }
            None => {
                let (parent, index) = doc
                    .position_of(*id)
                    .ok_or_else(|| format!("Block {id} is detached"))?;
                wrap.push((*id, parent, index));
            }
        }
    }

    let mut ops: Vec<Op> = relabel
        .into_iter()
        .map(|list| Op::SetBlockKind {
            node: list,
            kind: target,
        })
        .collect();
    // Wrapping leaves each parent's child count unchanged, so the recorded
    // indices stay valid across the whole batch.
    for (block, parent, index) in wrap {
        let list_id = editor.fresh_id();
        ops.push(Op::InsertNode {
            parent,
            index,
            node: empty_list(list_id, target),
        });
        ops.push(Op::MoveNode {
            node: block,
            parent: list_id,
            index: 0,
        });
        ops.push(Op::SetBlockKind {
            node: block,
            kind: BlockKind::ListItem,
        });
    }
    Ok(Transaction::new(ops).source("command:list.wrap"))
}

/// Moves `source` next to `target`. Text blocks adopt the kind their new
/// parent expects: list items outside a list become paragraphs and blocks
/// dropped into a list become items.
pub(crate) fn move_block(
    editor: &Editor,
    source: NodeId,
    target: NodeId,
    side: DropSide,
) -> Result<Transaction, String> {
    let doc = editor.doc();
    if source == target {
        return Err("Cannot move a block next to itself".into());
    }
    let src = doc
        .element(source)
        .ok_or_else(|| format!("Unknown source block {source}"))?;
    if doc.element(target).is_none() {
        return Err(format!("Unknown target block {target}"));
    }
    if doc.contains_within(source, target) {
        return Err(format!("Cannot move {source} inside its own subtree"));
    }

    let (src_parent, src_index) = doc
        .position_of(source)
        .ok_or_else(|| format!("Block {source} is detached"))?;
    let (parent, mut index) = doc
        .position_of(target)
        .ok_or_else(|| format!("Block {target} is detached"))?;
    if parent == src_parent && src_index < index {
        index -= 1;
    }
    if side == DropSide::After {
        index += 1;
    }

    let mut ops = vec![Op::MoveNode {
        node: source,
        parent,
        index,
    }];
    let into_list = doc.element(parent).is_some_and(|el| el.kind.is_list());
    match (into_list, src.kind) {
        (true, kind) if kind.is_text_block() && kind != BlockKind::ListItem => {
            ops.push(Op::SetBlockKind {
                node: source,
                kind: BlockKind::ListItem,
            })
        }
        (false, BlockKind::ListItem) => ops.push(Op::SetBlockKind {
            node: source,
            kind: BlockKind::Paragraph,
        }),
        _ => {}
    }
    Ok(Transaction::new(ops).source("command:block.move"))
}
