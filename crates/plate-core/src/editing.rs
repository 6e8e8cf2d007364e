use std::ops::Range;

use crate::core::{
    BlockKind, Editor, ElementNode, Node, NodeId, Point, Selection, TextNode,
    clamp_to_char_boundary, last_text_point_in,
};
use crate::ops::{Op, Transaction};
use crate::plugin::{CommandError, CommandSpec, EditorPlugin, commit};

pub(crate) struct TextEditingPlugin;

impl EditorPlugin for TextEditingPlugin {
    fn id(&self) -> &'static str {
        "core.text_editing"
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("text.insert", "Insert text", |editor, args| {
                let text = args
                    .as_ref()
                    .and_then(|v| v.get("text"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CommandError::new("Missing args.text"))?
                    .to_string();
                insert_text(editor, &text)
            })
            .description("Insert text at the caret, replacing any selected range.")
            .hidden(true),
            CommandSpec::new("text.delete_backward", "Delete backward", |editor, _args| {
                let tx = delete_backward(editor).map_err(CommandError::new)?;
                commit(editor, tx, "delete backward")
            })
            .description("Delete the character before the caret, or the selected range.")
            .hidden(true),
            CommandSpec::new("text.delete_selection", "Delete selection", |editor, _args| {
                let tx = delete_selection(editor).map_err(CommandError::new)?;
                commit(editor, tx, "delete selection")
            })
            .hidden(true),
            CommandSpec::new("block.split", "Split block", |editor, _args| {
                if !editor.selection().is_collapsed() {
                    let tx = delete_selection(editor).map_err(CommandError::new)?;
                    commit(editor, tx, "delete selection")?;
                }
                let tx = split_block(editor).map_err(CommandError::new)?;
                commit(editor, tx, "split block")
            })
            .description("Start a new block at the caret (Enter).")
            .keywords(["enter", "newline", "split"])
            .hidden(true),
        ]
    }
}

/// Where a collapsed caret sits, resolved against the tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Caret {
    pub leaf: NodeId,
    pub offset: usize,
    pub leaf_index: usize,
    pub block: NodeId,
    pub parent: NodeId,
    pub block_index: usize,
}

pub(crate) fn caret(editor: &Editor) -> Result<Caret, String> {
    let doc = editor.doc();
    let focus = editor.selection().focus;
    let leaf = doc
        .text_node(focus.node)
        .ok_or_else(|| "Selection is not in a text leaf".to_string())?;
    let (block, leaf_index) = doc
        .position_of(focus.node)
        .ok_or_else(|| "Selection leaf is detached".to_string())?;
    let (parent, block_index) = doc
        .position_of(block)
        .ok_or_else(|| "Selection block is detached".to_string())?;
    Ok(Caret {
        leaf: focus.node,
        offset: clamp_to_char_boundary(&leaf.text, focus.offset),
        leaf_index,
        block,
        parent,
        block_index,
    })
}

fn insert_text(editor: &mut Editor, text: &str) -> Result<(), CommandError> {
    if text.is_empty() {
        return Ok(());
    }
    // Line breaks are stored as `\n` only.
    let text = &text.replace("\r\n", "\n").replace('\r', "\n");
    if !editor.selection().is_collapsed() {
        let tx = delete_selection(editor).map_err(CommandError::new)?;
        commit(editor, tx, "delete selection")?;
    }
    let tx = insert_text_at_caret(editor, text).map_err(CommandError::new)?;
    // Pending marks are spent on this insertion; the transaction may set new
    // ones.
    editor.set_caret_marks(None);
    commit(editor, tx, "insert text")
}

fn insert_text_at_caret(editor: &mut Editor, text: &str) -> Result<Transaction, String> {
    let caret = caret(editor)?;
    let (leaf_len, leaf_marks) = editor
        .doc()
        .text_node(caret.leaf)
        .map(|t| (t.text.len(), t.marks.clone()))
        .ok_or_else(|| "Selection is not in a text leaf".to_string())?;

    match editor.caret_marks() {
        Some(marks) if marks != leaf_marks => {
            let mut ops = Vec::new();
            let index = if caret.offset == 0 {
                caret.leaf_index
            } else {
                if caret.offset < leaf_len {
                    let tail = editor.fresh_id();
                    ops.push(Op::SplitText {
                        node: caret.leaf,
                        offset: caret.offset,
                        new_id: tail,
                    });
                }
                caret.leaf_index + 1
            };
            let id = editor.fresh_id();
            ops.push(Op::InsertNode {
                parent: caret.block,
                index,
                node: Node::Text(TextNode {
                    id,
                    text: text.to_string(),
                    marks,
                }),
            });
            Ok(Transaction::new(ops)
                .selection_after(Selection::collapsed(Point::new(id, text.len())))
                .source("command:text.insert"))
        }
        _ => Ok(Transaction::new(vec![Op::InsertText {
            node: caret.leaf,
            offset: caret.offset,
            text: text.to_string(),
        }])
        .selection_after(Selection::collapsed(Point::new(
            caret.leaf,
            caret.offset + text.len(),
        )))
        .source("command:text.insert")),
    }
}

fn prev_char_boundary(s: &str, ix: usize) -> usize {
    s[..ix]
        .char_indices()
        .next_back()
        .map(|(i, _)| i)
        .unwrap_or(0)
}

pub(crate) fn delete_backward(editor: &mut Editor) -> Result<Transaction, String> {
    if !editor.selection().is_collapsed() {
        return delete_selection(editor);
    }
    let caret = caret(editor)?;
    let doc = editor.doc();
    let block = doc
        .element(caret.block)
        .ok_or_else(|| "Caret block is missing".to_string())?;

    if caret.offset > 0 {
        let text = block.children[caret.leaf_index]
            .as_text()
            .map(|t| t.text.as_str())
            .unwrap_or("");
        let start = prev_char_boundary(text, caret.offset);
        return Ok(Transaction::new(vec![Op::RemoveText {
            node: caret.leaf,
            range: start..caret.offset,
        }])
        .selection_after(Selection::collapsed(Point::new(caret.leaf, start)))
        .source("command:text.delete_backward"));
    }

    if let Some(prev) = block.children[..caret.leaf_index]
        .iter()
        .rev()
        .filter_map(Node::as_text)
        .find(|t| !t.text.is_empty())
    {
        let start = prev_char_boundary(&prev.text, prev.text.len());
        return Ok(Transaction::new(vec![Op::RemoveText {
            node: prev.id,
            range: start..prev.text.len(),
        }])
        .selection_after(Selection::collapsed(Point::new(prev.id, start)))
        .source("command:text.delete_backward"));
    }

    if block.kind != BlockKind::Paragraph {
        return Ok(Transaction::new(vec![Op::SetBlockKind {
            node: block.id,
            kind: BlockKind::Paragraph,
        }])
        .source("command:text.delete_backward"));
    }

    let blocks = doc.text_blocks();
    let Some(ix) = blocks.iter().position(|b| b.id == block.id) else {
        return Err("Caret block is not a text block".into());
    };
    let Some(prev_block) = ix.checked_sub(1).map(|ix| blocks[ix]) else {
        return Ok(Transaction::default());
    };

    let caret_after = last_text_point_in(&prev_block.children)
        .ok_or_else(|| "Previous block has no text".to_string())?;
    let mut ops: Vec<Op> = block
        .children
        .iter()
        .enumerate()
        .map(|(j, child)| Op::MoveNode {
            node: child.id(),
            parent: prev_block.id,
            index: prev_block.children.len() + j,
        })
        .collect();
    ops.push(Op::RemoveNode { node: block.id });

    Ok(Transaction::new(ops)
        .selection_after(Selection::collapsed(caret_after))
        .source("command:text.delete_backward"))
}

fn remove_range_in_block(block: &ElementNode, range: Range<usize>) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut cursor = 0;
    for leaf in block.text_leaves() {
        let (start, end) = (cursor, cursor + leaf.text.len());
        cursor = end;
        if range.end <= start || range.start >= end {
            continue;
        }
        let local = range.start.saturating_sub(start)..(range.end - start).min(leaf.text.len());
        if local.start < local.end {
            ops.push(Op::RemoveText {
                node: leaf.id,
                range: local,
            });
        }
    }
    ops
}

pub(crate) fn delete_selection(editor: &mut Editor) -> Result<Transaction, String> {
    let doc = editor.doc();
    let selection = *editor.selection();
    let (start, end) = doc
        .ordered(&selection)
        .ok_or_else(|| "Selection is not in text".to_string())?;
    let (Some(start_at), Some(end_at)) = (doc.block_offset(&start), doc.block_offset(&end)) else {
        return Err("Selection is not in text".into());
    };
    if start_at == end_at {
        return Ok(Transaction::default());
    }

    let ranges = doc.block_ranges(start_at, end_at);
    let Some(&(first_block, _)) = ranges.first() else {
        return Ok(Transaction::default());
    };
    let first_len = doc
        .element(first_block)
        .map(|el| el.children.len())
        .unwrap_or(0);

    let mut ops = Vec::new();
    for (ix, (block, range)) in ranges.iter().enumerate() {
        let Some(el) = doc.element(*block) else {
            continue;
        };
        let is_first = ix == 0;
        let is_last = ix + 1 == ranges.len();
        if !is_first && !is_last {
            ops.push(Op::RemoveNode { node: *block });
            continue;
        }
        ops.extend(remove_range_in_block(el, range.clone()));
        if !is_first {
            ops.extend(el.children.iter().enumerate().map(|(j, child)| Op::MoveNode {
                node: child.id(),
                parent: first_block,
                index: first_len + j,
            }));
            ops.push(Op::RemoveNode { node: *block });
        }
    }

    Ok(Transaction::new(ops)
        .selection_after(Selection::collapsed(start))
        .source("command:text.delete_selection"))
}

pub(crate) fn split_block(editor: &mut Editor) -> Result<Transaction, String> {
    let caret = caret(editor)?;
    let block = editor
        .doc()
        .element(caret.block)
        .cloned()
        .ok_or_else(|| "Caret block is missing".to_string())?;

    match block.kind {
        BlockKind::Code => {
            return Ok(Transaction::new(vec![Op::InsertText {
                node: caret.leaf,
                offset: caret.offset,
                text: "\n".to_string(),
            }])
            .selection_after(Selection::collapsed(Point::new(caret.leaf, caret.offset + 1)))
            .source("command:block.split"));
        }
        BlockKind::ListItem if block.text_len() == 0 => {
            return Ok(Transaction::new(vec![Op::SetBlockKind {
                node: block.id,
                kind: BlockKind::Paragraph,
            }])
            .source("command:block.split"));
        }
        _ => {}
    }

    let next_kind = if block.kind == BlockKind::ListItem {
        BlockKind::ListItem
    } else {
        BlockKind::Paragraph
    };
    let leaf = block.children[caret.leaf_index]
        .as_text()
        .cloned()
        .ok_or_else(|| "Caret is not in a text leaf".to_string())?;

    // At the very start of a non-empty block, open an empty block above.
    let at_block_start = caret.offset == 0
        && block.children[..caret.leaf_index]
            .iter()
            .filter_map(Node::as_text)
            .all(|t| t.text.is_empty());
    if at_block_start && block.text_len() > 0 {
        let id = editor.fresh_id();
        let leaf_id = editor.fresh_id();
        return Ok(Transaction::new(vec![Op::InsertNode {
            parent: caret.parent,
            index: caret.block_index,
            node: Node::Element(ElementNode {
                id,
                kind: next_kind,
                children: vec![Node::Text(TextNode {
                    id: leaf_id,
                    text: String::new(),
                    marks: leaf.marks,
                })],
            }),
        }])
        .source("command:block.split"));
    }

    let mut ops = Vec::new();
    let mut moving: Vec<NodeId> = block.children[caret.leaf_index + 1..]
        .iter()
        .map(Node::id)
        .collect();
    if caret.offset < leaf.text.len() {
        let tail = editor.fresh_id();
        ops.push(Op::SplitText {
            node: caret.leaf,
            offset: caret.offset,
            new_id: tail,
        });
        moving.insert(0, tail);
    }

    let new_block = editor.fresh_id();
    let (children, caret_after) = match moving.first() {
        Some(first) => (Vec::new(), Point::new(*first, 0)),
        None => {
            let id = editor.fresh_id();
            (
                vec![Node::Text(TextNode {
                    id,
                    text: String::new(),
                    marks: leaf.marks,
                })],
                Point::new(id, 0),
            )
        }
    };
    ops.push(Op::InsertNode {
        parent: caret.parent,
        index: caret.block_index + 1,
        node: Node::Element(ElementNode {
            id: new_block,
            kind: next_kind,
            children,
        }),
    });
    ops.extend(moving.iter().enumerate().map(|(j, id)| Op::MoveNode {
        node: *id,
        parent: new_block,
        index: j,
    }));

    Ok(Transaction::new(ops)
        .selection_after(Selection::collapsed(caret_after))
        .source("command:block.split"))
}
