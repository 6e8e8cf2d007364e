use tracing::debug;

use crate::blocks::empty_list;
use crate::core::{
    BlockKind, Document, Editor, IdAllocator, MarkKind, Point, Selection, apply_op_to,
};
use crate::markers::RangeMarkers;
use crate::ops::{Op, Transaction};
use crate::plugin::{EditorPlugin, TransactionTransform};

pub(crate) struct AutoformatPlugin;

impl EditorPlugin for AutoformatPlugin {
    fn id(&self) -> &'static str {
        "autoformat"
    }

    fn transaction_transforms(&self) -> Vec<Box<dyn TransactionTransform>> {
        vec![Box::new(AutoformatOnTextInsert)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shortcut {
    Block(BlockKind),
    List { ordered: bool },
}

fn shortcut_for(text: &str) -> Option<Shortcut> {
    let shortcut = match text {
        "> " => Shortcut::Block(BlockKind::Quote),
        "``` " => Shortcut::Block(BlockKind::Code),
        "- " | "* " => Shortcut::List { ordered: false },
        "1. " => Shortcut::List { ordered: true },
        _ => {
            let hashes = text.strip_suffix(' ')?;
            if hashes.is_empty() || hashes.len() > 6 || !hashes.bytes().all(|b| b == b'#') {
                return None;
            }
            let level = u8::try_from(hashes.len()).ok()?;
            Shortcut::Block(BlockKind::Heading { level })
        }
    };
    Some(shortcut)
}

/// Opening and closing delimiters of the inline shortcuts, longest first so
/// `**` wins over `*`.
const INLINE_DELIMITERS: [(&str, MarkKind); 5] = [
    ("**", MarkKind::Bold),
    ("__", MarkKind::Bold),
    ("*", MarkKind::Italic),
    ("_", MarkKind::Italic),
    ("`", MarkKind::Code),
];

/// Finds a `<d>inner<d>` run closing at the end of `text`. Returns the mark,
/// the byte offset of the opening delimiter and the delimiter length.
fn inline_format_for(text: &str) -> Option<(MarkKind, usize, usize)> {
    for (delim, kind) in INLINE_DELIMITERS {
        let Some(body) = text.strip_suffix(delim) else {
            continue;
        };
        if delim.len() == 1 && body.ends_with(delim) {
            continue;
        }
        let Some(open) = body.rfind(delim) else {
            continue;
        };
        let inner = &body[open + delim.len()..];
        if inner.is_empty()
            || inner.starts_with(char::is_whitespace)
            || inner.ends_with(char::is_whitespace)
        {
            continue;
        }
        let before = body[..open].chars().next_back();
        if before.is_some_and(|ch| ch.is_alphanumeric() || delim.starts_with(ch)) {
            continue;
        }
        return Some((kind, open, delim.len()));
    }
    None
}

/// Markdown shortcuts typed into the editor: a paragraph whose whole text is
/// a prefix (`# `, `> `, `- `, `1. `, "``` ") becomes the matching block once
/// the trailing space is typed, and a closing `**`, `__`, `*`, `_` or `` ` ``
/// turns the delimited run before the caret into bold, italic or code.
struct AutoformatOnTextInsert;

impl TransactionTransform for AutoformatOnTextInsert {
    fn id(&self) -> &'static str {
        "autoformat.on_text_insert"
    }

    fn transform(
        &self,
        editor: &Editor,
        tx: &Transaction,
        ids: &mut IdAllocator,
    ) -> Option<Transaction> {
        if tx.meta.source.as_deref() != Some("command:text.insert") {
            return None;
        }

        // Replay the ops without normalizing so leaf ids match what the
        // appended ops will see.
        let mut doc = editor.doc().clone();
        let mut selection = *editor.selection();
        let mut markers = RangeMarkers::default();
        for op in &tx.ops {
            apply_op_to(&mut doc, &mut selection, &mut markers, op.clone()).ok()?;
        }
        if let Some(after) = tx.selection_after {
            selection = after;
        }
        if !selection.is_collapsed() {
            return None;
        }

        block_shortcut(&doc, &selection, tx, ids)
            .or_else(|| inline_shortcut(&doc, &selection, tx, ids))
    }
}

fn block_shortcut(
    doc: &Document,
    selection: &Selection,
    tx: &Transaction,
    ids: &mut IdAllocator,
) -> Option<Transaction> {
    let caret = doc.block_offset(&selection.focus)?;
    let block = doc.element(caret.block)?;
    if block.kind != BlockKind::Paragraph {
        return None;
    }
    let text = block.text();
    if caret.offset != text.len() {
        return None;
    }
    let shortcut = shortcut_for(&text)?;
    let (parent, index) = doc.position_of(block.id)?;
    if doc.element(parent).is_some_and(|el| el.kind.is_list()) {
        return None;
    }

    let mut ops = tx.ops.clone();
    ops.extend(
        block
            .text_leaves()
            .filter(|leaf| !leaf.text.is_empty())
            .map(|leaf| Op::RemoveText {
                node: leaf.id,
                range: 0..leaf.text.len(),
            }),
    );
    match shortcut {
        Shortcut::Block(kind) => ops.push(Op::SetBlockKind {
            node: block.id,
            kind,
        }),
        Shortcut::List { ordered } => {
            let list = ids.fresh();
            ops.push(Op::InsertNode {
                parent,
                index,
                node: empty_list(list, BlockKind::List { ordered }),
            });
            ops.push(Op::MoveNode {
                node: block.id,
                parent: list,
                index: 0,
            });
            ops.push(Op::SetBlockKind {
                node: block.id,
                kind: BlockKind::ListItem,
            });
        }
    }

    let first_leaf = block.text_leaves().next()?.id;
    debug!(shortcut = ?shortcut, block = %block.id, "autoformat");
    let mut next = Transaction::new(ops).selection_after(Selection::collapsed(Point::new(
        first_leaf, 0,
    )));
    next.meta = tx.meta.clone();
    Some(next)
}

/// Works inside the caret's leaf. Text typed right after the formatted run
/// goes back to the leaf's own marks.
fn inline_shortcut(
    doc: &Document,
    selection: &Selection,
    tx: &Transaction,
    ids: &mut IdAllocator,
) -> Option<Transaction> {
    let leaf = doc.text_node(selection.focus.node)?;
    let block = doc.parent_of(leaf.id).and_then(|id| doc.element(id))?;
    if block.kind == BlockKind::Code || leaf.marks.code {
        return None;
    }
    let caret = selection.focus.offset;
    let (kind, open, delim) = inline_format_for(leaf.text.get(..caret)?)?;

    let close = caret - delim;
    let inner_end = close - delim;
    let mut ops = tx.ops.clone();
    ops.push(Op::RemoveText {
        node: leaf.id,
        range: close..caret,
    });
    ops.push(Op::RemoveText {
        node: leaf.id,
        range: open..open + delim,
    });
    if inner_end < leaf.text.len() - 2 * delim {
        ops.push(Op::SplitText {
            node: leaf.id,
            offset: inner_end,
            new_id: ids.fresh(),
        });
    }
    let middle = if open > 0 {
        let id = ids.fresh();
        ops.push(Op::SplitText {
            node: leaf.id,
            offset: open,
            new_id: id,
        });
        id
    } else {
        leaf.id
    };
    ops.push(Op::SetTextMarks {
        node: middle,
        marks: leaf.marks.clone().with(kind, true),
    });

    debug!(mark = ?kind, leaf = %leaf.id, "inline autoformat");
    let mut next = Transaction::new(ops)
        .selection_after(Selection::collapsed(Point::new(middle, inner_end - open)));
    next.meta = tx.meta.clone();
    next.meta.caret_marks = Some(leaf.marks.clone());
    Some(next)
}
