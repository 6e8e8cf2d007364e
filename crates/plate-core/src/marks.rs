use std::ops::Range;

use crate::core::{Editor, MarkKind, Marks, NodeId, clamp_to_char_boundary};
use crate::ops::{Op, Transaction};
use crate::plugin::{CommandError, CommandSpec, EditorPlugin, QueryError, QuerySpec, commit};

pub(crate) struct MarksCommandsPlugin;

fn toggle_command(id: &'static str, label: &'static str, kind: MarkKind) -> CommandSpec {
    CommandSpec::new(id, label, move |editor, _args| {
        toggle_mark(editor, kind)
            .map_err(CommandError::new)
            .and_then(|tx| commit(editor, tx, label))
    })
}

impl EditorPlugin for MarksCommandsPlugin {
    fn id(&self) -> &'static str {
        "marks.commands"
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            toggle_command("marks.toggle_bold", "Toggle bold", MarkKind::Bold)
                .description("Toggle bold on the current selection or caret.")
                .keywords(["bold", "strong", "mark"]),
            toggle_command("marks.toggle_italic", "Toggle italic", MarkKind::Italic)
                .description("Toggle italic on the current selection or caret.")
                .keywords(["italic", "emphasis", "mark"]),
            toggle_command(
                "marks.toggle_underline",
                "Toggle underline",
                MarkKind::Underline,
            )
            .description("Toggle underline on the current selection or caret.")
            .keywords(["underline", "mark"]),
            toggle_command("marks.toggle_code", "Toggle code", MarkKind::Code)
                .description("Toggle code mark on the current selection or caret.")
                .keywords(["code", "monospace", "mark"]),
            CommandSpec::new("marks.set_highlight", "Highlight", |editor, _args| {
                set_mark(editor, MarkKind::Highlight, true)
                    .map_err(CommandError::new)
                    .and_then(|tx| commit(editor, tx, "set highlight"))
            })
            .description("Highlight the selected range.")
            .keywords(["highlight", "comment", "mark"]),
            CommandSpec::new("marks.unset_highlight", "Remove highlight", |editor, _args| {
                set_mark(editor, MarkKind::Highlight, false)
                    .map_err(CommandError::new)
                    .and_then(|tx| commit(editor, tx, "unset highlight"))
            })
            .description("Remove the highlight from the selected range.")
            .keywords(["highlight", "mark", "reset"]),
            CommandSpec::new("marks.set_link", "Set link", |editor, args| {
                let url = args
                    .as_ref()
                    .and_then(|v| v.get("url"))
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .ok_or_else(|| CommandError::new("Missing args.url"))?
                    .to_string();
                set_link(editor, Some(url))
                    .map_err(CommandError::new)
                    .and_then(|tx| commit(editor, tx, "set link"))
            })
            .description("Link the selected range to args.url.")
            .keywords(["link", "url", "hyperlink"]),
            CommandSpec::new("marks.unset_link", "Remove link", |editor, _args| {
                set_link(editor, None)
                    .map_err(CommandError::new)
                    .and_then(|tx| commit(editor, tx, "unset link"))
            })
            .description("Remove the link from the selected range.")
            .keywords(["link", "unlink", "url"]),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec::new("marks.get_active", |editor, _args| {
            serde_json::to_value(active_marks(editor))
                .map_err(|err| QueryError::new(format!("Failed to encode marks: {err}")))
        })]
    }
}

/// Marks at the focus, overridden by any pending caret marks.
pub fn active_marks(editor: &Editor) -> Marks {
    if let Some(marks) = editor.caret_marks() {
        return marks;
    }
    editor
        .doc()
        .text_node(editor.selection().focus.node)
        .map(|t| t.marks.clone())
        .unwrap_or_default()
}

fn toggle_mark(editor: &mut Editor, kind: MarkKind) -> Result<Transaction, String> {
    let selection = *editor.selection();
    if selection.is_collapsed() {
        let current = active_marks(editor);
        let on = !current.has(kind);
        editor.set_caret_marks(Some(current.with(kind, on)));
        return Ok(Transaction::default());
    }

    let leaves = editor.doc().selected_leaves(&selection);
    let all_have = !leaves.is_empty() && leaves.iter().all(|t| t.marks.has(kind));
    set_mark(editor, kind, !all_have)
}

fn set_mark(editor: &mut Editor, kind: MarkKind, on: bool) -> Result<Transaction, String> {
    if editor.selection().is_collapsed() {
        return Ok(Transaction::default());
    }
    let source = if on {
        "command:marks.set"
    } else {
        "command:marks.unset"
    };
    restyle_selection(editor, &|marks| marks.with(kind, on), source)
}

/// With a collapsed caret the link applies to the next typed text.
fn set_link(editor: &mut Editor, url: Option<String>) -> Result<Transaction, String> {
    if editor.selection().is_collapsed() {
        let mut marks = active_marks(editor);
        marks.link = url;
        editor.set_caret_marks(Some(marks));
        return Ok(Transaction::default());
    }
    let source = if url.is_some() {
        "command:marks.set_link"
    } else {
        "command:marks.unset_link"
    };
    restyle_selection(
        editor,
        &|marks| Marks {
            link: url.clone(),
            ..marks
        },
        source,
    )
}

fn restyle_selection(
    editor: &mut Editor,
    apply: &dyn Fn(Marks) -> Marks,
    source: &'static str,
) -> Result<Transaction, String> {
    let selection = *editor.selection();
    let doc = editor.doc();
    let (start, end) = doc
        .ordered(&selection)
        .ok_or_else(|| "Selection is not in text".to_string())?;
    let (Some(start), Some(end)) = (doc.block_offset(&start), doc.block_offset(&end)) else {
        return Err("Selection is not in text".into());
    };

    let ranges = doc.block_ranges(start, end);
    let mut ops = Vec::new();
    for (block, range) in ranges {
        ops.extend(mark_range_ops(editor, block, range, apply));
    }
    Ok(Transaction::new(ops).source(source))
}

/// Splits leaves at the range edges and restyles what lies between, leaving
/// text untouched so range markers and the selection stay put.
fn mark_range_ops(
    editor: &mut Editor,
    block: NodeId,
    range: Range<usize>,
    apply: &dyn Fn(Marks) -> Marks,
) -> Vec<Op> {
    let Some(el) = editor.doc().element(block) else {
        return Vec::new();
    };
    let leaves: Vec<(NodeId, String, Marks)> = el
        .text_leaves()
        .map(|t| (t.id, t.text.clone(), t.marks.clone()))
        .collect();

    let mut ops = Vec::new();
    let mut cursor = 0usize;
    for (id, text, marks) in leaves {
        let (node_start, node_end) = (cursor, cursor + text.len());
        cursor = node_end;
        if text.is_empty() || range.end <= node_start || range.start >= node_end {
            continue;
        }
        let next = apply(marks.clone());
        if next == marks {
            continue;
        }

        let sel_start = clamp_to_char_boundary(&text, range.start.saturating_sub(node_start));
        let sel_end = clamp_to_char_boundary(&text, (range.end - node_start).min(text.len()));
        if sel_start >= sel_end {
            continue;
        }

        let mut middle = id;
        if sel_start > 0 {
            middle = editor.fresh_id();
            ops.push(Op::SplitText {
                node: id,
                offset: sel_start,
                new_id: middle,
            });
        }
        if sel_end < text.len() {
            let suffix = editor.fresh_id();
            ops.push(Op::SplitText {
                node: middle,
                offset: sel_end - sel_start,
                new_id: suffix,
            });
        }
        ops.push(Op::SetTextMarks {
            node: middle,
            marks: next,
        });
    }
    ops
}
