use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::{Document, Editor, MarkKind, Point, Selection};

/// Formatting flags shared by every text leaf under a range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveFormats {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub code: bool,
}

impl ActiveFormats {
    pub fn has(&self, kind: MarkKind) -> bool {
        match kind {
            MarkKind::Bold => self.bold,
            MarkKind::Italic => self.italic,
            MarkKind::Underline => self.underline,
            MarkKind::Code => self.code,
            MarkKind::Highlight => false,
        }
    }
}

/// Projection of a non-collapsed selection. Offsets index into
/// [`Document::plain_text`] and satisfy `start_offset < end_offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedSelection {
    pub text: String,
    pub start: Point,
    pub end: Point,
    pub start_offset: usize,
    pub end_offset: usize,
    pub formats: ActiveFormats,
}

pub fn derive_selection(doc: &Document, selection: &Selection) -> Option<DerivedSelection> {
    if selection.is_collapsed() {
        return None;
    }
    let (start, end) = doc.ordered(selection)?;
    let start_offset = doc.absolute_offset(&start)?;
    let end_offset = doc.absolute_offset(&end)?;
    if start_offset >= end_offset {
        return None;
    }
    let text = doc.plain_text().get(start_offset..end_offset)?.to_string();

    let leaves = doc.selected_leaves(selection);
    let all = |kind: MarkKind| !leaves.is_empty() && leaves.iter().all(|t| t.marks.has(kind));
    let formats = ActiveFormats {
        bold: all(MarkKind::Bold),
        italic: all(MarkKind::Italic),
        underline: all(MarkKind::Underline),
        code: all(MarkKind::Code),
    };

    Some(DerivedSelection {
        text,
        start,
        end,
        start_offset,
        end_offset,
        formats,
    })
}

/// Keeps the derived selection in step with the editor. Recomputing with no
/// intervening change yields the same state.
#[derive(Debug, Default)]
pub struct SelectionTracker {
    current: Option<DerivedSelection>,
}

impl SelectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the derived state changed.
    pub fn recompute(&mut self, editor: &Editor) -> bool {
        let next = derive_selection(editor.doc(), editor.selection());
        if next == self.current {
            return false;
        }
        trace!(
            range = ?next.as_ref().map(|s| (s.start_offset, s.end_offset)),
            "selection changed"
        );
        self.current = next;
        true
    }

    pub fn current(&self) -> Option<&DerivedSelection> {
        self.current.as_ref()
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}
