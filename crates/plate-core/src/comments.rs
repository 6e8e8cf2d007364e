use std::cell::{Ref, RefCell};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{BlockOffset, Editor, Point, Selection};
use crate::markers::MarkerId;
use crate::selection::DerivedSelection;
use crate::toolbar::{CommentEntry, SelectionSurface};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentConfig {
    pub visible_by_default: bool,
}

impl Default for CommentConfig {
    fn default() -> Self {
        Self {
            visible_by_default: true,
        }
    }
}

/// A note attached to a span of text. The offsets are those captured at
/// creation; `anchor` follows the span through later edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub body: String,
    pub selection_text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub anchor: MarkerId,
}

#[derive(Debug, Default)]
struct CommentBoard {
    comments: Vec<Comment>,
    visible: bool,
    entry: Option<DerivedSelection>,
    active: Option<String>,
}

struct EntryHandle {
    board: Rc<RefCell<CommentBoard>>,
}

impl CommentEntry for EntryHandle {
    fn open_comment_entry(&self, selection: &DerivedSelection) -> bool {
        if selection.start_offset >= selection.end_offset {
            return false;
        }
        self.board.borrow_mut().entry = Some(selection.clone());
        true
    }
}

/// Comments for the open note. The list is append-only for the life of the
/// session; [`CommentLayer::clear`] drops everything on dismount.
pub struct CommentLayer {
    board: Rc<RefCell<CommentBoard>>,
}

impl CommentLayer {
    pub fn new(config: &CommentConfig) -> Self {
        Self {
            board: Rc::new(RefCell::new(CommentBoard {
                visible: config.visible_by_default,
                ..CommentBoard::default()
            })),
        }
    }

    /// Capability handed to the toolbar so its comment button can open the
    /// entry form.
    pub fn entry_handle(&self) -> Rc<dyn CommentEntry> {
        Rc::new(EntryHandle {
            board: Rc::clone(&self.board),
        })
    }

    /// Selection the entry form is open over.
    pub fn entry(&self) -> Option<DerivedSelection> {
        self.board.borrow().entry.clone()
    }

    pub fn cancel_entry(&self) {
        self.board.borrow_mut().entry = None;
    }

    /// Where the entry form opens: at the selection's right edge, relative
    /// to the editor container.
    pub fn entry_position(&self, surface: &dyn SelectionSurface) -> Option<(f32, f32)> {
        self.board.borrow().entry.as_ref()?;
        let container = surface.container_rect()?;
        let selection = surface.selection_rect()?;
        Some((
            selection.right() - container.left(),
            selection.top() - container.top(),
        ))
    }

    /// Saves the open form. A blank body leaves the form open.
    pub fn submit_entry(&self, editor: &mut Editor, body: &str) -> Option<String> {
        let selection = self.entry()?;
        let id = self.add_comment(editor, &selection, body)?;
        self.board.borrow_mut().entry = None;
        Some(id)
    }

    /// Appends a comment over `selection` and highlights the range. Does
    /// nothing for an empty range or a blank body.
    pub fn add_comment(
        &self,
        editor: &mut Editor,
        selection: &DerivedSelection,
        body: &str,
    ) -> Option<String> {
        if selection.start_offset >= selection.end_offset || body.trim().is_empty() {
            debug!("comment preconditions not met");
            return None;
        }

        let doc = editor.doc();
        let resolve = |point: &Point, absolute: usize| -> Option<BlockOffset> {
            doc.block_offset(point)
                .or_else(|| doc.block_offset_at_absolute(absolute))
        };
        let start = resolve(&selection.start, selection.start_offset)?;
        let end = resolve(&selection.end, selection.end_offset)?;
        let range = doc.point_at(start).zip(doc.point_at(end));

        let anchor = editor.add_marker(start, end);
        if let Some((start, end)) = range {
            editor.set_selection(Selection::new(start, end));
            if let Err(err) = editor.run_command("marks.set_highlight", None) {
                warn!(error = %err, "failed to highlight commented range");
            }
        }

        let comment = Comment {
            id: Uuid::new_v4().to_string(),
            body: body.to_string(),
            selection_text: selection.text.clone(),
            start_offset: selection.start_offset,
            end_offset: selection.end_offset,
            anchor,
        };
        let id = comment.id.clone();
        debug!(comment = %id, start = comment.start_offset, end = comment.end_offset, "added comment");
        self.board.borrow_mut().comments.push(comment);
        Some(id)
    }

    pub fn comments(&self) -> Ref<'_, [Comment]> {
        Ref::map(self.board.borrow(), |board| board.comments.as_slice())
    }

    pub fn len(&self) -> usize {
        self.board.borrow().comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.board.borrow().comments.is_empty()
    }

    pub fn is_visible(&self) -> bool {
        self.board.borrow().visible
    }

    pub fn toggle_visible(&self) -> bool {
        let mut board = self.board.borrow_mut();
        board.visible = !board.visible;
        board.visible
    }

    pub fn set_active(&self, id: Option<&str>) {
        self.board.borrow_mut().active = id.map(str::to_string);
    }

    pub fn active(&self) -> Option<String> {
        self.board.borrow().active.clone()
    }

    /// Current `[start, end)` of the comment's span in the document's plain
    /// text, `None` once the span's blocks are gone.
    pub fn live_range(&self, editor: &Editor, comment: &Comment) -> Option<(usize, usize)> {
        let range = editor.marker(comment.anchor)?;
        let doc = editor.doc();
        Some((doc.absolute_of(range.start)?, doc.absolute_of(range.end)?))
    }

    pub fn live_text(&self, editor: &Editor, comment: &Comment) -> Option<String> {
        editor.marker_text(comment.anchor)
    }

    pub fn clear(&self, editor: &mut Editor) {
        let mut board = self.board.borrow_mut();
        for comment in board.comments.drain(..) {
            editor.remove_marker(comment.anchor);
        }
        board.entry = None;
        board.active = None;
    }
}
