use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::Editor;
use crate::plugin::CommandError;
use crate::selection::{ActiveFormats, DerivedSelection};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn top(&self) -> f32 {
        self.y
    }

    pub fn left(&self) -> f32 {
        self.x
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn mid_y(&self) -> f32 {
        self.y + self.height / 2.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// Offset of the toolbar's top-left corner relative to the editor container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToolbarPosition {
    pub top: f32,
    pub left: f32,
}

/// Geometry the host reads back from its rendering surface after a render.
pub trait SelectionSurface {
    /// Bounds of the editor container, `None` when it is not mounted.
    fn container_rect(&self) -> Option<Rect>;
    /// Bounds of the native selection range.
    fn selection_rect(&self) -> Option<Rect>;
    fn toolbar_size(&self) -> Size;
}

/// Capability for opening the comment form over a selection. Returns false
/// when the form could not be opened.
pub trait CommentEntry {
    fn open_comment_entry(&self, selection: &DerivedSelection) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolbarConfig {
    /// Minimum distance kept from the container's edges.
    pub margin: f32,
    /// Space between the toolbar's bottom edge and the selection.
    pub gap: f32,
}

impl Default for ToolbarConfig {
    fn default() -> Self {
        Self {
            margin: 10.0,
            gap: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolbarAction {
    Bold,
    Italic,
    Underline,
    Code,
    Comment,
}

impl ToolbarAction {
    pub const ALL: [ToolbarAction; 5] = [
        ToolbarAction::Bold,
        ToolbarAction::Italic,
        ToolbarAction::Underline,
        ToolbarAction::Code,
        ToolbarAction::Comment,
    ];

    pub fn command_id(self) -> Option<&'static str> {
        match self {
            ToolbarAction::Bold => Some("marks.toggle_bold"),
            ToolbarAction::Italic => Some("marks.toggle_italic"),
            ToolbarAction::Underline => Some("marks.toggle_underline"),
            ToolbarAction::Code => Some("marks.toggle_code"),
            ToolbarAction::Comment => None,
        }
    }

    /// Whether the button renders pressed for the given formats.
    pub fn is_active(self, formats: &ActiveFormats) -> bool {
        match self {
            ToolbarAction::Bold => formats.bold,
            ToolbarAction::Italic => formats.italic,
            ToolbarAction::Underline => formats.underline,
            ToolbarAction::Code => formats.code,
            ToolbarAction::Comment => false,
        }
    }
}

/// Centres the toolbar above the selection, then clamps it inside the
/// container horizontally and below its top margin.
pub fn place_toolbar(
    selection: Rect,
    container: Rect,
    toolbar: Size,
    config: &ToolbarConfig,
) -> ToolbarPosition {
    let top = selection.top() - container.top() - toolbar.height - config.gap;
    let left = selection.left() - container.left() + selection.width / 2.0 - toolbar.width / 2.0;
    let max_left = container.width - toolbar.width - config.margin;
    ToolbarPosition {
        top: top.max(config.margin),
        left: left.min(max_left).max(config.margin),
    }
}

pub struct FloatingToolbar {
    config: ToolbarConfig,
    comment_entry: Rc<dyn CommentEntry>,
    selection: Option<DerivedSelection>,
    position: Option<ToolbarPosition>,
    needs_measure: bool,
}

impl FloatingToolbar {
    pub fn new(config: ToolbarConfig, comment_entry: Rc<dyn CommentEntry>) -> Self {
        Self {
            config,
            comment_entry,
            selection: None,
            position: None,
            needs_measure: false,
        }
    }

    /// Follows the tracker. A new range schedules a measurement for after
    /// the next render; a collapsed selection hides the toolbar at once.
    pub fn sync(&mut self, selection: Option<&DerivedSelection>) {
        match selection {
            Some(selection) => {
                if self.selection.as_ref() != Some(selection) {
                    self.selection = Some(selection.clone());
                    self.needs_measure = true;
                }
            }
            None => {
                self.selection = None;
                self.position = None;
                self.needs_measure = false;
            }
        }
    }

    pub fn needs_measure(&self) -> bool {
        self.needs_measure
    }

    /// Deferred measurement. Leaves the toolbar hidden when the container or
    /// the selection cannot be located.
    pub fn measure(&mut self, surface: &dyn SelectionSurface) -> Option<ToolbarPosition> {
        if !self.needs_measure {
            return self.position;
        }
        self.needs_measure = false;
        if self.selection.is_none() {
            return None;
        }

        let (Some(container), Some(selection)) =
            (surface.container_rect(), surface.selection_rect())
        else {
            debug!("toolbar anchor not found; skipping placement");
            self.position = None;
            return None;
        };
        self.position = Some(place_toolbar(
            selection,
            container,
            surface.toolbar_size(),
            &self.config,
        ));
        self.position
    }

    pub fn position(&self) -> Option<ToolbarPosition> {
        self.position
    }

    pub fn is_visible(&self) -> bool {
        self.selection.is_some() && self.position.is_some()
    }

    pub fn active_formats(&self) -> ActiveFormats {
        self.selection
            .as_ref()
            .map(|s| s.formats)
            .unwrap_or_default()
    }

    pub fn invoke(&self, action: ToolbarAction, editor: &mut Editor) -> Result<(), CommandError> {
        let Some(selection) = &self.selection else {
            return Ok(());
        };
        match action.command_id() {
            Some(command) => editor.run_command(command, None),
            None => {
                if !self.comment_entry.open_comment_entry(selection) {
                    debug!("comment entry refused the selection");
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centres_above_selection_when_room() {
        let pos = place_toolbar(
            Rect::new(300.0, 200.0, 100.0, 20.0),
            Rect::new(100.0, 50.0, 600.0, 400.0),
            Size::new(120.0, 30.0),
            &ToolbarConfig::default(),
        );
        assert_eq!(pos.top, 110.0);
        assert_eq!(pos.left, 190.0);
    }
}
