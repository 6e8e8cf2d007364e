use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{Editor, NodeId};
use crate::toolbar::Rect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropSide {
    Before,
    After,
}

/// Upper half of the block drops before it, lower half after.
pub fn side_for_pointer(rect: Rect, pointer_y: f32) -> DropSide {
    if pointer_y < rect.mid_y() {
        DropSide::Before
    } else {
        DropSide::After
    }
}

/// Rendered bounds of top-level blocks, supplied by the host.
pub trait BlockGeometry {
    fn block_rect(&self, block: NodeId) -> Option<Rect>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DragSession {
    pub source: Option<NodeId>,
    pub target: Option<NodeId>,
    pub side: Option<DropSide>,
}

#[derive(Debug, Default)]
pub struct DragReorderController {
    hovered: Option<NodeId>,
    dragging: bool,
    session: DragSession,
}

impl DragReorderController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block whose drag handle is shown. Hover tracking pauses while a drag
    /// is in flight.
    pub fn hovered(&self) -> Option<NodeId> {
        self.hovered
    }

    pub fn hover(&mut self, block: NodeId) {
        if !self.dragging {
            self.hovered = Some(block);
        }
    }

    pub fn hover_out(&mut self) {
        if !self.dragging {
            self.hovered = None;
        }
    }

    pub fn is_dragging(&self) -> bool {
        self.dragging
    }

    pub fn session(&self) -> DragSession {
        self.session
    }

    pub fn drag_start(&mut self, block: NodeId) {
        debug!(%block, "drag start");
        self.dragging = true;
        self.session = DragSession {
            source: Some(block),
            target: None,
            side: None,
        };
    }

    pub fn drag_over(&mut self, block: NodeId, pointer_y: f32, geometry: &dyn BlockGeometry) {
        if !self.dragging {
            return;
        }
        if self.session.source == Some(block) {
            self.session.target = None;
            self.session.side = None;
            return;
        }
        self.session.target = Some(block);
        if let Some(rect) = geometry.block_rect(block) {
            self.session.side = Some(side_for_pointer(rect, pointer_y));
        }
    }

    /// Vertical position of the drop indicator line, if one should show.
    pub fn drop_indicator_y(&self, geometry: &dyn BlockGeometry) -> Option<f32> {
        let target = self.session.target?;
        let rect = geometry.block_rect(target)?;
        Some(match self.session.side? {
            DropSide::Before => rect.top(),
            DropSide::After => rect.y + rect.height,
        })
    }

    /// Issues a single `block.move` for a complete session and resets it.
    /// Returns whether the document changed.
    pub fn drop(&mut self, editor: &mut Editor) -> bool {
        let session = std::mem::take(&mut self.session);
        self.dragging = false;
        let DragSession {
            source: Some(source),
            target: Some(target),
            side: Some(side),
        } = session
        else {
            return false;
        };
        if source == target {
            return false;
        }
        if editor.doc().contains_within(source, target) {
            debug!(%source, %target, "rejected drop into own subtree");
            return false;
        }

        let version = editor.version();
        let args = serde_json::json!({ "source": source, "target": target, "side": side });
        if let Err(err) = editor.run_command("block.move", Some(args)) {
            debug!(%source, %target, error = %err, "drop failed");
            return false;
        }
        editor.version() != version
    }

    pub fn drag_end(&mut self) {
        self.dragging = false;
        self.session = DragSession::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_splits_before_and_after() {
        let rect = Rect::new(0.0, 100.0, 200.0, 40.0);
        assert_eq!(side_for_pointer(rect, 101.0), DropSide::Before);
        assert_eq!(side_for_pointer(rect, 119.9), DropSide::Before);
        assert_eq!(side_for_pointer(rect, 120.0), DropSide::After);
        assert_eq!(side_for_pointer(rect, 139.0), DropSide::After);
    }
}
