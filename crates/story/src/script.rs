use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, anyhow, bail};
use notebloc_plate_core::{
    BlockGeometry, DropSide, Key, NodeId, NoteSession, Rect, Selection, ToolbarAction,
};
use serde::Deserialize;
use tracing::info;

/// One scripted user gesture. Offsets are positions in the note's plain
/// text; block indexes count text blocks in document order.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Type { text: String },
    Key { key: Key },
    Select { start: usize, end: usize },
    Caret { offset: usize },
    Toolbar { action: ToolbarAction },
    Comment { body: String },
    Drag { from: usize, to: usize, side: DropSide },
    Undo,
    Redo,
    /// Lets the sync debounce window pass.
    Wait { ms: u64 },
}

/// Walkthrough played over [`crate::SAMPLE_NOTE`] when no script is given.
pub fn demo() -> Vec<Step> {
    vec![
        Step::Caret { offset: 0 },
        Step::Type {
            text: "/".into(),
        },
        Step::Type {
            text: "head".into(),
        },
        Step::Key { key: Key::Enter },
        Step::Type {
            text: "Weekend plans".into(),
        },
        Step::Select { start: 14, end: 25 },
        Step::Toolbar {
            action: ToolbarAction::Bold,
        },
        Step::Select { start: 14, end: 25 },
        Step::Toolbar {
            action: ToolbarAction::Comment,
        },
        Step::Comment {
            body: "Check the forecast first".into(),
        },
        Step::Drag {
            from: 3,
            to: 2,
            side: DropSide::Before,
        },
        Step::Wait { ms: 150 },
    ]
}

/// Text blocks stacked at a fixed row height, standing in for the host's
/// layout.
struct Rows(Vec<NodeId>);

const ROW_HEIGHT: f32 = 24.0;

impl Rows {
    fn of(session: &NoteSession) -> Self {
        Self(
            session
                .editor()
                .doc()
                .text_blocks()
                .iter()
                .map(|block| block.id)
                .collect(),
        )
    }

    fn get(&self, ix: usize) -> Result<NodeId> {
        self.0
            .get(ix)
            .copied()
            .ok_or_else(|| anyhow!("no block at index {ix}"))
    }
}

impl BlockGeometry for Rows {
    fn block_rect(&self, block: NodeId) -> Option<Rect> {
        let ix = self.0.iter().position(|id| *id == block)?;
        Some(Rect::new(0.0, ix as f32 * ROW_HEIGHT, 640.0, ROW_HEIGHT))
    }
}

/// Replays `steps` against the session, advancing a virtual clock so the
/// sync bridge sees realistic typing gaps.
pub fn run(session: &mut NoteSession, steps: &[Step], start: Instant) -> Result<()> {
    let mut now = start;
    for (ix, step) in steps.iter().enumerate() {
        now += Duration::from_millis(20);
        apply(session, step, &mut now).with_context(|| format!("step {ix}: {step:?}"))?;
        session.tick(now);
    }
    Ok(())
}

fn apply(session: &mut NoteSession, step: &Step, now: &mut Instant) -> Result<()> {
    match step {
        Step::Type { text } => session.type_text(text, *now)?,
        Step::Key { key } => {
            session.press_key(*key, *now)?;
        }
        Step::Select { start, end } => select(session, *start, *end)?,
        Step::Caret { offset } => select(session, *offset, *offset)?,
        Step::Toolbar { action } => session.toolbar_action(*action, *now)?,
        Step::Comment { body } => {
            let Some(id) = session.submit_comment(body, *now) else {
                bail!("no comment form open");
            };
            info!(%id, "comment added");
        }
        Step::Drag { from, to, side } => {
            let rows = Rows::of(session);
            let (source, target) = (rows.get(*from)?, rows.get(*to)?);
            let rect = rows
                .block_rect(target)
                .ok_or_else(|| anyhow!("block {to} has no bounds"))?;
            let pointer_y = match side {
                DropSide::Before => rect.top() + 1.0,
                DropSide::After => rect.y + rect.height - 1.0,
            };
            session.drag_start(source);
            session.drag_over(target, pointer_y, &rows);
            if !session.drop_block(*now) {
                info!(from, to, "drop rejected");
            }
        }
        Step::Undo => {
            session.undo(*now);
        }
        Step::Redo => {
            session.redo(*now);
        }
        Step::Wait { ms } => *now += Duration::from_millis(*ms),
    }
    Ok(())
}

fn select(session: &mut NoteSession, start: usize, end: usize) -> Result<()> {
    let doc = session.editor().doc();
    let anchor = doc
        .point_at_absolute(start)
        .ok_or_else(|| anyhow!("offset {start} is outside the note"))?;
    let focus = doc
        .point_at_absolute(end)
        .ok_or_else(|| anyhow!("offset {end} is outside the note"))?;
    session.set_selection(Selection::new(anchor, focus));
    Ok(())
}
