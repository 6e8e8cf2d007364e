use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use crate::comments::CommentLayer;
use crate::config::SessionConfig;
use crate::core::{Document, Editor, NodeId, Selection};
use crate::drag::{BlockGeometry, DragReorderController};
use crate::html::to_html;
use crate::plugin::{CommandError, PluginRegistry};
use crate::selection::{DerivedSelection, SelectionTracker};
use crate::slash::{Key, KeyOutcome, SlashMenu};
use crate::sync::{ContentSyncBridge, InboundContent, InboundDecision};
use crate::title::title_of;
use crate::toolbar::{FloatingToolbar, SelectionSurface, ToolbarAction, ToolbarPosition};

type ChangeListener = Box<dyn FnMut(&str)>;

/// One open note: the editor plus every plugin mounted on it.
///
/// All input goes through the session so that each mutation is followed by
/// the same refresh: the selection tracker, slash menu and toolbar are
/// brought up to date, then the serialized document is handed to the
/// `on_change` listener.
pub struct NoteSession {
    editor: Editor,
    tracker: SelectionTracker,
    toolbar: FloatingToolbar,
    slash: SlashMenu,
    drag: DragReorderController,
    comments: CommentLayer,
    bridge: ContentSyncBridge,
    on_change: Option<ChangeListener>,
}

impl NoteSession {
    pub fn new(config: SessionConfig) -> Self {
        let editor = Editor::with_config(
            Document::empty(),
            Selection::default(),
            PluginRegistry::notes(),
            config.editor.clone(),
        );
        let slash = SlashMenu::new(&config.slash, editor.registry());
        let comments = CommentLayer::new(&config.comments);
        let toolbar = FloatingToolbar::new(config.toolbar.clone(), comments.entry_handle());
        let mut session = Self {
            editor,
            tracker: SelectionTracker::new(),
            toolbar,
            slash,
            drag: DragReorderController::new(),
            comments,
            bridge: ContentSyncBridge::new(config.sync.clone()),
            on_change: None,
        };
        session.refresh();
        session
    }

    pub fn editor(&self) -> &Editor {
        &self.editor
    }

    pub fn selection(&self) -> Option<&DerivedSelection> {
        self.tracker.current()
    }

    pub fn toolbar(&self) -> &FloatingToolbar {
        &self.toolbar
    }

    pub fn slash_menu(&self) -> &SlashMenu {
        &self.slash
    }

    pub fn drag(&self) -> &DragReorderController {
        &self.drag
    }

    pub fn comments(&self) -> &CommentLayer {
        &self.comments
    }

    pub fn bridge(&self) -> &ContentSyncBridge {
        &self.bridge
    }

    pub fn html(&self) -> String {
        to_html(self.editor.doc())
    }

    pub fn title(&self) -> String {
        title_of(self.editor.doc())
    }

    /// Registers the outbound callback, invoked after every local change.
    pub fn on_change(&mut self, listener: impl FnMut(&str) + 'static) {
        self.on_change = Some(Box::new(listener));
    }

    /// Inbound content from the host. Replacements are not echoed back.
    pub fn set_inbound(&mut self, inbound: InboundContent, now: Instant) -> InboundDecision {
        let switching = self.bridge.document_id() != Some(inbound.document_id.as_str());
        if switching {
            self.comments.clear(&mut self.editor);
            self.drag.drag_end();
        }
        let decision = self.bridge.receive(&mut self.editor, &inbound, now);
        debug!(?decision, document = %inbound.document_id, "inbound content");
        self.refresh();
        decision
    }

    /// Drives the sync debounce timer; returns true when a deferred external
    /// update landed.
    pub fn tick(&mut self, now: Instant) -> bool {
        let applied = self.bridge.tick(&mut self.editor, now);
        if applied {
            self.refresh();
        }
        applied
    }

    pub fn set_selection(&mut self, selection: Selection) {
        self.editor.set_selection(selection);
        self.refresh();
    }

    pub fn type_text(&mut self, text: &str, now: Instant) -> Result<(), CommandError> {
        let args = serde_json::json!({ "text": text });
        self.dispatch(now, |editor| editor.run_command("text.insert", Some(args)))
    }

    /// Routes a key to the slash menu while it is open, else to editing.
    pub fn press_key(&mut self, key: Key, now: Instant) -> Result<KeyOutcome, CommandError> {
        let version = self.editor.version();
        if self.slash.handle_key(key, &mut self.editor) == KeyOutcome::Handled {
            // A dismissed menu stays closed until the text changes.
            if self.editor.version() != version {
                self.after_mutation(version, now);
            }
            return Ok(KeyOutcome::Handled);
        }
        let command = match key {
            Key::Backspace => "text.delete_backward",
            Key::Enter => "block.split",
            Key::ArrowDown | Key::ArrowUp | Key::Tab | Key::Escape => {
                return Ok(KeyOutcome::Ignored);
            }
        };
        self.dispatch(now, |editor| editor.run_command(command, None))?;
        Ok(KeyOutcome::Handled)
    }

    pub fn run_command(
        &mut self,
        id: &str,
        args: Option<Value>,
        now: Instant,
    ) -> Result<(), CommandError> {
        self.dispatch(now, |editor| editor.run_command(id, args))
    }

    pub fn toolbar_action(&mut self, action: ToolbarAction, now: Instant) -> Result<(), CommandError> {
        let version = self.editor.version();
        let result = self.toolbar.invoke(action, &mut self.editor);
        self.after_mutation(version, now);
        result
    }

    /// Runs the deferred toolbar measurement after the host has rendered.
    pub fn measure_toolbar(&mut self, surface: &dyn SelectionSurface) -> Option<ToolbarPosition> {
        self.toolbar.measure(surface)
    }

    pub fn undo(&mut self, now: Instant) -> bool {
        let version = self.editor.version();
        let undone = self.editor.undo();
        self.after_mutation(version, now);
        undone
    }

    pub fn redo(&mut self, now: Instant) -> bool {
        let version = self.editor.version();
        let redone = self.editor.redo();
        self.after_mutation(version, now);
        redone
    }

    pub fn hover(&mut self, block: NodeId) {
        self.drag.hover(block);
    }

    pub fn hover_out(&mut self) {
        self.drag.hover_out();
    }

    pub fn drag_start(&mut self, block: NodeId) {
        self.drag.drag_start(block);
    }

    pub fn drag_over(&mut self, block: NodeId, pointer_y: f32, geometry: &dyn BlockGeometry) {
        self.drag.drag_over(block, pointer_y, geometry);
    }

    pub fn drop_block(&mut self, now: Instant) -> bool {
        let version = self.editor.version();
        let moved = self.drag.drop(&mut self.editor);
        self.after_mutation(version, now);
        moved
    }

    pub fn drag_end(&mut self) {
        self.drag.drag_end();
    }

    /// Saves the comment form opened from the toolbar.
    pub fn submit_comment(&mut self, body: &str, now: Instant) -> Option<String> {
        let version = self.editor.version();
        let id = self.comments.submit_entry(&mut self.editor, body);
        self.after_mutation(version, now);
        id
    }

    /// Tears down per-session state when the editor is dismounted.
    pub fn unmount(&mut self) {
        self.comments.clear(&mut self.editor);
        self.drag.drag_end();
        self.slash.close();
        self.tracker.clear();
        self.toolbar.sync(None);
    }

    fn dispatch(
        &mut self,
        now: Instant,
        f: impl FnOnce(&mut Editor) -> Result<(), CommandError>,
    ) -> Result<(), CommandError> {
        let version = self.editor.version();
        let result = f(&mut self.editor);
        self.after_mutation(version, now);
        result
    }

    fn after_mutation(&mut self, version_before: u64, now: Instant) {
        self.refresh();
        if self.editor.version() == version_before {
            return;
        }
        let html = self.bridge.on_local_change(self.editor.doc(), now);
        if let Some(listener) = self.on_change.as_mut() {
            listener(&html);
        }
    }

    fn refresh(&mut self) {
        self.tracker.recompute(&self.editor);
        self.toolbar.sync(self.tracker.current());
        self.slash.on_update(&self.editor);
    }
}
