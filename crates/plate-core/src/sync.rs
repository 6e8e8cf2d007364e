use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{Document, Editor};
use crate::html::{from_html, to_html};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long after a local edit the user still counts as typing.
    pub typing_debounce_ms: u64,
    /// Number of recently emitted documents remembered for echo detection.
    pub echo_history: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            typing_debounce_ms: 100,
            echo_history: 16,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.typing_debounce_ms)
    }
}

/// What the host hands the editor when it opens or refreshes a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundContent {
    pub initial_content: String,
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    /// A local edit happened inside the debounce window.
    LocalEditPending { last_edit: Instant },
    /// An external update arrived mid-edit and waits for typing to settle.
    ExternalUpdatePending { content: String, last_edit: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundDecision {
    Replaced,
    SkippedEcho,
    Deferred,
}

/// Keeps the editor and the host's copy of the note in step without letting
/// an inbound refresh clobber in-progress typing.
#[derive(Debug)]
pub struct ContentSyncBridge {
    config: SyncConfig,
    state: SyncState,
    document_id: Option<String>,
    last_inbound: Option<String>,
    emitted: VecDeque<String>,
}

impl ContentSyncBridge {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            state: SyncState::Idle,
            document_id: None,
            last_inbound: None,
            emitted: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    /// Serializes the document after a local change and marks the user as
    /// typing. A pending external update is stale from here on and dropped.
    pub fn on_local_change(&mut self, doc: &Document, now: Instant) -> String {
        let html = to_html(doc);
        if matches!(self.state, SyncState::ExternalUpdatePending { .. }) {
            debug!("local edit supersedes pending external update");
        }
        self.state = SyncState::LocalEditPending { last_edit: now };

        if self.emitted.back() != Some(&html) {
            self.emitted.push_back(html.clone());
            while self.emitted.len() > self.config.echo_history.max(1) {
                self.emitted.pop_front();
            }
        }
        html
    }

    pub fn receive(
        &mut self,
        editor: &mut Editor,
        inbound: &InboundContent,
        now: Instant,
    ) -> InboundDecision {
        let content = &inbound.initial_content;
        if self.document_id.as_deref() != Some(inbound.document_id.as_str()) {
            debug!(document = %inbound.document_id, "switching document");
            self.document_id = Some(inbound.document_id.clone());
            self.emitted.clear();
            self.load(editor, content);
            self.state = SyncState::Idle;
            return InboundDecision::Replaced;
        }

        if self.last_inbound.as_ref() == Some(content) || self.emitted.contains(content) {
            self.last_inbound = Some(content.clone());
            return InboundDecision::SkippedEcho;
        }

        self.settle(now);
        match &self.state {
            SyncState::Idle => {
                self.load(editor, content);
                InboundDecision::Replaced
            }
            SyncState::LocalEditPending { last_edit }
            | SyncState::ExternalUpdatePending { last_edit, .. } => {
                let last_edit = *last_edit;
                debug!("deferring external update while typing");
                self.state = SyncState::ExternalUpdatePending {
                    content: content.clone(),
                    last_edit,
                };
                InboundDecision::Deferred
            }
        }
    }

    /// Advances the debounce timer. Returns true when a deferred external
    /// update was applied.
    pub fn tick(&mut self, editor: &mut Editor, now: Instant) -> bool {
        let SyncState::ExternalUpdatePending { content, last_edit } = &self.state else {
            self.settle(now);
            return false;
        };
        if !self.elapsed(*last_edit, now) {
            return false;
        }
        let content = content.clone();
        self.load(editor, &content);
        self.state = SyncState::Idle;
        true
    }

    fn settle(&mut self, now: Instant) {
        if let SyncState::LocalEditPending { last_edit } = self.state {
            if self.elapsed(last_edit, now) {
                self.state = SyncState::Idle;
            }
        }
    }

    fn elapsed(&self, since: Instant, now: Instant) -> bool {
        now.saturating_duration_since(since) >= self.config.debounce()
    }

    fn load(&mut self, editor: &mut Editor, html: &str) {
        let doc = match from_html(html) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(error = %err, "malformed note html, loading an empty note");
                Document::empty()
            }
        };
        editor.replace_document(doc);
        self.last_inbound = Some(html.to_string());
    }
}
