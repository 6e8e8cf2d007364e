use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::{Editor, NodeId, Point, Selection};
use crate::ops::{Op, Transaction};
use crate::plugin::PluginRegistry;
use crate::toolbar::SelectionSurface;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlashConfig {
    pub trigger: char,
}

impl Default for SlashConfig {
    fn default() -> Self {
        Self { trigger: '/' }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashCommand {
    pub key: &'static str,
    pub label: String,
    pub description: String,
    pub icon: &'static str,
    pub keywords: Vec<String>,
    pub command: &'static str,
    pub heading_level: Option<u8>,
}

impl SlashCommand {
    pub fn args(&self) -> Option<Value> {
        self.heading_level
            .map(|level| serde_json::json!({ "level": level }))
    }

    /// Case-insensitive substring match on the label or any keyword.
    pub fn matches(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        self.label.to_lowercase().contains(&query)
            || self
                .keywords
                .iter()
                .any(|keyword| keyword.to_lowercase().contains(&query))
    }
}

/// Menu key, command id, icon and heading level of each slash entry.
const ENTRIES: [(&str, &str, &str, Option<u8>); 8] = [
    ("paragraph", "block.set_paragraph", "type", None),
    ("h1", "block.set_heading", "heading-1", Some(1)),
    ("h2", "block.set_heading", "heading-2", Some(2)),
    ("h3", "block.set_heading", "heading-3", Some(3)),
    ("quote", "block.set_quote", "quote", None),
    ("code", "block.set_code", "code", None),
    ("bullet", "list.toggle_bulleted", "list", None),
    ("number", "list.toggle_numbered", "list-ordered", None),
];

/// Slash entries whose commands are registered and not hidden. Labels,
/// descriptions and keywords come from the command specs.
pub fn catalog(registry: &PluginRegistry) -> Vec<SlashCommand> {
    ENTRIES
        .iter()
        .filter_map(|&(key, command, icon, heading_level)| {
            let spec = registry.command(command).filter(|spec| !spec.hidden)?;
            let (label, keywords) = match heading_level {
                Some(level) => (
                    format!("{} {level}", spec.label),
                    heading_keywords(&spec.keywords, level),
                ),
                None => (spec.label.clone(), spec.keywords.clone()),
            };
            Some(SlashCommand {
                key,
                label,
                description: spec.description.unwrap_or_default(),
                icon,
                keywords,
                command,
                heading_level,
            })
        })
        .collect()
}

/// Drops the `hN` keywords of other levels so `/h2` finds one entry.
fn heading_keywords(keywords: &[String], level: u8) -> Vec<String> {
    let own = format!("h{level}");
    let mut kept: Vec<String> = keywords
        .iter()
        .filter(|keyword| {
            let is_level = keyword
                .strip_prefix('h')
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
            !is_level || **keyword == own
        })
        .cloned()
        .collect();
    if !kept.contains(&own) {
        kept.push(own);
    }
    kept
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashMenuState {
    Closed,
    /// `trigger` points at the trigger character inside its text leaf.
    Open {
        query: String,
        highlighted: usize,
        trigger: Point,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Key {
    ArrowDown,
    ArrowUp,
    Enter,
    Tab,
    Escape,
    Backspace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    Handled,
    Ignored,
}

pub struct SlashMenu {
    trigger: char,
    catalog: Vec<SlashCommand>,
    state: SlashMenuState,
    /// Leaf and its text when Escape closed the menu.
    dismissed: Option<(NodeId, String)>,
}

impl SlashMenu {
    pub fn new(config: &SlashConfig, registry: &PluginRegistry) -> Self {
        Self {
            trigger: config.trigger,
            catalog: catalog(registry),
            state: SlashMenuState::Closed,
            dismissed: None,
        }
    }

    pub fn state(&self) -> &SlashMenuState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SlashMenuState::Open { .. })
    }

    pub fn query(&self) -> Option<&str> {
        match &self.state {
            SlashMenuState::Open { query, .. } => Some(query),
            SlashMenuState::Closed => None,
        }
    }

    /// Catalog entries matching the current query, in catalog order.
    pub fn candidates(&self) -> Vec<&SlashCommand> {
        let Some(query) = self.query() else {
            return Vec::new();
        };
        self.catalog.iter().filter(|c| c.matches(query)).collect()
    }

    pub fn highlighted(&self) -> Option<&SlashCommand> {
        let SlashMenuState::Open { highlighted, .. } = &self.state else {
            return None;
        };
        self.candidates().get(*highlighted).copied()
    }

    /// Where the menu pops up: under the caret's left edge.
    pub fn menu_position(&self, surface: &dyn SelectionSurface) -> Option<(f32, f32)> {
        if !self.is_open() || self.candidates().is_empty() {
            return None;
        }
        let caret = surface.selection_rect()?;
        Some((caret.left(), caret.y + caret.height + 5.0))
    }

    pub fn close(&mut self) {
        self.state = SlashMenuState::Closed;
    }

    /// Re-reads the text run at the caret after any document or selection
    /// change.
    pub fn on_update(&mut self, editor: &Editor) {
        let selection = editor.selection();
        let leaf = selection
            .is_collapsed()
            .then(|| editor.doc().text_node(selection.focus.node))
            .flatten();
        let Some(leaf) = leaf else {
            self.close();
            return;
        };

        let text = &leaf.text;
        match &self.dismissed {
            Some((id, dismissed)) if *id == leaf.id && dismissed == text => return,
            Some(_) => self.dismissed = None,
            None => {}
        }
        let trigger_len = self.trigger.len_utf8();
        match text.rfind(self.trigger) {
            Some(ix) if ix + trigger_len == text.len() && selection.focus.offset == text.len() => {
                let trigger = Point::new(leaf.id, ix);
                let already = matches!(
                    &self.state,
                    SlashMenuState::Open { query, trigger: t, .. } if query.is_empty() && *t == trigger
                );
                if !already {
                    debug!(leaf = %leaf.id, "slash menu opened");
                    self.state = SlashMenuState::Open {
                        query: String::new(),
                        highlighted: 0,
                        trigger,
                    };
                }
            }
            Some(ix) => {
                if let SlashMenuState::Open {
                    query,
                    highlighted,
                    trigger,
                } = &mut self.state
                {
                    let next = &text[ix + trigger_len..];
                    if query != next {
                        *query = next.to_string();
                        *highlighted = 0;
                    }
                    *trigger = Point::new(leaf.id, ix);
                }
            }
            None => self.close(),
        }
    }

    /// Keys are only intercepted while the menu is open.
    pub fn handle_key(&mut self, key: Key, editor: &mut Editor) -> KeyOutcome {
        if !self.is_open() {
            return KeyOutcome::Ignored;
        }
        let count = self.candidates().len();
        match key {
            Key::ArrowDown | Key::ArrowUp => {
                if let SlashMenuState::Open { highlighted, .. } = &mut self.state {
                    if count > 0 {
                        *highlighted = match key {
                            Key::ArrowDown => (*highlighted + 1) % count,
                            _ => (*highlighted + count - 1) % count,
                        };
                    }
                }
                KeyOutcome::Handled
            }
            Key::Enter | Key::Tab => {
                if let Some(command) = self.highlighted().cloned() {
                    self.commit(&command, editor);
                }
                KeyOutcome::Handled
            }
            Key::Escape => {
                if let SlashMenuState::Open { trigger, .. } = &self.state {
                    self.dismissed = editor
                        .doc()
                        .text_node(trigger.node)
                        .map(|leaf| (leaf.id, leaf.text.clone()));
                }
                self.close();
                KeyOutcome::Handled
            }
            Key::Backspace => KeyOutcome::Ignored,
        }
    }

    /// Removes the trigger and query from the text, then runs the command
    /// over the caret's block.
    fn commit(&mut self, command: &SlashCommand, editor: &mut Editor) {
        let SlashMenuState::Open { query, trigger, .. } =
            std::mem::replace(&mut self.state, SlashMenuState::Closed)
        else {
            return;
        };

        let typed = format!("{}{}", self.trigger, query);
        let end = trigger.offset + typed.len();
        let still_there = editor
            .doc()
            .text_node(trigger.node)
            .and_then(|leaf| leaf.text.get(trigger.offset..end))
            .is_some_and(|text| text == typed);
        if still_there {
            let tx = Transaction::new(vec![Op::RemoveText {
                node: trigger.node,
                range: trigger.offset..end,
            }])
            .selection_after(Selection::collapsed(trigger))
            .source("slash:remove_trigger");
            if let Err(err) = editor.apply(tx) {
                warn!(error = %err, "failed to remove slash trigger");
            }
        }

        debug!(command = command.key, "slash command");
        if let Err(err) = editor.run_command(command.command, command.args()) {
            warn!(command = command.key, error = %err, "slash command failed");
        }
    }
}
