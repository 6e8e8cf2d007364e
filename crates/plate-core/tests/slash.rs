use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use notebloc_plate_core::{
    BlockKind, Key, KeyOutcome, NoteSession, PluginRegistry, Rect, SelectionSurface,
    SessionConfig, Size, SlashConfig, catalog,
};

fn typed(text: &str) -> (NoteSession, Rc<RefCell<Vec<String>>>) {
    typed_with(SessionConfig::default(), text)
}

fn typed_with(config: SessionConfig, text: &str) -> (NoteSession, Rc<RefCell<Vec<String>>>) {
    let mut session = NoteSession::new(config);
    let emitted = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&emitted);
    session.on_change(move |html| sink.borrow_mut().push(html.to_string()));
    for ch in text.chars() {
        session.type_text(&ch.to_string(), Instant::now()).unwrap();
    }
    (session, emitted)
}

fn candidate_keys(session: &NoteSession) -> Vec<&'static str> {
    session
        .slash_menu()
        .candidates()
        .iter()
        .map(|c| c.key)
        .collect()
}

fn press(session: &mut NoteSession, key: Key) -> KeyOutcome {
    session.press_key(key, Instant::now()).unwrap()
}

#[test]
fn trigger_opens_the_full_catalog() {
    let (session, _) = typed("/");

    assert!(session.slash_menu().is_open());
    assert_eq!(session.slash_menu().query(), Some(""));
    assert_eq!(
        candidate_keys(&session).len(),
        catalog(&PluginRegistry::notes()).len()
    );
    assert_eq!(session.slash_menu().highlighted().unwrap().key, "paragraph");
}

#[test]
fn query_filters_by_label_and_keywords() {
    let (session, _) = typed("/head");
    assert_eq!(candidate_keys(&session), vec!["h1", "h2", "h3"]);

    let (session, _) = typed("/LIST");
    assert_eq!(candidate_keys(&session), vec!["bullet", "number"]);

    let (session, _) = typed("/snip");
    assert_eq!(candidate_keys(&session), vec!["code"]);
}

#[test]
fn catalog_entries_describe_registered_commands() {
    let registry = PluginRegistry::notes();
    let entries = catalog(&registry);
    assert_eq!(entries.len(), 8);

    let bullet = entries.iter().find(|c| c.key == "bullet").unwrap();
    let spec = registry.command("list.toggle_bulleted").unwrap();
    assert_eq!(bullet.label, spec.label);
    assert_eq!(Some(bullet.description.clone()), spec.description);
    assert_eq!(bullet.keywords, spec.keywords);

    let h2 = entries.iter().find(|c| c.key == "h2").unwrap();
    assert_eq!(h2.label, "Heading 2");
    assert!(h2.keywords.contains(&"h2".to_string()));
    assert!(!h2.keywords.contains(&"h1".to_string()));

    let (session, _) = typed("/h2");
    assert_eq!(candidate_keys(&session), vec!["h2"]);
}

#[test]
fn catalog_skips_commands_missing_from_the_registry() {
    assert!(catalog(&PluginRegistry::core()).is_empty());
}

#[test]
fn arrows_wrap_around_the_candidates() {
    let (mut session, _) = typed("/head");

    assert_eq!(press(&mut session, Key::ArrowUp), KeyOutcome::Handled);
    assert_eq!(session.slash_menu().highlighted().unwrap().key, "h3");
    press(&mut session, Key::ArrowDown);
    assert_eq!(session.slash_menu().highlighted().unwrap().key, "h1");
    press(&mut session, Key::ArrowDown);
    assert_eq!(session.slash_menu().highlighted().unwrap().key, "h2");
}

#[test]
fn enter_runs_the_highlighted_command_and_removes_the_query() {
    let (mut session, emitted) = typed("/head");
    press(&mut session, Key::ArrowDown);

    assert_eq!(press(&mut session, Key::Enter), KeyOutcome::Handled);

    assert!(!session.slash_menu().is_open());
    assert_eq!(session.html(), "<h2><br></h2>");
    assert_eq!(emitted.borrow().last().map(String::as_str), Some("<h2><br></h2>"));
    let kind: Option<BlockKind> = session.editor().run_query("block.kind", None).unwrap();
    assert_eq!(kind, Some(BlockKind::Heading { level: 2 }));
}

#[test]
fn tab_commits_like_enter() {
    let (mut session, _) = typed("/quo");
    press(&mut session, Key::Tab);
    session.type_text("Said well", Instant::now()).unwrap();

    assert_eq!(session.html(), "<blockquote>Said well</blockquote>");
}

#[test]
fn trigger_after_text_keeps_the_text() {
    let (mut session, _) = typed("Todo /bul");
    press(&mut session, Key::Enter);

    assert_eq!(session.html(), "<ul><li>Todo </li></ul>");
}

#[test]
fn enter_with_no_matches_changes_nothing() {
    let (mut session, emitted) = typed("/zzz");
    assert!(candidate_keys(&session).is_empty());
    let version = session.editor().version();
    let sent = emitted.borrow().len();

    assert_eq!(press(&mut session, Key::Enter), KeyOutcome::Handled);

    assert_eq!(session.editor().version(), version);
    assert_eq!(emitted.borrow().len(), sent);
    assert_eq!(session.html(), "<p>/zzz</p>");
}

#[test]
fn escape_closes_until_the_text_changes() {
    let (mut session, _) = typed("/");

    assert_eq!(press(&mut session, Key::Escape), KeyOutcome::Handled);
    assert!(!session.slash_menu().is_open());

    // Keys now reach the editor.
    assert_eq!(press(&mut session, Key::Enter), KeyOutcome::Handled);
    assert_eq!(session.editor().doc().text_blocks().len(), 2);
    assert!(!session.slash_menu().is_open());
}

#[test]
fn repeated_selection_updates_keep_a_dismissed_menu_closed() {
    let (mut session, _) = typed("/");
    press(&mut session, Key::Escape);

    let selection = *session.editor().selection();
    session.set_selection(selection);
    session.set_selection(selection);
    assert!(!session.slash_menu().is_open());

    session.type_text("/", Instant::now()).unwrap();
    assert!(session.slash_menu().is_open());
    assert_eq!(session.slash_menu().query(), Some(""));
}

#[test]
fn deleting_the_trigger_closes_the_menu() {
    let (mut session, _) = typed("/h");

    press(&mut session, Key::Backspace);
    assert_eq!(session.slash_menu().query(), Some(""));

    press(&mut session, Key::Backspace);
    assert!(!session.slash_menu().is_open());
    assert_eq!(session.html(), "<p><br></p>");
}

#[test]
fn arrows_outside_the_menu_are_ignored() {
    let (mut session, _) = typed("plain");
    assert_eq!(press(&mut session, Key::ArrowDown), KeyOutcome::Ignored);
}

#[test]
fn trigger_character_is_configurable() {
    let config = SessionConfig {
        slash: SlashConfig { trigger: ';' },
        ..SessionConfig::default()
    };
    let (mut session, _) = typed_with(config.clone(), "/code");
    assert!(!session.slash_menu().is_open());
    press(&mut session, Key::Enter);

    let (mut session, _) = typed_with(config, ";code");
    assert_eq!(candidate_keys(&session), vec!["code"]);
    press(&mut session, Key::Enter);
    assert_eq!(session.html(), "<pre><br></pre>");
}

struct Caret(Rect);

impl SelectionSurface for Caret {
    fn container_rect(&self) -> Option<Rect> {
        Some(Rect::new(0.0, 0.0, 800.0, 600.0))
    }

    fn selection_rect(&self) -> Option<Rect> {
        Some(self.0)
    }

    fn toolbar_size(&self) -> Size {
        Size::default()
    }
}

#[test]
fn menu_opens_below_the_caret() {
    let (session, _) = typed("/");
    let caret = Caret(Rect::new(50.0, 80.0, 2.0, 18.0));
    assert_eq!(session.slash_menu().menu_position(&caret), Some((50.0, 103.0)));

    let (session, _) = typed("/zzz");
    assert_eq!(session.slash_menu().menu_position(&caret), None);
}
