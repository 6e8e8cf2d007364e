use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use notebloc_plate_core::{
    CommentConfig, CommentLayer, Editor, InboundContent, Key, MarkKind, NoteSession, PluginRegistry,
    Point, Rect, Selection, SelectionSurface, SelectionTracker, SessionConfig, Size, ToolbarAction,
    from_html,
};
use uuid::Uuid;

struct Surface;

impl SelectionSurface for Surface {
    fn container_rect(&self) -> Option<Rect> {
        Some(Rect::new(100.0, 50.0, 600.0, 400.0))
    }

    fn selection_rect(&self) -> Option<Rect> {
        Some(Rect::new(300.0, 200.0, 100.0, 20.0))
    }

    fn toolbar_size(&self) -> Size {
        Size::new(120.0, 30.0)
    }
}

fn session_with(
    config: SessionConfig,
    html: &str,
) -> (NoteSession, Rc<RefCell<Vec<String>>>) {
    let mut session = NoteSession::new(config);
    session.set_inbound(
        InboundContent {
            initial_content: html.to_string(),
            document_id: "note-1".to_string(),
        },
        Instant::now(),
    );
    let emitted = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&emitted);
    session.on_change(move |html| sink.borrow_mut().push(html.to_string()));
    (session, emitted)
}

fn select(session: &mut NoteSession, start: usize, end: usize) {
    let doc = session.editor().doc();
    let anchor = doc.point_at_absolute(start).unwrap();
    let focus = doc.point_at_absolute(end).unwrap();
    session.set_selection(Selection::new(anchor, focus));
}

fn open_entry(session: &mut NoteSession, start: usize, end: usize) {
    select(session, start, end);
    session
        .toolbar_action(ToolbarAction::Comment, Instant::now())
        .unwrap();
}

#[test]
fn submitting_the_entry_form_adds_a_highlighted_comment() {
    let (mut session, emitted) = session_with(SessionConfig::default(), "<p>hello world</p>");
    open_entry(&mut session, 6, 11);

    assert_eq!(session.submit_comment("   ", Instant::now()), None);
    assert!(session.comments().entry().is_some());
    assert!(session.comments().is_empty());

    let id = session
        .submit_comment("Which world?", Instant::now())
        .unwrap();

    assert!(session.comments().entry().is_none());
    assert!(Uuid::parse_str(&id).is_ok());
    let comments = session.comments().comments();
    assert_eq!(comments.len(), 1);
    let comment = &comments[0];
    assert_eq!(comment.id, id);
    assert_eq!(comment.body, "Which world?");
    assert_eq!(comment.selection_text, "world");
    assert_eq!((comment.start_offset, comment.end_offset), (6, 11));
    assert_eq!(session.html(), "<p>hello <mark>world</mark></p>");
    assert_eq!(
        emitted.borrow().last().map(String::as_str),
        Some("<p>hello <mark>world</mark></p>")
    );
}

#[test]
fn comment_ranges_follow_later_edits() {
    let (mut session, _) = session_with(SessionConfig::default(), "<p>hello world</p>");
    open_entry(&mut session, 6, 11);
    session.submit_comment("note", Instant::now()).unwrap();

    select(&mut session, 0, 0);
    session.type_text("Oh, ", Instant::now()).unwrap();

    let comments = session.comments();
    let list = comments.comments();
    let comment = &list[0];
    assert_eq!(session.html(), "<p>Oh, hello <mark>world</mark></p>");
    assert_eq!((comment.start_offset, comment.end_offset), (6, 11));
    assert_eq!(
        comments.live_range(session.editor(), comment),
        Some((10, 15))
    );
    assert_eq!(
        comments.live_text(session.editor(), comment).as_deref(),
        Some("world")
    );
}

#[test]
fn splitting_before_a_comment_carries_it_into_the_new_block() {
    let (mut session, _) = session_with(SessionConfig::default(), "<p>hello world</p>");
    open_entry(&mut session, 6, 11);
    session.submit_comment("note", Instant::now()).unwrap();

    select(&mut session, 2, 2);
    session.press_key(Key::Enter, Instant::now()).unwrap();

    assert_eq!(session.html(), "<p>he</p><p>llo <mark>world</mark></p>");
    let comments = session.comments();
    let list = comments.comments();
    assert_eq!(comments.live_range(session.editor(), &list[0]), Some((7, 12)));
    assert_eq!(
        comments.live_text(session.editor(), &list[0]).as_deref(),
        Some("world")
    );
    drop(list);

    session.undo(Instant::now());
    let list = session.comments().comments();
    assert_eq!(
        session.comments().live_text(session.editor(), &list[0]).as_deref(),
        Some("world")
    );
}

#[test]
fn merging_blocks_keeps_comments_on_the_merged_text() {
    let (mut session, _) =
        session_with(SessionConfig::default(), "<p>one</p><p>two three</p>");
    open_entry(&mut session, 8, 13);
    session.submit_comment("note", Instant::now()).unwrap();

    let second = session.editor().doc().text_blocks()[1]
        .text_leaves()
        .next()
        .unwrap()
        .id;
    session.set_selection(Selection::collapsed(Point::new(second, 0)));
    session.press_key(Key::Backspace, Instant::now()).unwrap();

    assert_eq!(session.html(), "<p>onetwo <mark>three</mark></p>");
    let comments = session.comments();
    let list = comments.comments();
    assert_eq!(comments.live_range(session.editor(), &list[0]), Some((7, 12)));
    assert_eq!(
        comments.live_text(session.editor(), &list[0]).as_deref(),
        Some("three")
    );
}

#[test]
fn empty_ranges_are_not_commented() {
    let mut editor = Editor::with_document(
        from_html("<p>hello</p>").unwrap(),
        PluginRegistry::notes(),
    );
    let leaf = editor.selection().focus.node;
    editor.set_selection(Selection::collapsed(Point::new(leaf, 2)));
    let layer = CommentLayer::new(&CommentConfig::default());

    let mut tracker = SelectionTracker::new();
    tracker.recompute(&editor);
    assert!(tracker.current().is_none());

    editor.set_selection(Selection::new(Point::new(leaf, 0), Point::new(leaf, 5)));
    tracker.recompute(&editor);
    let mut selection = tracker.current().cloned().unwrap();
    selection.end_offset = selection.start_offset;

    assert_eq!(layer.add_comment(&mut editor, &selection, "body"), None);
    assert!(layer.is_empty());
}

#[test]
fn add_comment_highlights_across_blocks() {
    let mut editor = Editor::with_document(
        from_html("<p>first</p><p>second</p>").unwrap(),
        PluginRegistry::notes(),
    );
    let doc = editor.doc();
    let (start, end) = (
        doc.point_at_absolute(2).unwrap(),
        doc.point_at_absolute(9).unwrap(),
    );
    editor.set_selection(Selection::new(start, end));
    let mut tracker = SelectionTracker::new();
    tracker.recompute(&editor);
    let selection = tracker.current().cloned().unwrap();
    let layer = CommentLayer::new(&CommentConfig::default());

    layer.add_comment(&mut editor, &selection, "span").unwrap();

    let highlighted: Vec<String> = editor
        .doc()
        .text_blocks()
        .into_iter()
        .flat_map(|block| block.text_leaves())
        .filter(|leaf| leaf.marks.has(MarkKind::Highlight))
        .map(|leaf| leaf.text.clone())
        .collect();
    assert_eq!(highlighted, vec!["rst", "sec"]);
    let comment = layer.comments()[0].clone();
    assert_eq!(layer.live_text(&editor, &comment).as_deref(), Some("rst\nsec"));
}

#[test]
fn entry_form_opens_at_the_selection_edge() {
    let (mut session, _) = session_with(SessionConfig::default(), "<p>hello world</p>");
    assert_eq!(session.comments().entry_position(&Surface), None);

    open_entry(&mut session, 0, 5);
    assert_eq!(session.comments().entry_position(&Surface), Some((300.0, 150.0)));

    session.comments().cancel_entry();
    assert!(session.comments().entry().is_none());
}

#[test]
fn visibility_and_active_comment() {
    let (mut session, _) = session_with(SessionConfig::default(), "<p>hello world</p>");
    open_entry(&mut session, 0, 5);
    let id = session.submit_comment("hi", Instant::now()).unwrap();
    let comments = session.comments();

    assert!(comments.is_visible());
    assert!(!comments.toggle_visible());
    assert!(comments.toggle_visible());

    comments.set_active(Some(&id));
    assert_eq!(comments.active(), Some(id));
    comments.set_active(None);
    assert_eq!(comments.active(), None);

    let hidden = SessionConfig {
        comments: CommentConfig {
            visible_by_default: false,
        },
        ..SessionConfig::default()
    };
    let (session, _) = session_with(hidden, "<p>x</p>");
    assert!(!session.comments().is_visible());
}

#[test]
fn unmount_discards_comments() {
    let (mut session, _) = session_with(SessionConfig::default(), "<p>hello world</p>");
    open_entry(&mut session, 0, 5);
    session.submit_comment("gone soon", Instant::now()).unwrap();
    assert_eq!(session.comments().len(), 1);

    session.unmount();

    assert!(session.comments().is_empty());
    assert!(session.selection().is_none());
    assert!(!session.toolbar().is_visible());
}
