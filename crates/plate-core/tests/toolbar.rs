use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use notebloc_plate_core::{
    Editor, InboundContent, NoteSession, Point, Rect, Selection, SelectionSurface, SelectionTracker,
    SessionConfig, Size, ToolbarAction, ToolbarConfig, ToolbarPosition, place_toolbar,
};

struct Surface {
    container: Option<Rect>,
    selection: Option<Rect>,
}

impl SelectionSurface for Surface {
    fn container_rect(&self) -> Option<Rect> {
        self.container
    }

    fn selection_rect(&self) -> Option<Rect> {
        self.selection
    }

    fn toolbar_size(&self) -> Size {
        Size::new(120.0, 30.0)
    }
}

fn surface() -> Surface {
    Surface {
        container: Some(Rect::new(100.0, 50.0, 600.0, 400.0)),
        selection: Some(Rect::new(300.0, 200.0, 100.0, 20.0)),
    }
}

fn session_with(html: &str) -> (NoteSession, Rc<RefCell<Vec<String>>>) {
    let mut session = NoteSession::new(SessionConfig::default());
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

#[test]
fn placement_clamps_to_the_container() {
    let container = Rect::new(100.0, 50.0, 600.0, 400.0);
    let toolbar = Size::new(120.0, 30.0);
    let config = ToolbarConfig::default();

    let near_top_left = place_toolbar(Rect::new(105.0, 60.0, 20.0, 16.0), container, toolbar, &config);
    assert_eq!(near_top_left, ToolbarPosition { top: 10.0, left: 10.0 });

    let near_right = place_toolbar(Rect::new(680.0, 300.0, 20.0, 16.0), container, toolbar, &config);
    assert_eq!(near_right, ToolbarPosition { top: 210.0, left: 470.0 });
}

#[test]
fn tracker_recompute_is_idempotent() {
    let mut editor = Editor::with_note_plugins();
    editor
        .run_command("text.insert", Some(serde_json::json!({ "text": "hello" })))
        .unwrap();
    let leaf = editor.selection().focus.node;
    editor.set_selection(Selection::new(
        Point::new(leaf, 1),
        Point::new(leaf, 4),
    ));

    let mut tracker = SelectionTracker::new();
    assert!(tracker.recompute(&editor));
    let first = tracker.current().cloned();
    assert!(!tracker.recompute(&editor));
    assert_eq!(tracker.current().cloned(), first);

    let derived = first.unwrap();
    assert_eq!(derived.text, "ell");
    assert_eq!((derived.start_offset, derived.end_offset), (1, 4));
}

#[test]
fn backwards_selections_are_reported_in_document_order() {
    let (mut session, _) = session_with("<p>first</p><p>second</p>");
    select(&mut session, 9, 2);

    let derived = session.selection().unwrap();
    assert_eq!(derived.text, "rst\nsec");
    assert_eq!((derived.start_offset, derived.end_offset), (2, 9));
}

#[test]
fn toolbar_waits_for_a_measurement_before_showing() {
    let (mut session, _) = session_with("<p>hello world</p>");
    select(&mut session, 0, 5);

    assert!(session.toolbar().needs_measure());
    assert!(!session.toolbar().is_visible());

    let position = session.measure_toolbar(&surface());
    assert_eq!(position, Some(ToolbarPosition { top: 110.0, left: 190.0 }));
    assert!(session.toolbar().is_visible());
    assert!(!session.toolbar().needs_measure());
}

#[test]
fn collapsing_the_selection_hides_the_toolbar() {
    let (mut session, _) = session_with("<p>hello world</p>");
    select(&mut session, 0, 5);
    session.measure_toolbar(&surface());

    select(&mut session, 3, 3);

    assert!(session.selection().is_none());
    assert!(!session.toolbar().is_visible());
    assert_eq!(session.toolbar().position(), None);
}

#[test]
fn missing_anchor_leaves_the_toolbar_hidden() {
    let (mut session, _) = session_with("<p>hello world</p>");
    select(&mut session, 0, 5);

    let position = session.measure_toolbar(&Surface {
        container: Some(Rect::new(0.0, 0.0, 600.0, 400.0)),
        selection: None,
    });

    assert_eq!(position, None);
    assert!(!session.toolbar().is_visible());
}

#[test]
fn format_buttons_toggle_marks_and_reflect_them() {
    let (mut session, emitted) = session_with("<p>hello world</p>");
    select(&mut session, 0, 5);

    session
        .toolbar_action(ToolbarAction::Bold, Instant::now())
        .unwrap();

    let formats = session.toolbar().active_formats();
    assert!(ToolbarAction::Bold.is_active(&formats));
    assert!(!ToolbarAction::Italic.is_active(&formats));
    assert_eq!(
        emitted.borrow().as_slice(),
        ["<p><strong>hello</strong> world</p>".to_string()]
    );

    session
        .toolbar_action(ToolbarAction::Bold, Instant::now())
        .unwrap();
    assert!(!session.toolbar().active_formats().bold);
    assert_eq!(session.html(), "<p>hello world</p>");
}

#[test]
fn comment_button_opens_the_entry_form_without_editing() {
    let (mut session, emitted) = session_with("<p>hello world</p>");
    select(&mut session, 6, 11);

    session
        .toolbar_action(ToolbarAction::Comment, Instant::now())
        .unwrap();

    assert_eq!(session.comments().entry().unwrap().text, "world");
    assert!(emitted.borrow().is_empty());
}

#[test]
fn buttons_do_nothing_without_a_selection() {
    let (mut session, emitted) = session_with("<p>hello world</p>");

    for action in ToolbarAction::ALL {
        session.toolbar_action(action, Instant::now()).unwrap();
    }

    assert!(emitted.borrow().is_empty());
    assert!(session.comments().entry().is_none());
}
