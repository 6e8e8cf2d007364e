use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use notebloc_plate_core::{
    BlockGeometry, DragSession, DropSide, InboundContent, NodeId, NoteSession, Rect, SessionConfig,
};

/// Blocks stacked 40px apart, in the order given.
struct Rows(Vec<NodeId>);

impl BlockGeometry for Rows {
    fn block_rect(&self, block: NodeId) -> Option<Rect> {
        let ix = self.0.iter().position(|id| *id == block)?;
        Some(Rect::new(0.0, ix as f32 * 40.0, 600.0, 40.0))
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

fn top_level(session: &NoteSession) -> Vec<NodeId> {
    session
        .editor()
        .doc()
        .children
        .iter()
        .map(|node| node.id())
        .collect()
}

#[test]
fn dropping_on_the_lower_half_moves_after() {
    let (mut session, emitted) = session_with("<p>a</p><p>b</p><p>c</p>");
    let rows = Rows(top_level(&session));
    let (a, b) = (rows.0[0], rows.0[1]);

    session.drag_start(a);
    session.drag_over(b, 70.0, &rows);

    assert_eq!(
        session.drag().session(),
        DragSession {
            source: Some(a),
            target: Some(b),
            side: Some(DropSide::After),
        }
    );
    assert_eq!(session.drag().drop_indicator_y(&rows), Some(80.0));

    assert!(session.drop_block(Instant::now()));
    assert_eq!(session.html(), "<p>b</p><p>a</p><p>c</p>");
    assert_eq!(emitted.borrow().len(), 1);
    assert!(!session.drag().is_dragging());
    assert_eq!(session.drag().session(), DragSession::default());
}

#[test]
fn dropping_on_the_upper_half_moves_before() {
    let (mut session, _) = session_with("<p>a</p><p>b</p><p>c</p>");
    let rows = Rows(top_level(&session));
    let (a, c) = (rows.0[0], rows.0[2]);

    session.drag_start(c);
    session.drag_over(a, 5.0, &rows);
    assert_eq!(session.drag().drop_indicator_y(&rows), Some(0.0));

    assert!(session.drop_block(Instant::now()));
    assert_eq!(session.html(), "<p>c</p><p>a</p><p>b</p>");
}

#[test]
fn hovering_the_source_clears_the_target() {
    let (mut session, emitted) = session_with("<p>a</p><p>b</p>");
    let rows = Rows(top_level(&session));
    let (a, b) = (rows.0[0], rows.0[1]);

    session.drag_start(a);
    session.drag_over(b, 50.0, &rows);
    session.drag_over(a, 10.0, &rows);

    assert_eq!(session.drag().session().target, None);
    assert_eq!(session.drag().drop_indicator_y(&rows), None);
    assert!(!session.drop_block(Instant::now()));
    assert_eq!(session.html(), "<p>a</p><p>b</p>");
    assert!(emitted.borrow().is_empty());
}

#[test]
fn dropping_a_list_onto_its_own_item_is_ignored() {
    let (mut session, emitted) = session_with("<ul><li>one</li><li>two</li></ul><p>x</p>");
    let list = top_level(&session)[0];
    let blocks: Vec<NodeId> = session
        .editor()
        .doc()
        .text_blocks()
        .iter()
        .map(|block| block.id)
        .collect();
    let rows = Rows(blocks.clone());
    let before = session.html();

    session.drag_start(list);
    session.drag_over(blocks[1], 75.0, &rows);

    assert!(!session.drop_block(Instant::now()));
    assert_eq!(session.html(), before);
    assert!(emitted.borrow().is_empty());
}

#[test]
fn list_items_can_be_dragged_out_of_their_list() {
    let (mut session, _) = session_with("<p>intro</p><ul><li>one</li><li>two</li></ul>");
    let blocks: Vec<NodeId> = session
        .editor()
        .doc()
        .text_blocks()
        .iter()
        .map(|block| block.id)
        .collect();
    let rows = Rows(blocks.clone());

    session.drag_start(blocks[2]);
    session.drag_over(blocks[0], 2.0, &rows);

    assert!(session.drop_block(Instant::now()));
    assert_eq!(session.html(), "<p>two</p><p>intro</p><ul><li>one</li></ul>");
}

#[test]
fn drop_without_a_target_does_nothing() {
    let (mut session, _) = session_with("<p>a</p><p>b</p>");
    let a = top_level(&session)[0];

    session.drag_start(a);
    assert!(!session.drop_block(Instant::now()));
    assert!(!session.drag().is_dragging());
}

#[test]
fn drag_over_is_ignored_when_not_dragging() {
    let (mut session, _) = session_with("<p>a</p><p>b</p>");
    let rows = Rows(top_level(&session));

    session.drag_over(rows.0[1], 50.0, &rows);

    assert_eq!(session.drag().session(), DragSession::default());
}

#[test]
fn hover_tracking_pauses_while_dragging() {
    let (mut session, _) = session_with("<p>a</p><p>b</p><p>c</p>");
    let ids = top_level(&session);

    session.hover(ids[0]);
    assert_eq!(session.drag().hovered(), Some(ids[0]));

    session.drag_start(ids[1]);
    session.hover(ids[2]);
    session.hover_out();
    assert_eq!(session.drag().hovered(), Some(ids[0]));

    session.drag_end();
    session.hover_out();
    assert_eq!(session.drag().hovered(), None);
    assert_eq!(session.drag().session(), DragSession::default());
}
