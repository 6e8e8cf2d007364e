use notebloc_plate_core::{
    Document, Editor, MarkKind, Marks, Node, NodeId, Point, PluginRegistry, Selection, active_marks,
    derive_selection,
};

fn editor_with_text(text: &str) -> Editor {
    Editor::with_document(
        Document::new(vec![Node::paragraph(text)]),
        PluginRegistry::notes(),
    )
}

fn first_leaf(editor: &Editor) -> NodeId {
    editor.doc().text_blocks()[0]
        .text_leaves()
        .next()
        .unwrap()
        .id
}

fn select_absolute(editor: &mut Editor, start: usize, end: usize) {
    let anchor = editor.doc().point_at_absolute(start).unwrap();
    let focus = editor.doc().point_at_absolute(end).unwrap();
    editor.set_selection(Selection::new(anchor, focus));
}

fn leaves(editor: &Editor) -> Vec<(String, Marks)> {
    editor.doc().text_blocks()[0]
        .text_leaves()
        .map(|t| (t.text.clone(), t.marks.clone()))
        .collect()
}

#[test]
fn toggling_bold_over_part_of_a_leaf_splits_it() {
    let mut editor = editor_with_text("hello world");
    select_absolute(&mut editor, 0, 5);

    editor.run_command("marks.toggle_bold", None).unwrap();

    assert_eq!(
        leaves(&editor),
        vec![
            ("hello".to_string(), Marks::default().with(MarkKind::Bold, true)),
            (" world".to_string(), Marks::default()),
        ]
    );
    // The text is untouched, so the selection still covers "hello".
    let derived = derive_selection(editor.doc(), editor.selection()).unwrap();
    assert_eq!(derived.text, "hello");
    assert!(derived.formats.bold);
}

#[test]
fn toggling_again_removes_the_mark_and_merges_leaves() {
    let mut editor = editor_with_text("hello world");
    select_absolute(&mut editor, 0, 5);
    editor.run_command("marks.toggle_bold", None).unwrap();

    editor.run_command("marks.toggle_bold", None).unwrap();

    assert_eq!(
        leaves(&editor),
        vec![("hello world".to_string(), Marks::default())]
    );
}

#[test]
fn partially_marked_ranges_are_marked_fully() {
    let mut editor = editor_with_text("hello world");
    select_absolute(&mut editor, 0, 5);
    editor.run_command("marks.toggle_italic", None).unwrap();

    select_absolute(&mut editor, 0, 11);
    editor.run_command("marks.toggle_italic", None).unwrap();

    assert_eq!(
        leaves(&editor),
        vec![(
            "hello world".to_string(),
            Marks::default().with(MarkKind::Italic, true)
        )]
    );
}

#[test]
fn collapsed_toggle_applies_to_the_next_typed_text() {
    let mut editor = editor_with_text("ab");
    let leaf = first_leaf(&editor);
    editor.set_selection(Selection::collapsed(Point::new(leaf, 2)));
    let version = editor.version();

    editor.run_command("marks.toggle_bold", None).unwrap();
    assert!(active_marks(&editor).bold);
    assert_eq!(editor.version(), version);

    editor
        .run_command("text.insert", Some(serde_json::json!({ "text": "cd" })))
        .unwrap();

    assert_eq!(
        leaves(&editor),
        vec![
            ("ab".to_string(), Marks::default()),
            ("cd".to_string(), Marks::default().with(MarkKind::Bold, true)),
        ]
    );
    assert!(active_marks(&editor).bold);
}

#[test]
fn moving_the_caret_drops_pending_marks() {
    let mut editor = editor_with_text("ab");
    let leaf = first_leaf(&editor);
    editor.set_selection(Selection::collapsed(Point::new(leaf, 2)));
    editor.run_command("marks.toggle_code", None).unwrap();

    editor.set_selection(Selection::collapsed(Point::new(leaf, 1)));

    assert_eq!(editor.caret_marks(), None);
    assert!(!active_marks(&editor).code);
}

#[test]
fn highlight_spans_blocks() {
    let mut editor = Editor::with_document(
        Document::new(vec![Node::paragraph("first"), Node::paragraph("second")]),
        PluginRegistry::notes(),
    );
    select_absolute(&mut editor, 2, "first\nsec".len());

    editor.run_command("marks.set_highlight", None).unwrap();

    let highlighted: Vec<String> = editor
        .doc()
        .text_blocks()
        .iter()
        .flat_map(|block| block.text_leaves())
        .filter(|t| t.marks.highlight)
        .map(|t| t.text.clone())
        .collect();
    assert_eq!(highlighted, vec!["rst", "sec"]);
}

#[test]
fn active_marks_query_reports_the_focus_leaf() {
    let mut editor = editor_with_text("hello");
    select_absolute(&mut editor, 0, 5);
    editor.run_command("marks.toggle_underline", None).unwrap();

    let marks: Marks = editor.run_query("marks.get_active", None).unwrap();
    assert!(marks.underline);
    assert!(!marks.bold);
}

#[test]
fn links_cover_the_selection_and_can_be_removed() {
    let mut editor = editor_with_text("see the docs");
    select_absolute(&mut editor, 8, 12);

    editor
        .run_command(
            "marks.set_link",
            Some(serde_json::json!({ "url": " https://example.com/docs " })),
        )
        .unwrap();

    let link = Marks {
        link: Some("https://example.com/docs".to_string()),
        ..Marks::default()
    };
    assert_eq!(
        leaves(&editor),
        vec![
            ("see the ".to_string(), Marks::default()),
            ("docs".to_string(), link),
        ]
    );

    editor.run_command("marks.unset_link", None).unwrap();
    assert_eq!(
        leaves(&editor),
        vec![("see the docs".to_string(), Marks::default())]
    );
}

#[test]
fn set_link_needs_a_url() {
    let mut editor = editor_with_text("docs");
    select_absolute(&mut editor, 0, 4);

    let err = editor
        .run_command("marks.set_link", Some(serde_json::json!({ "url": "  " })))
        .unwrap_err();

    assert!(err.message().contains("url"));
    assert_eq!(leaves(&editor)[0].1, Marks::default());
}
