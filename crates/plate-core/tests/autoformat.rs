use notebloc_plate_core::{BlockKind, Document, Editor, Node, Point, PluginRegistry, Selection, to_html};

fn type_chars(editor: &mut Editor, text: &str) {
    for ch in text.chars() {
        editor
            .run_command(
                "text.insert",
                Some(serde_json::json!({ "text": ch.to_string() })),
            )
            .unwrap();
    }
}

fn kinds(editor: &Editor) -> Vec<BlockKind> {
    editor.doc().text_blocks().iter().map(|b| b.kind).collect()
}

#[test]
fn hash_prefixes_become_headings() {
    for level in 1..=6u8 {
        let mut editor = Editor::with_note_plugins();
        type_chars(&mut editor, &format!("{} Title", "#".repeat(level.into())));

        assert_eq!(kinds(&editor), vec![BlockKind::Heading { level }]);
        assert_eq!(editor.doc().plain_text(), "Title");
    }
}

#[test]
fn seven_hashes_stay_text() {
    let mut editor = Editor::with_note_plugins();
    type_chars(&mut editor, "####### x");
    assert_eq!(kinds(&editor), vec![BlockKind::Paragraph]);
    assert_eq!(editor.doc().plain_text(), "####### x");
}

#[test]
fn quote_and_code_prefixes() {
    let mut editor = Editor::with_note_plugins();
    type_chars(&mut editor, "> wise words");
    assert_eq!(to_html(editor.doc()), "<blockquote>wise words</blockquote>");

    let mut editor = Editor::with_note_plugins();
    type_chars(&mut editor, "``` fn main() {}");
    assert_eq!(to_html(editor.doc()), "<pre>fn main() {}</pre>");
}

#[test]
fn dash_and_number_prefixes_start_lists() {
    let mut editor = Editor::with_note_plugins();
    type_chars(&mut editor, "- milk");
    assert_eq!(to_html(editor.doc()), "<ul><li>milk</li></ul>");

    let mut editor = Editor::with_note_plugins();
    type_chars(&mut editor, "1. first");
    assert_eq!(to_html(editor.doc()), "<ol><li>first</li></ol>");
}

#[test]
fn prefix_only_applies_at_the_start_of_a_paragraph() {
    let mut editor = Editor::with_note_plugins();
    type_chars(&mut editor, "see # here");
    assert_eq!(kinds(&editor), vec![BlockKind::Paragraph]);

    let mut editor = Editor::with_document(
        Document::new(vec![Node::heading(2, "")]),
        PluginRegistry::notes(),
    );
    type_chars(&mut editor, "> ");
    assert_eq!(kinds(&editor), vec![BlockKind::Heading { level: 2 }]);
    assert_eq!(editor.doc().plain_text(), "> ");
}

#[test]
fn prefix_typed_before_existing_text_is_ignored() {
    let mut editor = Editor::with_document(
        Document::new(vec![Node::paragraph("tail")]),
        PluginRegistry::notes(),
    );
    let leaf = editor.doc().text_blocks()[0].text_leaves().next().unwrap().id;
    editor.set_selection(Selection::collapsed(Point::new(leaf, 0)));

    type_chars(&mut editor, "# ");

    assert_eq!(kinds(&editor), vec![BlockKind::Paragraph]);
    assert_eq!(editor.doc().plain_text(), "# tail");
}

#[test]
fn undo_reverts_the_keystroke_and_the_conversion_together() {
    let mut editor = Editor::with_note_plugins();
    type_chars(&mut editor, "# ");
    assert_eq!(kinds(&editor), vec![BlockKind::Heading { level: 1 }]);

    assert!(editor.undo());

    assert_eq!(kinds(&editor), vec![BlockKind::Paragraph]);
    assert_eq!(editor.doc().plain_text(), "#");
}

#[test]
fn closing_delimiters_format_the_run_before_the_caret() {
    let mut editor = Editor::with_note_plugins();
    type_chars(&mut editor, "make **this** bold");
    assert_eq!(to_html(editor.doc()), "<p>make <strong>this</strong> bold</p>");

    let mut editor = Editor::with_note_plugins();
    type_chars(&mut editor, "*soft* and `ls` or __loud__");
    assert_eq!(
        to_html(editor.doc()),
        "<p><em>soft</em> and <code>ls</code> or <strong>loud</strong></p>"
    );
}

#[test]
fn delimiters_inside_words_and_code_blocks_stay_text() {
    let mut editor = Editor::with_note_plugins();
    type_chars(&mut editor, "snake_case_name and 2*3*4");
    assert_eq!(editor.doc().plain_text(), "snake_case_name and 2*3*4");

    let mut editor = Editor::with_note_plugins();
    type_chars(&mut editor, "``` let x = *y*;");
    assert_eq!(to_html(editor.doc()), "<pre>let x = *y*;</pre>");
}

#[test]
fn undo_restores_the_typed_delimiters() {
    let mut editor = Editor::with_note_plugins();
    type_chars(&mut editor, "**hi**");
    assert_eq!(to_html(editor.doc()), "<p><strong>hi</strong></p>");

    assert!(editor.undo());

    assert_eq!(to_html(editor.doc()), "<p>**hi*</p>");
}
