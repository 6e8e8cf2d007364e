use crate::core::{BlockKind, Document};
use crate::html::from_html_lenient;

pub const UNTITLED: &str = "Untitled";

const EXCERPT_CHARS: usize = 50;
const MAX_TITLE_CHARS: usize = 100;

/// Picks a title for a note: the first non-blank `h1`, else `h2`, else `h3`,
/// else an excerpt of the first non-blank paragraph or line of text.
pub fn extract_title(html: &str) -> String {
    if html.trim().is_empty() {
        return UNTITLED.to_string();
    }
    title_of(&from_html_lenient(html))
}

pub fn title_of(doc: &Document) -> String {
    let blocks = doc.text_blocks();
    for level in 1..=3 {
        let heading = blocks
            .iter()
            .filter(|el| el.kind == BlockKind::Heading { level })
            .map(|el| el.text())
            .find(|text| !text.trim().is_empty());
        if let Some(text) = heading {
            return text.trim().to_string();
        }
    }

    let paragraph = blocks
        .iter()
        .filter(|el| el.kind == BlockKind::Paragraph)
        .map(|el| el.text())
        .find(|text| !text.trim().is_empty());
    if let Some(text) = paragraph {
        return excerpt(text.trim());
    }

    let body = doc.plain_text();
    let body = body.trim();
    match body.lines().next().map(str::trim) {
        Some(line) if !line.is_empty() => excerpt(line),
        _ => UNTITLED.to_string(),
    }
}

fn excerpt(text: &str) -> String {
    if text.chars().count() > EXCERPT_CHARS {
        let head: String = text.chars().take(EXCERPT_CHARS).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

/// Strips characters that are not allowed in file names, collapses runs of
/// whitespace and caps the length.
pub fn clean_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|ch| !matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();
    kept.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect()
}
