//! HTML serialization of notes and the parser used to load them back.
//!
//! The writer emits the subset the editor understands: `<p>`, `<h1>`-`<h6>`,
//! `<ul>`/`<ol>` with `<li>`, `<blockquote>` and `<pre>`, with marks nested
//! as `<a href><strong><em><u><code><mark>`. The reader accepts that subset
//! plus the usual noise found in pasted or stored markup.

use crate::core::{BlockKind, Document, ElementNode, MarkKind, Marks, Node, TextNode};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HtmlError {
    #[error("unterminated tag at byte {offset}")]
    UnterminatedTag { offset: usize },
    #[error("unterminated comment at byte {offset}")]
    UnterminatedComment { offset: usize },
    #[error("expected </{expected}> but found </{found}> at byte {offset}")]
    MismatchedEndTag {
        expected: String,
        found: String,
        offset: usize,
    },
    #[error("end tag </{tag}> at byte {offset} has no matching start tag")]
    StrayEndTag { tag: String, offset: usize },
    #[error("<{tag}> is never closed")]
    UnclosedTag { tag: String },
}

pub fn to_html(doc: &Document) -> String {
    let mut out = String::new();
    for node in &doc.children {
        write_node(node, &mut out);
    }
    out
}

fn write_node(node: &Node, out: &mut String) {
    let Node::Element(el) = node else {
        if let Node::Text(t) = node {
            write_leaf(t, false, out);
        }
        return;
    };
    match el.kind {
        BlockKind::List { ordered } => {
            let tag = if ordered { "ol" } else { "ul" };
            out.push('<');
            out.push_str(tag);
            out.push('>');
            for child in &el.children {
                write_node(child, out);
            }
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
        kind => {
            let tag = block_tag(kind);
            out.push('<');
            out.push_str(&tag);
            out.push('>');
            write_inline(el, kind == BlockKind::Code, out);
            out.push_str("</");
            out.push_str(&tag);
            out.push('>');
        }
    }
}

fn block_tag(kind: BlockKind) -> String {
    match kind {
        BlockKind::Paragraph => "p".into(),
        BlockKind::Heading { level } => format!("h{}", level.clamp(1, 6)),
        BlockKind::List { ordered: true } => "ol".into(),
        BlockKind::List { ordered: false } => "ul".into(),
        BlockKind::ListItem => "li".into(),
        BlockKind::Quote => "blockquote".into(),
        BlockKind::Code => "pre".into(),
    }
}

fn write_inline(el: &ElementNode, pre: bool, out: &mut String) {
    let text = el.text();
    // Parsers drop one newline straight after <pre>.
    if pre && text.starts_with('\n') {
        out.push('\n');
    }
    for leaf in el.text_leaves() {
        write_leaf(leaf, pre, out);
    }
    // A trailing line break needs a placeholder to stay visible, as does an
    // empty block.
    if text.is_empty() || text.ends_with('\n') {
        out.push_str("<br>");
    }
}

const MARK_TAGS: [(MarkKind, &str); 5] = [
    (MarkKind::Bold, "strong"),
    (MarkKind::Italic, "em"),
    (MarkKind::Underline, "u"),
    (MarkKind::Code, "code"),
    (MarkKind::Highlight, "mark"),
];

fn write_leaf(leaf: &TextNode, pre: bool, out: &mut String) {
    if leaf.text.is_empty() {
        return;
    }
    let tags: Vec<&str> = MARK_TAGS
        .iter()
        .filter(|(kind, _)| leaf.marks.has(*kind))
        .map(|(_, tag)| *tag)
        .collect();
    if let Some(href) = &leaf.marks.link {
        out.push_str("<a href=\"");
        escape_attr(href, out);
        out.push_str("\">");
    }
    for tag in &tags {
        out.push('<');
        out.push_str(tag);
        out.push('>');
    }
    for ch in leaf.text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\n' if !pre => out.push_str("<br>"),
            ch => out.push(ch),
        }
    }
    for tag in tags.iter().rev() {
        out.push_str("</");
        out.push_str(tag);
        out.push('>');
    }
    if leaf.marks.link.is_some() {
        out.push_str("</a>");
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            ch => out.push(ch),
        }
    }
}

/// Parses stored note HTML. Malformed markup is an error; callers decide the
/// fallback.
pub fn from_html(input: &str) -> Result<Document, HtmlError> {
    parse(input, true)
}

/// Like [`from_html`] but recovers from malformed markup the way a browser
/// would: stray end tags are ignored and open elements closed at the end.
pub fn from_html_lenient(input: &str) -> Document {
    parse(input, false).unwrap_or_else(|_| Document::empty())
}

fn parse(input: &str, strict: bool) -> Result<Document, HtmlError> {
    let bytes = input.as_bytes();
    let mut builder = TreeBuilder::new(strict);
    let mut idx = 0usize;

    while idx < bytes.len() {
        if bytes[idx] != b'<' {
            let next = find_byte(bytes, idx, b'<').unwrap_or(bytes.len());
            builder.text(&decode_entities(&input[idx..next]));
            idx = next;
            continue;
        }

        if starts_with(bytes, idx, b"<!--") {
            match find_subslice(bytes, idx + 4, b"-->") {
                Some(end) => idx = end + 3,
                None if strict => return Err(HtmlError::UnterminatedComment { offset: idx }),
                None => idx = bytes.len(),
            }
            continue;
        }

        if starts_with(bytes, idx, b"<!") || starts_with(bytes, idx, b"<?") {
            idx = skip_to_gt(bytes, idx + 2);
            continue;
        }

        let Some((tag, next)) = parse_tag(bytes, idx) else {
            let names_tag = bytes
                .get(idx + 1)
                .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'/');
            if strict && names_tag {
                return Err(HtmlError::UnterminatedTag { offset: idx });
            }
            builder.text("<");
            idx += 1;
            continue;
        };

        if tag.is_end {
            builder.end_tag(&tag.name, idx)?;
            idx = next;
            continue;
        }

        if RAW_TEXT_TAGS.contains(&tag.name.as_str()) && !tag.self_closing {
            idx = skip_raw_text(input, next, &tag.name);
            continue;
        }

        builder.start_tag(&tag.name, &tag.attrs, tag.self_closing);
        idx = next;
    }

    builder.finish()
}

const RAW_TEXT_TAGS: [&str; 5] = ["head", "script", "style", "title", "template"];
const VOID_TAGS: [&str; 8] = ["br", "img", "hr", "meta", "link", "input", "wbr", "col"];
const CONTAINER_TAGS: [&str; 10] = [
    "html", "body", "div", "section", "article", "main", "header", "footer", "nav", "aside",
];

fn text_block_kind(tag: &str) -> Option<BlockKind> {
    let kind = match tag {
        "p" => BlockKind::Paragraph,
        "blockquote" => BlockKind::Quote,
        "pre" => BlockKind::Code,
        "li" => BlockKind::ListItem,
        _ => {
            let level = tag.strip_prefix('h')?.parse::<u8>().ok()?;
            if !(1..=6).contains(&level) {
                return None;
            }
            BlockKind::Heading { level }
        }
    };
    Some(kind)
}

fn mark_kind(tag: &str) -> Option<MarkKind> {
    match tag {
        "strong" | "b" => Some(MarkKind::Bold),
        "em" | "i" => Some(MarkKind::Italic),
        "u" => Some(MarkKind::Underline),
        "code" => Some(MarkKind::Code),
        "mark" => Some(MarkKind::Highlight),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    /// Opened a text block.
    Block,
    /// A block-level tag inside an open text block.
    Nested,
    List,
    Mark(MarkKind),
    /// An `<a>` with its `href`.
    Link(String),
    /// A `<div>`-like wrapper; closing it ends any implicit block.
    Container,
    Transparent,
}

#[derive(Debug)]
struct OpenTag {
    name: String,
    frame: Frame,
}

#[derive(Debug)]
struct BlockInProgress {
    kind: BlockKind,
    implicit: bool,
    leaves: Vec<TextNode>,
    trailing_br: bool,
    skip_leading_newline: bool,
}

impl BlockInProgress {
    fn new(kind: BlockKind, implicit: bool) -> Self {
        Self {
            kind,
            implicit,
            leaves: Vec::new(),
            trailing_br: false,
            skip_leading_newline: kind == BlockKind::Code,
        }
    }

    fn is_empty(&self) -> bool {
        self.leaves.iter().all(|t| t.text.is_empty())
    }

    fn push(&mut self, text: &str, marks: Marks) {
        if text.is_empty() {
            return;
        }
        match self.leaves.last_mut() {
            Some(last) if last.marks == marks => last.text.push_str(text),
            _ => self.leaves.push(TextNode::new(text).with_marks(marks)),
        }
    }

    fn into_node(mut self) -> Node {
        if self.trailing_br {
            if let Some(last) = self.leaves.iter_mut().rev().find(|t| !t.text.is_empty()) {
                last.text.pop();
            }
        }
        self.leaves.retain(|t| !t.text.is_empty());
        if self.leaves.is_empty() {
            self.leaves.push(TextNode::new(""));
        }
        Node::Element(ElementNode::new(
            self.kind,
            self.leaves.into_iter().map(Node::Text).collect(),
        ))
    }
}

struct TreeBuilder {
    strict: bool,
    stack: Vec<OpenTag>,
    root: Vec<Node>,
    list: Option<(bool, Vec<Node>)>,
    list_depth: usize,
    block: Option<BlockInProgress>,
}

impl TreeBuilder {
    fn new(strict: bool) -> Self {
        Self {
            strict,
            stack: Vec::new(),
            root: Vec::new(),
            list: None,
            list_depth: 0,
            block: None,
        }
    }

    fn marks(&self) -> Marks {
        let mut marks = Marks::default();
        for open in &self.stack {
            match &open.frame {
                Frame::Mark(kind) => marks.set(*kind, true),
                Frame::Link(href) => marks.link = Some(href.clone()),
                _ => {}
            }
        }
        marks
    }

    fn in_pre(&self) -> bool {
        self.block.as_ref().is_some_and(|b| b.kind == BlockKind::Code)
    }

    fn ensure_block(&mut self) -> &mut BlockInProgress {
        let kind = if self.list_depth > 0 {
            BlockKind::ListItem
        } else {
            BlockKind::Paragraph
        };
        self.block
            .get_or_insert_with(|| BlockInProgress::new(kind, true))
    }

    fn text(&mut self, raw: &str) {
        if self.block.is_none() && raw.trim().is_empty() {
            return;
        }
        let marks = self.marks();
        let pre = self.in_pre();
        let block = self.ensure_block();

        let mut text = if pre {
            raw.replace("\r\n", "\n").replace('\r', "\n")
        } else {
            raw.replace(['\r', '\n'], " ")
        };
        if block.skip_leading_newline {
            if text.starts_with('\n') {
                text.remove(0);
            }
            if !text.is_empty() {
                block.skip_leading_newline = false;
            }
        }
        if !text.is_empty() {
            block.trailing_br = false;
        }
        block.push(&text, marks);
    }

    fn line_break(&mut self) {
        let marks = self.marks();
        let block = self.ensure_block();
        block.skip_leading_newline = false;
        block.push("\n", marks);
        block.trailing_br = true;
    }

    fn finish_block(&mut self) {
        let Some(block) = self.block.take() else {
            return;
        };
        let node = block.into_node();
        match &mut self.list {
            Some((_, items)) => items.push(node),
            None => self.root.push(node),
        }
    }

    fn close_implicit_block(&mut self) {
        if self.block.as_ref().is_some_and(|b| b.implicit) {
            self.finish_block();
        }
    }

    fn start_tag(&mut self, name: &str, attrs: &[(String, String)], self_closing: bool) {
        if name == "br" {
            self.line_break();
            return;
        }
        if VOID_TAGS.contains(&name) || self_closing {
            return;
        }

        let href = attrs
            .iter()
            .find(|(key, _)| key == "href")
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty());
        let frame = if let Some(href) = href.filter(|_| name == "a") {
            Frame::Link(href.to_string())
        } else if let Some(kind) = mark_kind(name) {
            if kind == MarkKind::Code && self.in_pre() {
                Frame::Transparent
            } else {
                Frame::Mark(kind)
            }
        } else if name == "ul" || name == "ol" {
            self.close_implicit_block();
            // Nested lists flatten into the outermost one.
            if self.block.as_ref().is_some_and(|b| b.kind == BlockKind::ListItem) {
                self.finish_block();
            }
            self.list_depth += 1;
            if self.list.is_none() {
                self.finish_block();
                self.list = Some((name == "ol", Vec::new()));
            }
            Frame::List
        } else if let Some(kind) = text_block_kind(name) {
            match self.block.as_mut().filter(|b| !b.implicit) {
                Some(block) => {
                    // Inner blocks become lines of the enclosing one.
                    if !block.is_empty() && !block.trailing_br {
                        block.push("\n", Marks::default());
                    }
                    Frame::Nested
                }
                None => {
                    self.close_implicit_block();
                    self.block = Some(BlockInProgress::new(kind, false));
                    Frame::Block
                }
            }
        } else if CONTAINER_TAGS.contains(&name) {
            if self.block.as_ref().is_some_and(|b| !b.implicit) {
                Frame::Nested
            } else {
                self.close_implicit_block();
                Frame::Container
            }
        } else {
            Frame::Transparent
        };

        self.stack.push(OpenTag {
            name: name.to_string(),
            frame,
        });
    }

    fn end_tag(&mut self, name: &str, offset: usize) -> Result<(), HtmlError> {
        if VOID_TAGS.contains(&name) {
            return Ok(());
        }
        let Some(pos) = self.stack.iter().rposition(|open| open.name == name) else {
            if self.strict {
                return Err(HtmlError::StrayEndTag {
                    tag: name.to_string(),
                    offset,
                });
            }
            return Ok(());
        };
        if self.strict && pos + 1 != self.stack.len() {
            let expected = self
                .stack
                .last()
                .map(|open| open.name.clone())
                .unwrap_or_default();
            return Err(HtmlError::MismatchedEndTag {
                expected,
                found: name.to_string(),
                offset,
            });
        }
        while self.stack.len() > pos {
            if let Some(open) = self.stack.pop() {
                self.close(open.frame);
            }
        }
        Ok(())
    }

    fn close(&mut self, frame: Frame) {
        match frame {
            Frame::Block => self.finish_block(),
            Frame::List => {
                self.close_implicit_block();
                if self.block.as_ref().is_some_and(|b| b.kind == BlockKind::ListItem) {
                    self.finish_block();
                }
                self.list_depth = self.list_depth.saturating_sub(1);
                if self.list_depth == 0 {
                    if let Some((ordered, items)) = self.list.take() {
                        self.root.push(Node::list(ordered, items));
                    }
                }
            }
            Frame::Container => self.close_implicit_block(),
            Frame::Nested | Frame::Mark(_) | Frame::Link(_) | Frame::Transparent => {}
        }
    }

    fn finish(mut self) -> Result<Document, HtmlError> {
        if self.strict {
            if let Some(open) = self.stack.first() {
                return Err(HtmlError::UnclosedTag {
                    tag: open.name.clone(),
                });
            }
        }
        while let Some(open) = self.stack.pop() {
            self.close(open.frame);
        }
        self.finish_block();
        if let Some((ordered, items)) = self.list.take() {
            self.root.push(Node::list(ordered, items));
        }
        if self.root.is_empty() {
            return Ok(Document::empty());
        }
        Ok(Document::new(self.root))
    }
}

fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest.find(';').filter(|end| *end <= 10).and_then(|end| {
            let entity = &rest[1..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            }?;
            Some((ch, end))
        });
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedTag {
    name: String,
    attrs: Vec<(String, String)>,
    is_end: bool,
    self_closing: bool,
}

/// Attribute pairs with lowercased names and decoded values. Bare
/// attributes get an empty value.
fn parse_attrs(bytes: &[u8]) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut idx = 0usize;
    loop {
        while idx < bytes.len() && (bytes[idx].is_ascii_whitespace() || bytes[idx] == b'/') {
            idx += 1;
        }
        if idx >= bytes.len() {
            return attrs;
        }

        let name_start = idx;
        while idx < bytes.len()
            && !bytes[idx].is_ascii_whitespace()
            && !matches!(bytes[idx], b'=' | b'/' | b'"' | b'\'')
        {
            idx += 1;
        }
        if idx == name_start {
            // A stray quote; skip it.
            idx += 1;
            continue;
        }
        let name = String::from_utf8_lossy(&bytes[name_start..idx]).to_ascii_lowercase();
        while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }

        let mut value = String::new();
        if bytes.get(idx).copied() == Some(b'=') {
            idx += 1;
            while idx < bytes.len() && bytes[idx].is_ascii_whitespace() {
                idx += 1;
            }
            let value_start;
            match bytes.get(idx).copied() {
                Some(quote @ (b'"' | b'\'')) => {
                    idx += 1;
                    value_start = idx;
                    while idx < bytes.len() && bytes[idx] != quote {
                        idx += 1;
                    }
                    value = String::from_utf8_lossy(&bytes[value_start..idx]).into_owned();
                    idx += 1;
                }
                _ => {
                    value_start = idx;
                    while idx < bytes.len() && !bytes[idx].is_ascii_whitespace() {
                        idx += 1;
                    }
                    value = String::from_utf8_lossy(&bytes[value_start..idx]).into_owned();
                }
            }
        }
        attrs.push((name, decode_entities(&value)));
    }
}

fn parse_tag(bytes: &[u8], start: usize) -> Option<(ParsedTag, usize)> {
    if bytes.get(start).copied() != Some(b'<') {
        return None;
    }

    let mut idx = start + 1;
    let mut is_end = false;
    if bytes.get(idx).copied() == Some(b'/') {
        is_end = true;
        idx += 1;
    }

    let name_start = idx;
    while idx < bytes.len() && is_tag_name_char(bytes[idx]) {
        idx += 1;
    }
    if idx == name_start || !bytes[name_start].is_ascii_alphabetic() {
        return None;
    }
    let name = String::from_utf8_lossy(&bytes[name_start..idx]).to_ascii_lowercase();
    let attrs_start = idx;

    let mut quote: Option<u8> = None;
    while idx < bytes.len() {
        let byte = bytes[idx];
        match quote {
            Some(q) if byte == q => quote = None,
            Some(_) => {}
            None => match byte {
                b'\'' | b'"' => quote = Some(byte),
                b'<' => return None,
                b'>' => {
                    let mut lookback = idx;
                    while lookback > start && bytes[lookback - 1].is_ascii_whitespace() {
                        lookback -= 1;
                    }
                    let self_closing = lookback > start && bytes[lookback - 1] == b'/';
                    let attrs_end = if self_closing { lookback - 1 } else { idx };
                    let attrs = if is_end {
                        Vec::new()
                    } else {
                        parse_attrs(&bytes[attrs_start..attrs_end.max(attrs_start)])
                    };
                    return Some((
                        ParsedTag {
                            name,
                            attrs,
                            is_end,
                            self_closing,
                        },
                        idx + 1,
                    ));
                }
                _ => {}
            },
        }
        idx += 1;
    }
    None
}

fn skip_raw_text(input: &str, start: usize, tag_name: &str) -> usize {
    let bytes = input.as_bytes();
    let tag_bytes = tag_name.as_bytes();
    let mut idx = start;
    while idx < bytes.len() {
        if bytes[idx] == b'<'
            && bytes.get(idx + 1).copied() == Some(b'/')
            && starts_with_ignore_ascii_case(bytes, idx + 2, tag_bytes)
        {
            if let Some((_, end)) = parse_tag(bytes, idx) {
                return end;
            }
        }
        idx += 1;
    }
    bytes.len()
}

fn skip_to_gt(bytes: &[u8], from: usize) -> usize {
    find_byte(bytes, from, b'>').map_or(bytes.len(), |ix| ix + 1)
}

fn is_tag_name_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b':')
}

fn starts_with(bytes: &[u8], idx: usize, pattern: &[u8]) -> bool {
    bytes.get(idx..idx + pattern.len()) == Some(pattern)
}

fn starts_with_ignore_ascii_case(bytes: &[u8], idx: usize, pattern: &[u8]) -> bool {
    bytes
        .get(idx..idx + pattern.len())
        .is_some_and(|window| window.eq_ignore_ascii_case(pattern))
}

fn find_subslice(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

fn find_byte(bytes: &[u8], from: usize, byte: u8) -> Option<usize> {
    bytes
        .get(from..)?
        .iter()
        .position(|candidate| *candidate == byte)
        .map(|offset| from + offset)
}
