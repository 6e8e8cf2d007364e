//! Headless walkthrough of a note editing session.
//!
//! ```text
//! notebloc-story [NOTE.html] [--config CONFIG.json] [--script STEPS.json]
//! ```
//!
//! Loads the note (or a built-in sample), replays a script of user gestures
//! and prints what the host would receive.

mod script;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context as _, Result};
use clap::Parser;
use notebloc_plate_core::{InboundContent, NoteSession, SessionConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::script::Step;

pub const SAMPLE_NOTE: &str = concat!(
    "<p></p>",
    "<p>Pack snacks and water for the hike</p>",
    "<ul><li>trail map</li><li>sunscreen</li></ul>",
);

/// Replays a note editing session without a UI.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTML note to load; a built-in sample when omitted
    note: Option<PathBuf>,

    /// Session config JSON
    #[arg(long, env = "NOTEBLOC_CONFIG")]
    config: Option<PathBuf>,

    /// JSON list of steps to replay instead of the demo walkthrough
    #[arg(long)]
    script: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("notebloc_plate_core=info,notebloc_story=info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    let (document_id, html) = match &args.note {
        Some(path) => (
            path.display().to_string(),
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        ),
        None => ("sample".to_string(), SAMPLE_NOTE.to_string()),
    };
    let steps: Vec<Step> = match &args.script {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&source)
                .with_context(|| format!("invalid script {}", path.display()))?
        }
        None => script::demo(),
    };

    let start = Instant::now();
    let mut session = NoteSession::new(config);
    session.on_change(|html| info!(bytes = html.len(), "content changed"));
    session.set_inbound(
        InboundContent {
            initial_content: html,
            document_id,
        },
        start,
    );

    info!(steps = steps.len(), "replaying script");
    script::run(&mut session, &steps, start)?;

    println!("title: {}", session.title());
    println!("{}", session.html());
    for comment in session.comments().comments().iter() {
        let live = session
            .comments()
            .live_text(session.editor(), comment)
            .unwrap_or_default();
        println!("comment {}: {:?} on {:?}", comment.id, comment.body, live);
    }
    session.unmount();
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn note_and_flags_parse() {
        let args = Args::try_parse_from([
            "notebloc-story",
            "note.html",
            "--config=session.json",
            "--script",
            "steps.json",
        ])
        .unwrap();

        assert_eq!(args.note, Some(PathBuf::from("note.html")));
        assert_eq!(args.config, Some(PathBuf::from("session.json")));
        assert_eq!(args.script, Some(PathBuf::from("steps.json")));
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(Args::try_parse_from(["notebloc-story", "--verbose"]).is_err());
    }
}
