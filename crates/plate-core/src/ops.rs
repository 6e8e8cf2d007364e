use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::core::{BlockKind, Marks, Node, NodeId, Selection};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    InsertText {
        node: NodeId,
        offset: usize,
        text: String,
    },
    RemoveText {
        node: NodeId,
        range: Range<usize>,
    },
    InsertNode {
        parent: NodeId,
        index: usize,
        node: Node,
    },
    RemoveNode {
        node: NodeId,
    },
    /// `index` is counted after `node` has been detached from its old parent.
    MoveNode {
        node: NodeId,
        parent: NodeId,
        index: usize,
    },
    SetBlockKind {
        node: NodeId,
        kind: BlockKind,
    },
    SetTextMarks {
        node: NodeId,
        marks: Marks,
    },
    /// Splits a text leaf at `offset`; the tail becomes a sibling leaf `new_id`
    /// carrying the same marks.
    SplitText {
        node: NodeId,
        offset: usize,
        new_id: NodeId,
    },
    /// Appends the text of `next` (the immediately following sibling leaf with
    /// equal marks) to `node` and removes `next`.
    MergeText {
        node: NodeId,
        next: NodeId,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Marks for text typed at the caret once this transaction lands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caret_marks: Option<Marks>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub ops: Vec<Op>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_after: Option<Selection>,
    #[serde(default)]
    pub meta: TransactionMeta,
}

impl Transaction {
    pub fn new(ops: Vec<Op>) -> Self {
        Self {
            ops,
            selection_after: None,
            meta: TransactionMeta::default(),
        }
    }

    pub fn selection_after(mut self, selection_after: Selection) -> Self {
        self.selection_after = Some(selection_after);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.meta.source = Some(source.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.selection_after.is_none()
    }
}
