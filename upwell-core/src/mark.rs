//! Range annotations over draft text.
//!
//! All ranges are half-open `[start, end)` in characters. Deletions are
//! zero-width marks sitting where the removed text used to be.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MarkType {
    Insert,
    Delete,
    Retain,
    Strong,
    Italic,
    Comment,
    /// Structural metadata over a block separator.
    Block,
    Other(String),
}

impl MarkType {
    pub fn as_str(&self) -> &str {
        match self {
            MarkType::Insert => "insert",
            MarkType::Delete => "delete",
            MarkType::Retain => "retain",
            MarkType::Strong => "strong",
            MarkType::Italic => "italic",
            MarkType::Comment => "comment",
            MarkType::Block => "block",
            MarkType::Other(name) => name,
        }
    }

    /// Formatting marks merge with their neighbours; attribution, comment
    /// and block marks keep their own identity.
    pub fn coalesces(&self) -> bool {
        !matches!(
            self,
            MarkType::Insert | MarkType::Delete | MarkType::Comment | MarkType::Block
        )
    }
}

impl From<&str> for MarkType {
    fn from(name: &str) -> Self {
        match name {
            "insert" => MarkType::Insert,
            "delete" => MarkType::Delete,
            "retain" => MarkType::Retain,
            "strong" => MarkType::Strong,
            "italic" => MarkType::Italic,
            "comment" => MarkType::Comment,
            "block" => MarkType::Block,
            other => MarkType::Other(other.to_string()),
        }
    }
}

impl From<String> for MarkType {
    fn from(name: String) -> Self {
        MarkType::from(name.as_str())
    }
}

impl From<MarkType> for String {
    fn from(kind: MarkType) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for MarkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub kind: MarkType,
    pub start: usize,
    pub end: usize,
    pub value: Value,
}

impl Mark {
    pub fn new(kind: impl Into<MarkType>, start: usize, end: usize, value: Value) -> Self {
        Self {
            kind: kind.into(),
            start,
            end,
            value,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Author recorded in an attribution payload.
    pub fn author(&self) -> Option<&str> {
        self.value.get("author").and_then(Value::as_str)
    }

    /// Text recorded in an attribution payload.
    pub fn text(&self) -> Option<&str> {
        self.value.get("text").and_then(Value::as_str)
    }
}

/// Merge overlapping or touching formatting marks that share a type and
/// value into maximal runs. Other marks pass through untouched.
pub fn coalesce(marks: Vec<Mark>) -> Vec<Mark> {
    let (mut runs, mut out): (Vec<Mark>, Vec<Mark>) =
        marks.into_iter().partition(|mark| mark.kind.coalesces());

    runs.sort_by(|a, b| {
        a.kind
            .as_str()
            .cmp(b.kind.as_str())
            .then(a.start.cmp(&b.start))
            .then(a.end.cmp(&b.end))
    });

    let mut merged: Vec<Mark> = Vec::with_capacity(runs.len());
    for mark in runs {
        // Runs with another value may sit in between.
        let open = merged.iter_mut().rev().find(|run| {
            run.kind == mark.kind && run.value == mark.value && mark.start <= run.end
        });
        match open {
            Some(run) => run.end = run.end.max(mark.end),
            None => merged.push(mark),
        }
    }

    out.extend(merged);
    out.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mark_type_names_roundtrip() {
        for name in ["insert", "delete", "strong", "italic", "comment", "block", "highlight"] {
            assert_eq!(MarkType::from(name).as_str(), name);
        }
        assert_eq!(MarkType::from("underline"), MarkType::Other("underline".into()));
    }

    #[test]
    fn test_coalesce_adjacent_strong() {
        let marks = vec![
            Mark::new("strong", 0, 3, json!(true)),
            Mark::new("strong", 3, 6, json!(true)),
            Mark::new("strong", 10, 12, json!(true)),
        ];
        let merged = coalesce(marks);
        assert_eq!(merged.len(), 2);
        assert_eq!((merged[0].start, merged[0].end), (0, 6));
        assert_eq!((merged[1].start, merged[1].end), (10, 12));
    }

    #[test]
    fn test_coalesce_overlapping_italic() {
        let marks = vec![
            Mark::new("italic", 2, 8, json!(true)),
            Mark::new("italic", 0, 4, json!(true)),
        ];
        let merged = coalesce(marks);
        assert_eq!(merged, vec![Mark::new("italic", 0, 8, json!(true))]);
    }

    #[test]
    fn test_coalesce_keeps_different_values_apart() {
        let marks = vec![
            Mark::new("strong", 0, 3, json!(true)),
            Mark::new("strong", 3, 6, json!(false)),
        ];
        assert_eq!(coalesce(marks).len(), 2);
    }

    #[test]
    fn test_coalesce_leaves_attribution_alone() {
        let marks = vec![
            Mark::new("insert", 0, 3, json!({"author": "a", "text": "abc"})),
            Mark::new("insert", 3, 6, json!({"author": "a", "text": "def"})),
            Mark::new("comment", 1, 2, json!("c1")),
            Mark::new("comment", 2, 4, json!("c1")),
        ];
        assert_eq!(coalesce(marks).len(), 4);
    }

    #[test]
    fn test_attribution_accessors() {
        let mark = Mark::new("delete", 4, 4, json!({"author": "ana", "text": "gone"}));
        assert!(mark.is_empty());
        assert_eq!(mark.author(), Some("ana"));
        assert_eq!(mark.text(), Some("gone"));
    }

    #[test]
    fn test_mark_serializes_type_field() {
        let mark = Mark::new("strong", 1, 2, json!(true));
        let encoded = serde_json::to_value(&mark).unwrap();
        assert_eq!(encoded["type"], "strong");
        let decoded: Mark = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, mark);
    }
}
