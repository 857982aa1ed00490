//! Block structure derived from separator characters in the text.
//!
//! A block starts at a U+FFFC separator and runs to the next one. Text
//! before the first separator forms an implicit paragraph. A block's type
//! and attributes come from the last `block` mark over its separator.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::mark::{Mark, MarkType};

pub const BLOCK_SEPARATOR: char = '\u{FFFC}';

pub const DEFAULT_BLOCK: &str = "paragraph";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: JsonMap<String, Value>,
    /// First content character, just past the separator.
    pub start: usize,
    /// End of the content, exclusive.
    pub end: usize,
}

/// Value stored on a `block` mark.
pub(crate) fn block_value(kind: &str, attributes: JsonMap<String, Value>) -> Value {
    serde_json::json!({ "type": kind, "attributes": attributes })
}

pub(crate) fn scan(text: &str, marks: &[Mark]) -> Vec<Block> {
    let separators: Vec<usize> = text
        .chars()
        .enumerate()
        .filter(|(_, c)| *c == BLOCK_SEPARATOR)
        .map(|(index, _)| index)
        .collect();
    let len = text.chars().count();

    let mut blocks = Vec::with_capacity(separators.len() + 1);
    let first = separators.first().copied().unwrap_or(len);
    if first > 0 {
        blocks.push(Block {
            kind: DEFAULT_BLOCK.to_string(),
            attributes: JsonMap::new(),
            start: 0,
            end: first,
        });
    }

    for (i, &at) in separators.iter().enumerate() {
        let end = separators.get(i + 1).copied().unwrap_or(len);
        let metadata = marks
            .iter()
            .rev()
            .find(|mark| mark.kind == MarkType::Block && mark.start == at);
        let kind = metadata
            .and_then(|mark| mark.value.get("type"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_BLOCK)
            .to_string();
        let attributes = metadata
            .and_then(|mark| mark.value.get("attributes"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        blocks.push(Block {
            kind,
            attributes,
            start: at + 1,
            end,
        });
    }
    blocks
}
