//! Merge-with-attribution.
//!
//! The base draft is forked under the synthetic merge author, then each
//! candidate is folded into the fork in order. The text changes each fold
//! produces become `insert` and `delete` marks carrying the candidate's
//! author, so the result shows who wrote what.

use serde_json::json;

use crate::author::Author;
use crate::draft::{Draft, TEXT};
use crate::error::Result;
use crate::mark::{Mark, MarkType};
use crate::replica::{Heads, TextChange};

/// Output of [`merge_with_edits`].
#[derive(Debug)]
pub struct Merged {
    /// Fork of the base holding every candidate's changes and their marks.
    pub draft: Draft,
    /// Frontier of the fork before any candidate was folded in.
    pub orig_heads: Heads,
    /// One list per candidate, positioned in the final merged text.
    pub attribution: Vec<Vec<Mark>>,
}

impl Merged {
    /// All attribution marks in one list, ordered by position.
    pub fn flatten(&self) -> Vec<Mark> {
        let mut marks: Vec<Mark> = self.attribution.iter().flatten().cloned().collect();
        marks.sort_by_key(|mark| (mark.start, mark.end));
        marks
    }
}

/// Fold `candidates` into a fork of `base` and attribute every change.
///
/// Inputs are left untouched. Fails only when an input lacks its text field.
pub fn merge_with_edits(base: &Draft, candidates: &[&Draft]) -> Result<Merged> {
    base.require_text(TEXT)?;
    for candidate in candidates {
        candidate.require_text(TEXT)?;
    }

    let mut draft = base.fork("Merge", &Author::merge())?;
    let orig_heads = draft.heads();
    let mut attribution: Vec<Vec<Mark>> = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let changes = draft.merge_observed(candidate)?;
        log::debug!(
            "merged {} into {}: {} text changes",
            candidate.id(),
            draft.id(),
            changes.len()
        );

        // Earlier reports were positioned before this fold.
        for marks in attribution.iter_mut() {
            for mark in marks.iter_mut() {
                for change in &changes {
                    shift(mark, change);
                }
            }
        }

        let author = candidate.author_id();
        let mut marks = Vec::with_capacity(changes.len());
        for change in &changes {
            let mark = to_mark(&author, change);
            draft.mark(mark.kind.clone(), mark.start..mark.end, mark.value.clone())?;
            marks.push(mark);
        }
        attribution.push(marks);
    }

    draft.commit("Merge");
    Ok(Merged {
        draft,
        orig_heads,
        attribution,
    })
}

fn to_mark(author: &str, change: &TextChange) -> Mark {
    match change {
        TextChange::Insert { start, end, text } => Mark::new(
            MarkType::Insert,
            *start,
            *end,
            json!({ "author": author, "text": text }),
        ),
        TextChange::Delete { pos, text } => Mark::new(
            MarkType::Delete,
            *pos,
            *pos,
            json!({ "author": author, "text": text }),
        ),
    }
}

/// Move `mark` the way its stored anchors move under `change`.
///
/// Non-empty marks grow with text inserted at their start but not at their
/// end. Zero-width marks keep their place when text is inserted on them.
fn shift(mark: &mut Mark, change: &TextChange) {
    match change {
        TextChange::Insert { start, end, .. } => {
            let at = *start;
            let n = end - start;
            if mark.is_empty() {
                if at < mark.start {
                    mark.start += n;
                    mark.end += n;
                }
            } else {
                if at <= mark.start {
                    mark.start += n;
                }
                if at < mark.end {
                    mark.end += n;
                }
            }
        }
        TextChange::Delete { pos, text } => {
            let at = *pos;
            let n = text.chars().count();
            let map = |x: usize| {
                if x <= at {
                    x
                } else if x >= at + n {
                    x - n
                } else {
                    at
                }
            };
            mark.start = map(mark.start);
            mark.end = map(mark.end).max(mark.start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(id: &str) -> Author {
        Author::new(id, id.to_uppercase())
    }

    fn base_with(text: &str) -> Draft {
        let mut base = Draft::create("base", &author("ana")).unwrap();
        base.insert_at(0, text).unwrap();
        base
    }

    fn chars_covered_by(marks: &[Mark], at: usize) -> Vec<&Mark> {
        marks
            .iter()
            .filter(|m| m.kind == MarkType::Insert && m.start <= at && at < m.end)
            .collect()
    }

    #[test]
    fn test_single_insert_attributed() {
        let base = base_with("Hello world");
        let mut bo = base.fork("bo", &author("bo")).unwrap();
        bo.insert_at(5, ", dear").unwrap();

        let merged = merge_with_edits(&base, &[&bo]).unwrap();
        assert_eq!(merged.draft.text(), "Hello, dear world");
        assert_eq!(merged.attribution.len(), 1);

        let inserts: Vec<_> = merged.attribution[0]
            .iter()
            .filter(|m| m.kind == MarkType::Insert)
            .collect();
        assert_eq!(inserts.len(), 1);
        assert_eq!((inserts[0].start, inserts[0].end), (5, 11));
        assert_eq!(inserts[0].author(), Some("bo"));
        assert_eq!(inserts[0].text(), Some(", dear"));
    }

    #[test]
    fn test_delete_is_zero_width_with_text() {
        let base = base_with("keep this gone");
        let mut bo = base.fork("bo", &author("bo")).unwrap();
        bo.delete_at(9, 5).unwrap();

        let merged = merge_with_edits(&base, &[&bo]).unwrap();
        assert_eq!(merged.draft.text(), "keep this");
        let deletes: Vec<_> = merged
            .flatten()
            .into_iter()
            .filter(|m| m.kind == MarkType::Delete)
            .collect();
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].is_empty());
        assert_eq!(deletes[0].start, 9);
        assert_eq!(deletes[0].text(), Some(" gone"));
    }

    #[test]
    fn test_inputs_untouched() {
        let base = base_with("abc");
        let mut bo = base.fork("bo", &author("bo")).unwrap();
        bo.insert_at(3, "def").unwrap();
        let base_heads = base.heads();

        let merged = merge_with_edits(&base, &[&bo]).unwrap();
        assert_eq!(base.text(), "abc");
        assert!(base.replica().same_heads(&base_heads, &base.heads()));
        assert_eq!(bo.text(), "abcdef");
        assert_eq!(merged.draft.author_id(), "merge");
        assert_eq!(merged.draft.parent_id().as_deref(), Some(base.id()));
        assert_eq!(merged.draft.text_at(&merged.orig_heads).unwrap(), "abc");
    }

    #[test]
    fn test_two_candidates_cover_every_new_char() {
        let base = base_with("The cat sat.");
        let mut bo = base.fork("bo", &author("bo")).unwrap();
        bo.insert_at(4, "big ").unwrap();
        let mut cy = base.fork("cy", &author("cy")).unwrap();
        cy.insert_at(11, " down").unwrap();
        cy.delete_at(0, 4).unwrap();

        let merged = merge_with_edits(&base, &[&bo, &cy]).unwrap();
        let text = merged.draft.text();
        assert_eq!(text, "big cat sat down.");
        assert_eq!(merged.attribution.len(), 2);

        let flat = merged.flatten();
        for (at, expected) in [(0, "bo"), (3, "bo"), (11, "cy"), (15, "cy")] {
            let covering = chars_covered_by(&flat, at);
            assert_eq!(covering.len(), 1, "char {at} of {text:?}");
            assert_eq!(covering[0].author(), Some(expected));
        }
        for at in [4, 8, 16] {
            assert!(chars_covered_by(&flat, at).is_empty(), "char {at} is original");
        }

        let deletes: Vec<_> = flat.iter().filter(|m| m.kind == MarkType::Delete).collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].author(), Some("cy"));
        assert_eq!(deletes[0].text(), Some("The "));
    }

    #[test]
    fn test_marks_stored_on_draft_match_report() {
        let base = base_with("one two");
        let mut bo = base.fork("bo", &author("bo")).unwrap();
        bo.insert_at(3, " and a half").unwrap();
        let mut cy = base.fork("cy", &author("cy")).unwrap();
        cy.insert_at(0, "zero ").unwrap();

        let merged = merge_with_edits(&base, &[&bo, &cy]).unwrap();
        let stored: Vec<Mark> = merged
            .draft
            .marks()
            .unwrap()
            .into_iter()
            .filter(|m| m.kind == MarkType::Insert)
            .collect();
        let reported: Vec<Mark> = merged
            .flatten()
            .into_iter()
            .filter(|m| m.kind == MarkType::Insert)
            .collect();
        assert_eq!(stored, reported);
    }

    #[test]
    fn test_candidate_comments_carried_into_merge() {
        let base = base_with("needs review");
        let mut bo = base.fork("bo", &author("bo")).unwrap();
        let id = bo.insert_comment(0..5, "which part?", "bo").unwrap();

        let merged = merge_with_edits(&base, &[&bo]).unwrap();
        assert_eq!(merged.draft.text(), "needs review");
        assert!(merged.attribution[0].is_empty());
        assert_eq!(merged.draft.comments().get(&id).unwrap().message, "which part?");

        let comments: Vec<Mark> = merged
            .draft
            .marks()
            .unwrap()
            .into_iter()
            .filter(|m| m.kind == MarkType::Comment)
            .collect();
        assert_eq!(comments.len(), 1);
        assert_eq!((comments[0].start, comments[0].end), (0, 5));
    }

    #[test]
    fn test_missing_text_field() {
        let base = base_with("x");
        let bare = Draft::with_replica(
            "bare",
            Box::new(crate::replica::YrsReplica::new()),
            &author("bo"),
        );
        assert!(matches!(
            merge_with_edits(&base, &[&bare]),
            Err(crate::UpwellError::UninitializedField(_))
        ));
    }

    #[test]
    fn test_shift_rules() {
        let mut span = Mark::new(MarkType::Insert, 2, 5, json!({}));
        shift(
            &mut span,
            &TextChange::Insert { start: 5, end: 7, text: "xx".into() },
        );
        assert_eq!((span.start, span.end), (2, 5));
        shift(
            &mut span,
            &TextChange::Insert { start: 2, end: 3, text: "y".into() },
        );
        assert_eq!((span.start, span.end), (3, 6));

        let mut point = Mark::new(MarkType::Delete, 4, 4, json!({}));
        shift(
            &mut point,
            &TextChange::Insert { start: 4, end: 6, text: "zz".into() },
        );
        assert_eq!((point.start, point.end), (4, 4));
        shift(&mut point, &TextChange::Delete { pos: 1, text: "abcdef".into() });
        assert_eq!((point.start, point.end), (1, 1));
    }
}
