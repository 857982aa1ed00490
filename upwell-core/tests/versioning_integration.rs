//! Versioning integration tests.
//!
//! Verifies:
//! - Typing sequences replay to the same text as a plain string
//! - Fork and merge through a family keep every author's work
//! - Attribution covers every new character exactly once
//! - Archived drafts stay unparsed across serialize/deserialize
//! - Attribution marks survive a container round trip

use upwell_core::{merge_with_edits, Author, Draft, Mark, MarkType, Upwell, UpwellError};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn author(id: &str) -> Author {
    Author::new(id, format!("{id} (test)"))
}

/// Indices of `merged` holding characters that were not kept from `base`.
/// `base` must survive as a subsequence of `merged`.
fn new_char_indices(base: &str, merged: &str) -> Vec<usize> {
    let base: Vec<char> = base.chars().collect();
    let mut next = 0;
    merged
        .chars()
        .enumerate()
        .filter_map(|(i, c)| {
            if next < base.len() && base[next] == c {
                next += 1;
                None
            } else {
                Some(i)
            }
        })
        .collect()
}

fn inserts_covering(marks: &[Mark], at: usize) -> Vec<&Mark> {
    marks
        .iter()
        .filter(|m| m.kind == MarkType::Insert && m.start <= at && at < m.end)
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[test]
fn test_hello_to_hola() {
    let mut draft = Draft::create("greeting", &author("ana")).unwrap();
    for (i, c) in ["H", "e", "l", "l", "o"].iter().enumerate() {
        draft.insert_at(i, c).unwrap();
    }
    draft.commit("hello");
    assert_eq!(draft.text(), "Hello");

    draft.delete_at(4, 1).unwrap();
    draft.delete_at(2, 2).unwrap();
    draft.delete_at(1, 1).unwrap();
    draft.insert_at(1, "o").unwrap();
    draft.insert_at(2, "l").unwrap();
    draft.insert_at(3, "a").unwrap();
    draft.commit("hola");
    assert_eq!(draft.text(), "Hola");

    let loaded = Draft::load(draft.id(), &draft.save(), &author("ana")).unwrap();
    assert_eq!(loaded.text(), "Hola");
    assert_eq!(loaded.history().len(), 2);
}

#[test]
fn test_family_fork_edit_merge() {
    let ana = author("ana");
    let mut upwell = Upwell::create(&ana).unwrap();
    upwell
        .root()
        .unwrap()
        .insert_at(0, "It was a dark and stormy night.")
        .unwrap();

    let bo_id = upwell.create_draft("bo's edit").unwrap().id().to_string();
    let cy_id = upwell.create_draft("cy's edit").unwrap().id().to_string();

    {
        let bo = upwell.get(&bo_id).unwrap();
        bo.insert_at(30, " in November").unwrap();
    }
    {
        let cy = upwell.get(&cy_id).unwrap();
        cy.delete_at(18, 6).unwrap();
        cy.insert_at(18, "clear").unwrap();
    }

    let mut bo = Draft::load(bo_id.as_str(), &upwell.get(&bo_id).unwrap().save(), &ana).unwrap();
    let cy = Draft::load(cy_id.as_str(), &upwell.get(&cy_id).unwrap().save(), &ana).unwrap();
    bo.merge(&cy).unwrap();
    assert_eq!(bo.text(), "It was a dark and clear night in November.");
    assert_eq!(bo.message(), "bo's edit");
}

#[test]
fn test_attribution_covers_new_text() {
    let ana = author("ana");
    let bo = author("bo");
    let cy = author("cy");

    let mut base = Draft::create("base", &ana).unwrap();
    base.insert_at(0, "The quick fox jumps over the dog.").unwrap();
    let original = base.text();

    let mut bo_draft = base.fork("bo", &bo).unwrap();
    bo_draft.insert_at(10, "brown ").unwrap();
    let mut cy_draft = base.fork("cy", &cy).unwrap();
    cy_draft.insert_at(29, "lazy ").unwrap();
    cy_draft.delete_at(4, 6).unwrap();

    let merged = merge_with_edits(&base, &[&bo_draft, &cy_draft]).unwrap();
    let text = merged.draft.text();
    assert_eq!(text, "The brown fox jumps over the lazy dog.");

    let marks = merged.flatten();
    let remaining_base: String = original.replace("quick ", "");
    for at in new_char_indices(&remaining_base, &text) {
        let covering = inserts_covering(&marks, at);
        assert_eq!(covering.len(), 1, "char {at} in {text:?}");
        let expected = if at < 10 { "bo" } else { "cy" };
        assert_eq!(covering[0].author(), Some(expected));
    }

    let deletes: Vec<&Mark> = marks.iter().filter(|m| m.kind == MarkType::Delete).collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].text(), Some("quick "));
    assert_eq!(deletes[0].author(), Some("cy"));

    // Base and candidates are untouched.
    assert_eq!(base.text(), original);
    assert_eq!(bo_draft.text(), "The quick brown fox jumps over the dog.");
}

#[test]
fn test_attribution_survives_container() {
    let ana = author("ana");
    let mut upwell = Upwell::create(&ana).unwrap();
    upwell.root().unwrap().insert_at(0, "abc").unwrap();
    let id = upwell.create_draft("edit").unwrap().id().to_string();
    upwell.get(&id).unwrap().insert_at(3, "def").unwrap();

    let root = Draft::load(upwell.root_id(), &upwell.root().unwrap().save(), &ana).unwrap();
    let edit = Draft::load(id.as_str(), &upwell.get(&id).unwrap().save(), &ana).unwrap();
    let merged = merge_with_edits(&root, &[&edit]).unwrap();
    let merged_id = merged.draft.id().to_string();
    upwell.add(merged.draft).unwrap();

    let bytes = upwell.serialize().unwrap();
    let mut loaded = Upwell::deserialize(&bytes, &author("bo")).unwrap();
    let draft = loaded.get(&merged_id).unwrap();
    let inserts: Vec<Mark> = draft
        .marks()
        .unwrap()
        .into_iter()
        .filter(|m| m.kind == MarkType::Insert)
        .collect();
    assert_eq!(inserts.len(), 1);
    assert_eq!((inserts[0].start, inserts[0].end), (3, 6));
    assert_eq!(inserts[0].author(), Some("ana"));
}

#[test]
fn test_lazy_archive_roundtrip() {
    let ana = author("ana");
    let mut upwell = Upwell::create(&ana).unwrap();
    let mut ids = Vec::new();
    for i in 0..10 {
        let draft = upwell.create_draft(&format!("draft {i}")).unwrap();
        draft.insert_at(0, &format!("body {i}")).unwrap();
        ids.push(draft.id().to_string());
    }
    let archived: Vec<String> = ids.iter().take(7).cloned().collect();
    for id in &archived {
        upwell.archive(id).unwrap();
    }

    let bytes = upwell.serialize().unwrap();
    let mut loaded = Upwell::deserialize(&bytes, &ana).unwrap();
    assert_eq!(loaded.drafts().len(), 11 - archived.len());
    assert!(archived.iter().all(|id| !loaded.is_hydrated(id)));
    assert_eq!(loaded.history().first(), archived.last());

    let body = loaded.get(&archived[3]).unwrap().text();
    assert_eq!(body, "body 3");
}

#[test]
fn test_unknown_draft_is_not_found() {
    let mut upwell = Upwell::create(&author("ana")).unwrap();
    assert!(matches!(upwell.get("missing"), Err(UpwellError::NotFound(_))));
    assert!(Upwell::deserialize(b"not a tar", &author("ana")).is_err());
}
