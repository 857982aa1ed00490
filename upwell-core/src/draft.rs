//! Drafts: one independently editable copy of a document.
//!
//! A draft wraps a replica and keeps its own metadata inside it, so saving
//! the replica saves everything. Only the draft id travels outside, as the
//! container entry name.

use std::fmt;
use std::ops::Range;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value};

use crate::author::{Author, AuthorId, CommentId, DraftId};
use crate::block::{self, Block, BLOCK_SEPARATOR};
use crate::comments::{Comment, Comments, CommentsMut};
use crate::error::{ReplicaError, Result, UpwellError};
use crate::mark::{coalesce, Mark, MarkType};
use crate::replica::{Heads, OpRange, ReplicatedDoc, TextChange, YrsReplica};

/// Body text field.
pub const TEXT: &str = "text";
pub const TITLE: &str = "title";

const META: &str = "draft";
const CONTRIBUTORS: &str = "contributors";
/// Metadata that belongs to one draft and never travels with a merge.
const IDENTITY: [&str; 6] = [
    "parent_id",
    "author_id",
    "message",
    "created_at",
    "archived",
    "shared",
];

type Subscriber = Box<dyn FnMut(&Draft, &Heads) + Send>;

/// A checkpoint recorded by [`Draft::commit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub author: AuthorId,
    pub message: String,
    /// Unix time in milliseconds.
    pub at: u64,
}

pub struct Draft {
    id: DraftId,
    /// Who is editing this copy locally.
    author: Author,
    doc: Box<dyn ReplicatedDoc>,
    subscriber: Option<Subscriber>,
}

impl fmt::Debug for Draft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Draft")
            .field("id", &self.id)
            .field("message", &self.message())
            .field("author", &self.author.id)
            .finish_non_exhaustive()
    }
}

impl Draft {
    /// New draft with an empty body and title.
    pub fn create(message: &str, author: &Author) -> Result<Self> {
        Ok(Self::create_with(Box::new(YrsReplica::new()), message, author))
    }

    /// New draft on top of an existing, empty replica.
    pub fn create_with(doc: Box<dyn ReplicatedDoc>, message: &str, author: &Author) -> Self {
        let mut draft = Self {
            id: new_draft_id(author),
            author: author.clone(),
            doc,
            subscriber: None,
        };
        draft.doc.make_text(TEXT);
        draft.doc.make_text(TITLE);
        draft.init_metadata(message, author, None);
        draft
    }

    pub fn load(id: impl Into<DraftId>, bytes: &[u8], author: &Author) -> Result<Self> {
        Ok(Self::with_replica(id, Box::new(YrsReplica::load(bytes)?), author))
    }

    /// Wrap a replica that already holds a draft.
    pub fn with_replica(
        id: impl Into<DraftId>,
        doc: Box<dyn ReplicatedDoc>,
        author: &Author,
    ) -> Self {
        Self {
            id: id.into(),
            author: author.clone(),
            doc,
            subscriber: None,
        }
    }

    pub fn save(&self) -> Vec<u8> {
        self.doc.save()
    }

    /// Copy this draft's history into a new draft owned by `author`.
    pub fn fork(&self, message: &str, author: &Author) -> Result<Draft> {
        let mut fork = Draft {
            id: new_draft_id(author),
            author: author.clone(),
            doc: self.doc.fork()?,
            subscriber: None,
        };
        fork.init_metadata(message, author, Some(&self.id));
        Ok(fork)
    }

    fn init_metadata(&mut self, message: &str, author: &Author, parent: Option<&str>) {
        let parent = parent.map_or(Value::Null, Value::from);
        self.doc.put(META, "parent_id", &parent);
        self.doc.put(META, "author_id", &Value::from(author.id.as_str()));
        self.doc.put(META, "message", &Value::from(message));
        self.doc.put(META, "created_at", &Value::from(now_millis()));
        self.doc.put(META, "archived", &Value::Bool(false));
        self.doc.put(META, "shared", &Value::Bool(false));
        self.add_contributor(author);
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The local author editing this copy.
    pub fn author(&self) -> &Author {
        &self.author
    }

    pub fn set_author(&mut self, author: &Author) {
        self.author = author.clone();
    }

    fn meta_str(&self, key: &str) -> Option<String> {
        self.doc
            .get(META, key)
            .and_then(|value| value.as_str().map(str::to_string))
    }

    fn meta_bool(&self, key: &str) -> bool {
        self.doc
            .get(META, key)
            .and_then(|value| value.as_bool())
            .unwrap_or(false)
    }

    pub fn parent_id(&self) -> Option<DraftId> {
        self.meta_str("parent_id")
    }

    pub fn set_parent_id(&mut self, parent: &str) {
        self.doc.put(META, "parent_id", &Value::from(parent));
    }

    /// Author that created this draft.
    pub fn author_id(&self) -> AuthorId {
        self.meta_str("author_id").unwrap_or_default()
    }

    pub fn message(&self) -> String {
        self.meta_str("message").unwrap_or_default()
    }

    pub fn set_message(&mut self, message: &str) {
        self.doc.put(META, "message", &Value::from(message));
    }

    pub fn created_at(&self) -> u64 {
        self.doc
            .get(META, "created_at")
            .and_then(|value| value.as_u64())
            .unwrap_or_default()
    }

    pub fn archived(&self) -> bool {
        self.meta_bool("archived")
    }

    pub fn set_archived(&mut self, archived: bool) {
        self.doc.put(META, "archived", &Value::Bool(archived));
    }

    pub fn shared(&self) -> bool {
        self.meta_bool("shared")
    }

    pub fn set_shared(&mut self, shared: bool) {
        self.doc.put(META, "shared", &Value::Bool(shared));
    }

    pub fn contributors(&self) -> Vec<Author> {
        let mut authors: Vec<Author> = self
            .doc
            .materialize(CONTRIBUTORS)
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_value(value).ok())
            .collect();
        authors.sort_by(|a, b| a.id.cmp(&b.id));
        authors
    }

    pub fn add_contributor(&mut self, author: &Author) {
        if self.doc.get(CONTRIBUTORS, &author.id).is_none() {
            self.doc
                .put(CONTRIBUTORS, &author.id, &json!({"id": author.id, "name": author.name}));
        }
    }

    // ─── Text ─────────────────────────────────────────────────────────

    pub fn text(&self) -> String {
        self.doc.text(TEXT)
    }

    pub fn title(&self) -> String {
        self.doc.text(TITLE)
    }

    pub fn set_title(&mut self, title: &str) -> Result<()> {
        let len = self.len_of(TITLE)?;
        self.doc.splice(TITLE, 0, len, title);
        Ok(())
    }

    /// Body as of an earlier frontier.
    pub fn text_at(&self, heads: &Heads) -> Result<String> {
        self.require_text(TEXT)?;
        Ok(self.doc.text_at(TEXT, heads)?)
    }

    pub fn require_text(&self, field: &str) -> Result<()> {
        if self.doc.is_text(field) {
            Ok(())
        } else {
            Err(UpwellError::UninitializedField(field.to_string()))
        }
    }

    fn len_of(&self, field: &str) -> Result<usize> {
        self.require_text(field)?;
        Ok(self.doc.text(field).chars().count())
    }

    fn check_range(&self, field: &str, range: &Range<usize>) -> Result<()> {
        let len = self.len_of(field)?;
        if range.start > range.end || range.end > len {
            return Err(UpwellError::InvalidRange {
                start: range.start,
                end: range.end,
                len,
            });
        }
        Ok(())
    }

    pub fn insert_at(&mut self, pos: usize, text: &str) -> Result<()> {
        self.splice_field(TEXT, pos, 0, text)
    }

    pub fn delete_at(&mut self, pos: usize, count: usize) -> Result<()> {
        self.splice_field(TEXT, pos, count, "")
    }

    /// Replace `delete` characters at `pos` in any text field.
    pub fn splice_field(
        &mut self,
        field: &str,
        pos: usize,
        delete: usize,
        text: &str,
    ) -> Result<()> {
        let Some(end) = pos.checked_add(delete) else {
            return Err(UpwellError::InvalidRange {
                start: pos,
                end: usize::MAX,
                len: self.len_of(field)?,
            });
        };
        self.check_range(field, &(pos..end))?;
        self.doc.splice(field, pos, delete, text);
        Ok(())
    }

    // ─── Marks ────────────────────────────────────────────────────────

    pub fn mark(
        &mut self,
        name: impl Into<MarkType>,
        range: Range<usize>,
        value: Value,
    ) -> Result<()> {
        self.check_range(TEXT, &range)?;
        let kind = name.into();
        self.doc.mark(TEXT, range, kind.as_str(), &value);
        Ok(())
    }

    /// Marks with formatting runs coalesced. Block metadata is left out.
    pub fn marks(&self) -> Result<Vec<Mark>> {
        let marks = self
            .raw_marks()?
            .into_iter()
            .filter(|mark| mark.kind != MarkType::Block)
            .collect();
        Ok(coalesce(marks))
    }

    pub fn raw_marks(&self) -> Result<Vec<Mark>> {
        self.require_text(TEXT)?;
        Ok(self.doc.raw_spans(TEXT)?)
    }

    // ─── Blocks ───────────────────────────────────────────────────────

    /// Block structure of the body. An empty body gets one paragraph first.
    pub fn blocks(&mut self) -> Result<Vec<Block>> {
        if self.len_of(TEXT)? == 0 {
            self.insert_block(0, block::DEFAULT_BLOCK)?;
        }
        let marks = self.doc.raw_spans(TEXT)?;
        Ok(block::scan(&self.text(), &marks))
    }

    /// Start a new block of type `kind` at `pos`.
    pub fn insert_block(&mut self, pos: usize, kind: &str) -> Result<()> {
        self.splice_field(TEXT, pos, 0, &BLOCK_SEPARATOR.to_string())?;
        let value = block::block_value(kind, JsonMap::new());
        self.doc.mark(TEXT, pos..pos + 1, MarkType::Block.as_str(), &value);
        Ok(())
    }

    /// Replace the metadata of the block whose separator sits at `separator`.
    pub fn set_block(
        &mut self,
        separator: usize,
        kind: &str,
        attributes: JsonMap<String, Value>,
    ) -> Result<()> {
        let is_separator = self.text().chars().nth(separator) == Some(BLOCK_SEPARATOR);
        if !is_separator {
            return Err(UpwellError::InvalidRange {
                start: separator,
                end: separator + 1,
                len: self.len_of(TEXT)?,
            });
        }
        let value = block::block_value(kind, attributes);
        let range = separator..separator + 1;
        self.doc.unmark(TEXT, range.clone(), MarkType::Block.as_str());
        self.doc.mark(TEXT, range, MarkType::Block.as_str(), &value);
        Ok(())
    }

    /// Set one attribute on the block at `separator`, keeping its type.
    pub fn set_block_attribute(&mut self, separator: usize, key: &str, value: Value) -> Result<()> {
        let current = self
            .blocks()?
            .into_iter()
            .find(|block| block.start == separator + 1);
        let (kind, mut attributes) = match current {
            Some(block) => (block.kind, block.attributes),
            None => (block::DEFAULT_BLOCK.to_string(), JsonMap::new()),
        };
        attributes.insert(key.to_string(), value);
        self.set_block(separator, &kind, attributes)
    }

    // ─── Comments ─────────────────────────────────────────────────────

    /// Open a comment thread over `range`.
    pub fn insert_comment(
        &mut self,
        range: Range<usize>,
        message: &str,
        author: &str,
    ) -> Result<CommentId> {
        self.check_range(TEXT, &range)?;
        let id = self.comments_mut().insert(author, message)?;
        self.doc
            .mark(TEXT, range, MarkType::Comment.as_str(), &Value::from(id.as_str()));
        Ok(id)
    }

    pub fn comments(&self) -> Comments<'_> {
        Comments::new(self.doc.as_ref())
    }

    pub fn comments_mut(&mut self) -> CommentsMut<'_> {
        CommentsMut::new(self.doc.as_mut())
    }

    pub fn comment(&self, id: &str) -> Option<Comment> {
        self.comments().get(id)
    }

    pub fn reply_to_comment(
        &mut self,
        parent: &str,
        message: &str,
        author: &str,
    ) -> Result<CommentId> {
        self.comments_mut().add_child(parent, author, message)
    }

    pub fn resolve_comment(&mut self, id: &str) -> Result<()> {
        self.comments_mut().resolve(id)
    }

    // ─── History ──────────────────────────────────────────────────────

    pub fn heads(&self) -> Heads {
        self.doc.heads()
    }

    /// Record a checkpoint and tell the subscriber.
    pub fn commit(&mut self, message: &str) -> Heads {
        let metadata = json!({
            "author": self.author.id,
            "message": message,
            "at": now_millis(),
        });
        let heads = self.doc.commit(&metadata);
        self.notify_subscriber();
        heads
    }

    pub fn history(&self) -> Vec<Commit> {
        self.doc
            .commits()
            .into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect()
    }

    /// Fold `other`'s history into this draft.
    pub fn merge(&mut self, other: &Draft) -> Result<Vec<OpRange>> {
        let ops = self.fold(other, |doc, other| doc.merge(other))?;
        self.notify_subscriber();
        Ok(ops)
    }

    /// Fold `other` in and report what changed in the body.
    pub(crate) fn merge_observed(&mut self, other: &Draft) -> Result<Vec<TextChange>> {
        other.require_text(TEXT)?;
        let changes = self.fold(other, |doc, other| doc.merge_observed(other, TEXT))?;
        self.notify_subscriber();
        Ok(changes)
    }

    /// Pull `other`'s changes in quietly, without notifying the subscriber.
    pub fn update_to(&mut self, other: &Draft) -> Result<Vec<OpRange>> {
        self.fold(other, |doc, other| doc.merge(other))
    }

    /// Run a merge of `other` into this replica. When `other` is a different
    /// draft its concurrent identity writes are overridden by ours.
    fn fold<T>(
        &mut self,
        other: &Draft,
        merge: impl FnOnce(&mut dyn ReplicatedDoc, &dyn ReplicatedDoc) -> Result<T, ReplicaError>,
    ) -> Result<T> {
        let saved: Vec<(&str, Value)> = if other.id == self.id {
            Vec::new()
        } else {
            IDENTITY
                .iter()
                .filter_map(|key| self.doc.get(META, key).map(|value| (*key, value)))
                .collect()
        };
        let out = merge(self.doc.as_mut(), other.doc.as_ref())?;
        for (key, value) in saved {
            if self.doc.get(META, key).as_ref() != Some(&value) {
                self.doc.put(META, key, &value);
            }
        }
        Ok(out)
    }

    /// Apply raw changes produced by another copy of this draft.
    pub fn apply_changes(&mut self, changes: &[u8]) -> Result<Vec<OpRange>> {
        let ops = self.doc.apply_changes(changes)?;
        self.notify_subscriber();
        Ok(ops)
    }

    pub fn changes_since(&self, heads: &Heads) -> Result<Vec<u8>> {
        Ok(self.doc.changes_since(heads)?)
    }

    /// Body changes between two frontiers, positioned in the text at `to`.
    pub fn diff_between(&self, from: &Heads, to: &Heads) -> Result<Vec<TextChange>> {
        self.require_text(TEXT)?;
        Ok(self.doc.diff_between(TEXT, from, to)?)
    }

    pub fn replica(&self) -> &dyn ReplicatedDoc {
        self.doc.as_ref()
    }

    pub fn replica_mut(&mut self) -> &mut dyn ReplicatedDoc {
        self.doc.as_mut()
    }

    // ─── Subscriber ───────────────────────────────────────────────────

    /// Install the single change listener, replacing any previous one.
    pub fn subscribe<F>(&mut self, subscriber: F)
    where
        F: FnMut(&Draft, &Heads) + Send + 'static,
    {
        self.subscriber = Some(Box::new(subscriber));
    }

    pub fn unsubscribe(&mut self) {
        self.subscriber = None;
    }

    /// Call the subscriber with the current heads. It must not re-enter
    /// `commit` or `merge` on this draft.
    pub fn notify_subscriber(&mut self) {
        let Some(mut subscriber) = self.subscriber.take() else {
            return;
        };
        let heads = self.heads();
        subscriber(self, &heads);
        if self.subscriber.is_none() {
            self.subscriber = Some(subscriber);
        }
    }
}

fn new_draft_id(author: &Author) -> DraftId {
    format!("{}-{}", author.id, uuid::Uuid::new_v4().simple())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
