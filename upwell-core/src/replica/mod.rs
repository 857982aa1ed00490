//! The replicated document seam.
//!
//! Drafts and families never touch the CRDT engine directly. They hold a
//! `Box<dyn ReplicatedDoc>` and speak in character offsets, JSON values and
//! opaque [`Heads`]. [`YrsReplica`] is the engine-backed implementation.

mod yrs_doc;

use std::ops::Range;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::error::ReplicaError;
use crate::mark::Mark;

pub use yrs_doc::YrsReplica;

/// Opaque causal frontier of a replica.
///
/// Only the backend that produced a `Heads` can interpret it; compare two
/// frontiers with [`ReplicatedDoc::same_heads`] rather than `==`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Heads(pub(crate) Vec<u8>);

impl Heads {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The empty frontier, before any operation.
    pub fn is_origin(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-peer handshake state for incremental sync.
///
/// Create one with `PeerState::default()` on first contact with a peer and
/// drop it when the peer says goodbye.
#[derive(Debug, Clone, Default)]
pub struct PeerState {
    /// Last frontier the peer told us about.
    pub(crate) their_heads: Option<Heads>,
    /// Our frontier at the time of our last message to the peer.
    pub(crate) sent_heads: Option<Heads>,
    /// The peer is behind us or has not heard from us yet.
    pub(crate) reply_pending: bool,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the peer has sent at least one sync message.
    pub fn has_heard_from_peer(&self) -> bool {
        self.their_heads.is_some()
    }
}

/// A contiguous run of operations from one actor, `start..end` in its clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpRange {
    pub actor: u64,
    pub start: u32,
    pub end: u32,
}

impl OpRange {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// One text-level change, in character offsets of the resulting text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TextChange {
    /// `text` now occupies `start..end`.
    Insert { start: usize, end: usize, text: String },
    /// `text` was removed; `pos` is where it used to begin.
    Delete { pos: usize, text: String },
}

/// Operations a CRDT backend provides to drafts and families.
///
/// Positions are character offsets into the current text. Map and list
/// values are JSON. Everything returned stays valid after further merges.
pub trait ReplicatedDoc: Send {
    /// Full state, loadable by the same backend.
    fn save(&self) -> Vec<u8>;

    /// Copy of this state under a fresh actor.
    fn fork(&self) -> Result<Box<dyn ReplicatedDoc>, ReplicaError>;

    fn heads(&self) -> Heads;

    /// Whether two frontiers describe the same causal state.
    fn same_heads(&self, a: &Heads, b: &Heads) -> bool;

    // ─── Text fields ──────────────────────────────────────────────────

    /// Declare `field` as a text field. Idempotent.
    fn make_text(&mut self, field: &str);

    fn is_text(&self, field: &str) -> bool;

    fn text(&self, field: &str) -> String;

    /// Contents of `field` as of an earlier frontier.
    fn text_at(&self, field: &str, heads: &Heads) -> Result<String, ReplicaError>;

    /// Remove `delete` characters at `pos`, then insert `insert` there.
    /// Out of range positions are clamped.
    fn splice(&mut self, field: &str, pos: usize, delete: usize, insert: &str);

    /// Attach a half-open range annotation that follows concurrent edits.
    fn mark(&mut self, field: &str, range: Range<usize>, name: &str, value: &Value);

    /// Drop every `name` mark that covers exactly `range`. Returns how many went.
    fn unmark(&mut self, field: &str, range: Range<usize>, name: &str) -> usize;

    /// Every mark on `field`, resolved against the current text, uncoalesced.
    fn raw_spans(&self, field: &str) -> Result<Vec<Mark>, ReplicaError>;

    // ─── Maps and lists ───────────────────────────────────────────────

    fn get(&self, map: &str, key: &str) -> Option<Value>;

    fn put(&mut self, map: &str, key: &str, value: &Value);

    fn keys(&self, map: &str) -> Vec<String>;

    fn list(&self, name: &str) -> Vec<Value>;

    /// Insert into the list at `index`, clamped to its length.
    fn list_insert(&mut self, name: &str, index: usize, value: &Value);

    fn list_push(&mut self, name: &str, value: &Value) {
        let len = self.list(name).len();
        self.list_insert(name, len, value);
    }

    fn materialize(&self, map: &str) -> JsonMap<String, Value> {
        self.keys(map)
            .into_iter()
            .filter_map(|key| self.get(map, &key).map(|value| (key, value)))
            .collect()
    }

    // ─── History ──────────────────────────────────────────────────────

    /// Record a checkpoint carrying `metadata` and return the new frontier.
    fn commit(&mut self, metadata: &Value) -> Heads;

    /// Checkpoints recorded by [`commit`](Self::commit), oldest first.
    fn commits(&self) -> Vec<Value>;

    /// Changes a replica at `heads` is missing.
    fn changes_since(&self, heads: &Heads) -> Result<Vec<u8>, ReplicaError>;

    fn apply_changes(&mut self, changes: &[u8]) -> Result<Vec<OpRange>, ReplicaError>;

    /// Apply `changes` and report what they did to `field`.
    fn apply_changes_observed(
        &mut self,
        field: &str,
        changes: &[u8],
    ) -> Result<Vec<TextChange>, ReplicaError>;

    /// Fold another replica's history into this one.
    fn merge(&mut self, other: &dyn ReplicatedDoc) -> Result<Vec<OpRange>, ReplicaError> {
        let changes = other.changes_since(&self.heads())?;
        self.apply_changes(&changes)
    }

    /// Fold another replica in and report the resulting changes to `field`,
    /// positioned in the merged text.
    fn merge_observed(
        &mut self,
        other: &dyn ReplicatedDoc,
        field: &str,
    ) -> Result<Vec<TextChange>, ReplicaError> {
        let changes = other.changes_since(&self.heads())?;
        self.apply_changes_observed(field, &changes)
    }

    /// Changes to `field` between two frontiers, positioned in the text at `to`.
    fn diff_between(
        &self,
        field: &str,
        from: &Heads,
        to: &Heads,
    ) -> Result<Vec<TextChange>, ReplicaError>;

    // ─── Sync ─────────────────────────────────────────────────────────

    /// Next message for a peer, or `None` when there is nothing to say.
    fn generate_sync_message(&self, peer: &mut PeerState) -> Result<Option<Vec<u8>>, ReplicaError>;

    /// Consume a peer's message and return the operations it introduced.
    fn receive_sync_message(
        &mut self,
        peer: &mut PeerState,
        message: &[u8],
    ) -> Result<Vec<OpRange>, ReplicaError>;
}
