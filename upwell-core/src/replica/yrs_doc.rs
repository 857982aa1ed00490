//! [`ReplicatedDoc`] backed by a yrs document.
//!
//! Document layout:
//! - one root text per text field
//! - `schema` map: field name -> `"text"`
//! - `marks` map: mark id -> JSON record anchored with sticky indexes
//! - `commits` array: checkpoint metadata
//! - whatever other maps and arrays callers name
//!
//! Every value stored in a map or array is a JSON string. Updates use the V1
//! encoding; V2 loses deletes for client ids above 32 bits.

use std::ops::Range;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use yrs::types::Delta;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::{Encode, Encoder, EncoderV1};
use yrs::{
    Any, Array, Assoc, Doc, GetString, IndexedSequence, Map, Observable, OffsetKind, Options,
    MapRef, Out, ReadTxn, Snapshot, StateVector, StickyIndex, Text, Transact, Update, WriteTxn,
};

use super::{Heads, OpRange, PeerState, ReplicatedDoc, TextChange};
use crate::error::ReplicaError;
use crate::mark::Mark;

const SCHEMA: &str = "schema";
const MARKS: &str = "marks";
const COMMITS: &str = "commits";
const OBSERVER_KEY: &str = "upwell-observed-apply";

/// Stored form of a mark. Anchors are base64 encoded sticky indexes.
///
/// `seq` is one past the highest seq seen when the mark was made. Equal
/// seqs from concurrent marks are ordered by record key.
#[derive(Debug, Serialize, Deserialize)]
struct MarkRecord {
    field: String,
    name: String,
    value: Value,
    start: String,
    end: String,
    seq: u32,
}

/// Wire form of a sync message.
#[derive(Debug, Serialize, Deserialize)]
struct SyncPayload {
    heads: Vec<u8>,
    update: Option<Vec<u8>>,
}

/// Text delta step, lengths in bytes.
enum Step {
    Retain(usize),
    Insert(String),
    Embed,
    Delete(usize),
}

pub struct YrsReplica {
    doc: Doc,
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl YrsReplica {
    /// Empty replica under a fresh random client id.
    pub fn new() -> Self {
        Self {
            doc: Doc::with_options(Self::options()),
        }
    }

    pub fn load(bytes: &[u8]) -> Result<Self, ReplicaError> {
        let replica = Self::new();
        replica.apply_update(bytes)?;
        Ok(replica)
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    fn options() -> Options {
        Options {
            // Snapshot restore needs tombstones.
            skip_gc: true,
            offset_kind: OffsetKind::Bytes,
            ..Options::default()
        }
    }

    fn apply_update(&self, bytes: &[u8]) -> Result<(), ReplicaError> {
        let update = Update::decode_v1(bytes).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|e| ReplicaError::Apply(e.to_string()))
    }

    fn snapshot(&self) -> Snapshot {
        self.doc.transact().snapshot()
    }

    fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// State as of `snapshot`, encoded as a full update.
    fn encode_at(&self, snapshot: &Snapshot) -> Result<Vec<u8>, ReplicaError> {
        let mut encoder = EncoderV1::new();
        self.doc
            .transact()
            .encode_state_from_snapshot(snapshot, &mut encoder)
            .map_err(|e| ReplicaError::Encode(e.to_string()))?;
        Ok(encoder.to_vec())
    }

    fn restore(&self, heads: &Heads) -> Result<YrsReplica, ReplicaError> {
        if heads.is_origin() {
            return Ok(YrsReplica::new());
        }
        let update = self.encode_at(&decode_snapshot(heads)?)?;
        YrsReplica::load(&update)
    }

    /// Apply `update` while recording the deltas it produces on `field`.
    fn observe_apply(&self, field: &str, update: &[u8]) -> Result<Vec<TextChange>, ReplicaError> {
        let text = self.doc.get_or_insert_text(field);
        let before = text.get_string(&self.doc.transact());

        let steps: Arc<Mutex<Vec<Step>>> = Arc::default();
        let sink = steps.clone();
        text.observe_with(OBSERVER_KEY, move |txn, event| {
            let Ok(mut sink) = sink.lock() else {
                return;
            };
            for delta in event.delta(txn) {
                sink.push(match delta {
                    Delta::Retain(n, _) => Step::Retain(*n as usize),
                    Delta::Inserted(Out::Any(Any::String(s)), _) => Step::Insert(s.to_string()),
                    Delta::Inserted(_, _) => Step::Embed,
                    Delta::Deleted(n) => Step::Delete(*n as usize),
                });
            }
        });
        let applied = self.apply_update(update);
        text.unobserve(OBSERVER_KEY);
        applied?;

        let after = text.get_string(&self.doc.transact());
        let steps = steps
            .lock()
            .map(|mut steps| std::mem::take(&mut *steps))
            .unwrap_or_default();
        Ok(text_changes(&before, &after, &steps))
    }
}

impl ReplicatedDoc for YrsReplica {
    fn save(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn fork(&self) -> Result<Box<dyn ReplicatedDoc>, ReplicaError> {
        Ok(Box::new(YrsReplica::load(&self.save())?))
    }

    fn heads(&self) -> Heads {
        Heads(self.snapshot().encode_v1())
    }

    fn same_heads(&self, a: &Heads, b: &Heads) -> bool {
        match (decode_snapshot(a), decode_snapshot(b)) {
            (Ok(left), Ok(right)) => left == right,
            _ => a == b,
        }
    }

    fn make_text(&mut self, field: &str) {
        {
            let mut txn = self.doc.transact_mut();
            txn.get_or_insert_text(field);
        }
        if !self.is_text(field) {
            self.put(SCHEMA, field, &Value::from("text"));
        }
    }

    fn is_text(&self, field: &str) -> bool {
        self.get(SCHEMA, field)
            .is_some_and(|kind| kind.as_str() == Some("text"))
    }

    fn text(&self, field: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(field)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    fn text_at(&self, field: &str, heads: &Heads) -> Result<String, ReplicaError> {
        Ok(self.restore(heads)?.text(field))
    }

    fn splice(&mut self, field: &str, pos: usize, delete: usize, insert: &str) {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(field);
        let current = text.get_string(&txn);
        let start = byte_offset(&current, pos);
        let end = byte_offset(&current, pos.saturating_add(delete));
        if end > start {
            text.remove_range(&mut txn, start as u32, (end - start) as u32);
        }
        if !insert.is_empty() {
            text.insert(&mut txn, start as u32, insert);
        }
    }

    fn mark(&mut self, field: &str, range: Range<usize>, name: &str, value: &Value) {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(field);
        let current = text.get_string(&txn);
        let start = byte_offset(&current, range.start) as u32;
        let end = byte_offset(&current, range.end.max(range.start)) as u32;

        // A zero-width mark leans on the character before it, so text typed
        // at that spot later lands after the mark.
        let anchors = if start == end {
            text.sticky_index(&mut txn, start, Assoc::Before)
                .map(|anchor| (anchor.clone(), anchor))
        } else {
            text.sticky_index(&mut txn, start, Assoc::After)
                .zip(text.sticky_index(&mut txn, end, Assoc::Before))
        };
        let Some((start, end)) = anchors else {
            log::warn!("mark '{name}' on '{field}' has no anchor for {range:?}");
            return;
        };

        let marks = txn.get_or_insert_map(MARKS);
        let seq = match mark_records(&txn, &marks) {
            Ok(records) => records.iter().map(|(_, r)| r.seq + 1).max().unwrap_or(0),
            Err(e) => {
                log::error!("cannot read marks on '{field}': {e}");
                return;
            }
        };
        let record = MarkRecord {
            field: field.to_string(),
            name: name.to_string(),
            value: value.clone(),
            start: STANDARD.encode(start.encode_v1()),
            end: STANDARD.encode(end.encode_v1()),
            seq,
        };
        match serde_json::to_string(&record) {
            Ok(json) => {
                marks.insert(&mut txn, uuid::Uuid::new_v4().to_string(), json);
            }
            Err(e) => log::error!("failed to encode mark '{name}': {e}"),
        }
    }

    fn raw_spans(&self, field: &str) -> Result<Vec<Mark>, ReplicaError> {
        let txn = self.doc.transact();
        let Some(marks) = txn.get_map(MARKS) else {
            return Ok(Vec::new());
        };
        let current = txn
            .get_text(field)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default();

        let mut spans = Vec::new();
        for (key, record) in mark_records(&txn, &marks)? {
            if record.field != field {
                continue;
            }
            let start = resolve_anchor(&txn, &record.start, &current)?;
            let end = resolve_anchor(&txn, &record.end, &current)?;
            let (Some(start), Some(end)) = (start, end) else {
                continue;
            };
            // Text between the anchors may have been removed entirely.
            let end = end.max(start);
            spans.push((
                (record.seq, key),
                Mark::new(record.name, start, end, record.value),
            ));
        }

        spans.sort_by(|(order_a, a), (order_b, b)| {
            a.start
                .cmp(&b.start)
                .then(a.end.cmp(&b.end))
                .then(order_a.cmp(order_b))
        });
        Ok(spans.into_iter().map(|(_, mark)| mark).collect())
    }

    fn unmark(&mut self, field: &str, range: Range<usize>, name: &str) -> usize {
        let mut txn = self.doc.transact_mut();
        let Some(marks) = txn.get_map(MARKS) else {
            return 0;
        };
        let current = txn
            .get_text(field)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default();
        let records = match mark_records(&txn, &marks) {
            Ok(records) => records,
            Err(e) => {
                log::error!("cannot read marks on '{field}': {e}");
                return 0;
            }
        };

        let mut stale = Vec::new();
        for (key, record) in records {
            if record.field != field || record.name != name {
                continue;
            }
            let start = resolve_anchor(&txn, &record.start, &current);
            let end = resolve_anchor(&txn, &record.end, &current);
            if let (Ok(Some(start)), Ok(Some(end))) = (start, end) {
                if start == range.start && end.max(start) == range.end {
                    stale.push(key);
                }
            }
        }
        for key in &stale {
            marks.remove(&mut txn, key);
        }
        stale.len()
    }

    fn get(&self, map: &str, key: &str) -> Option<Value> {
        let txn = self.doc.transact();
        match txn.get_map(map)?.get(&txn, key)? {
            Out::Any(Any::String(json)) => serde_json::from_str(&json).ok(),
            _ => None,
        }
    }

    fn put(&mut self, map: &str, key: &str, value: &Value) {
        let mut txn = self.doc.transact_mut();
        let target = txn.get_or_insert_map(map);
        target.insert(&mut txn, key.to_string(), value.to_string());
    }

    fn keys(&self, map: &str) -> Vec<String> {
        let txn = self.doc.transact();
        txn.get_map(map)
            .map(|target| target.keys(&txn).map(|key| key.to_string()).collect())
            .unwrap_or_default()
    }

    fn list(&self, name: &str) -> Vec<Value> {
        let txn = self.doc.transact();
        let Some(array) = txn.get_array(name) else {
            return Vec::new();
        };
        array
            .iter(&txn)
            .filter_map(|item| match item {
                Out::Any(Any::String(json)) => serde_json::from_str(&json).ok(),
                _ => None,
            })
            .collect()
    }

    fn list_insert(&mut self, name: &str, index: usize, value: &Value) {
        let mut txn = self.doc.transact_mut();
        let array = txn.get_or_insert_array(name);
        let index = (index as u32).min(array.len(&txn));
        array.insert(&mut txn, index, value.to_string());
    }

    fn commit(&mut self, metadata: &Value) -> Heads {
        self.list_push(COMMITS, metadata);
        self.heads()
    }

    fn commits(&self) -> Vec<Value> {
        self.list(COMMITS)
    }

    fn changes_since(&self, heads: &Heads) -> Result<Vec<u8>, ReplicaError> {
        let snapshot = decode_snapshot(heads)?;
        Ok(self
            .doc
            .transact()
            .encode_state_as_update_v1(&snapshot.state_map))
    }

    fn apply_changes(&mut self, changes: &[u8]) -> Result<Vec<OpRange>, ReplicaError> {
        let before = self.state_vector();
        self.apply_update(changes)?;
        Ok(new_ops(&before, &self.state_vector()))
    }

    fn apply_changes_observed(
        &mut self,
        field: &str,
        changes: &[u8],
    ) -> Result<Vec<TextChange>, ReplicaError> {
        self.observe_apply(field, changes)
    }

    fn diff_between(
        &self,
        field: &str,
        from: &Heads,
        to: &Heads,
    ) -> Result<Vec<TextChange>, ReplicaError> {
        let base = self.restore(from)?;
        let target = if to.is_origin() {
            YrsReplica::new().save()
        } else {
            self.encode_at(&decode_snapshot(to)?)?
        };
        base.observe_apply(field, &target)
    }

    fn generate_sync_message(&self, peer: &mut PeerState) -> Result<Option<Vec<u8>>, ReplicaError> {
        let current = self.heads();
        if !peer.reply_pending {
            if let Some(sent) = &peer.sent_heads {
                if self.same_heads(sent, &current) {
                    return Ok(None);
                }
            }
            if let Some(theirs) = &peer.their_heads {
                if covers(&decode_snapshot(theirs)?.state_map, &self.state_vector()) {
                    return Ok(None);
                }
            }
        }

        // Unknown peers get everything since the origin.
        let since = peer.their_heads.clone().unwrap_or_default();
        let update = Some(self.changes_since(&since)?);
        let payload = SyncPayload {
            heads: current.0.clone(),
            update,
        };
        let encoded = bincode::serde::encode_to_vec(&payload, bincode::config::standard())
            .map_err(|e| ReplicaError::Encode(e.to_string()))?;

        peer.sent_heads = Some(current);
        peer.reply_pending = false;
        Ok(Some(encoded))
    }

    fn receive_sync_message(
        &mut self,
        peer: &mut PeerState,
        message: &[u8],
    ) -> Result<Vec<OpRange>, ReplicaError> {
        let (payload, _): (SyncPayload, usize) =
            bincode::serde::decode_from_slice(message, bincode::config::standard())
                .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let theirs = Heads(payload.heads);
        let their_snapshot = decode_snapshot(&theirs)?;

        let before = self.state_vector();
        if let Some(update) = &payload.update {
            self.apply_update(update)?;
        }
        let after = self.state_vector();

        if peer.sent_heads.is_none() || !covers(&their_snapshot.state_map, &after) {
            peer.reply_pending = true;
        }
        peer.their_heads = Some(theirs);
        Ok(new_ops(&before, &after))
    }
}

fn decode_snapshot(heads: &Heads) -> Result<Snapshot, ReplicaError> {
    if heads.is_origin() {
        return Ok(Snapshot::default());
    }
    Snapshot::decode_v1(&heads.0).map_err(|e| ReplicaError::Decode(e.to_string()))
}

fn resolve_anchor<T: ReadTxn>(
    txn: &T,
    encoded: &str,
    text: &str,
) -> Result<Option<usize>, ReplicaError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| ReplicaError::Corrupt(e.to_string()))?;
    let anchor = StickyIndex::decode_v1(&bytes).map_err(|e| ReplicaError::Decode(e.to_string()))?;
    Ok(anchor
        .get_offset(txn)
        .map(|offset| char_offset(text, offset.index as usize)))
}

fn mark_records<T: ReadTxn>(
    txn: &T,
    marks: &MapRef,
) -> Result<Vec<(String, MarkRecord)>, ReplicaError> {
    let mut records = Vec::new();
    for key in marks.keys(txn) {
        let Some(Out::Any(Any::String(json))) = marks.get(txn, key) else {
            continue;
        };
        let record = serde_json::from_str(&json).map_err(|e| ReplicaError::Corrupt(e.to_string()))?;
        records.push((key.to_string(), record));
    }
    Ok(records)
}

/// Whether `theirs` has seen every operation in `ours`.
fn covers(theirs: &StateVector, ours: &StateVector) -> bool {
    ours.iter().all(|(client, clock)| theirs.get(client) >= *clock)
}

fn new_ops(before: &StateVector, after: &StateVector) -> Vec<OpRange> {
    let mut ops: Vec<OpRange> = after
        .iter()
        .filter_map(|(client, clock)| {
            let start = before.get(client);
            (*clock > start).then(|| OpRange {
                actor: *client,
                start,
                end: *clock,
            })
        })
        .collect();
    ops.sort_by_key(|op| (op.actor, op.start));
    ops
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(index, _)| index)
        .unwrap_or(text.len())
}

fn char_offset(text: &str, bytes: usize) -> usize {
    text.char_indices()
        .take_while(|(index, _)| *index < bytes)
        .count()
}

fn text_changes(before: &str, after: &str, steps: &[Step]) -> Vec<TextChange> {
    let (mut old, mut new) = (0usize, 0usize);
    let mut changes = Vec::new();
    for step in steps {
        match step {
            Step::Retain(n) => {
                old += n;
                new += n;
            }
            Step::Insert(inserted) => {
                let start = char_offset(after, new);
                changes.push(TextChange::Insert {
                    start,
                    end: start + inserted.chars().count(),
                    text: inserted.clone(),
                });
                new += inserted.len();
            }
            Step::Embed => new += 1,
            Step::Delete(n) => {
                let removed = before.get(old..old + n).unwrap_or_default();
                changes.push(TextChange::Delete {
                    pos: char_offset(after, new),
                    text: removed.to_string(),
                });
                old += n;
            }
        }
    }
    changes
}
