//! Draft-level live sync with a queue of attributed remote transactions.

use upwell_core::{Author, Draft, Heads, OpRange, ReplicatedDoc, TextChange, TransactionQueue};

use crate::protocol::CursorPosition;
use crate::transport::SyncTarget;

/// One remote change to a live draft: body edits, or a cursor move.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub author: Author,
    pub changes: Vec<TextChange>,
    pub cursor: Option<CursorPosition>,
}

impl Transaction {
    pub fn is_cursor(&self) -> bool {
        self.cursor.is_some()
    }
}

/// A draft being edited together with remote peers.
///
/// Every remote sync payload that touches the body lands in
/// [`transactions`](Self::transactions) as the text diff it caused,
/// attributed to the sending author. Remote cursors are queued too.
pub struct LiveDraft {
    draft: Draft,
    transactions: TransactionQueue<Transaction>,
}

impl LiveDraft {
    pub fn new(draft: Draft) -> Self {
        let name = format!("transactions:{}", draft.id());
        Self {
            draft,
            transactions: TransactionQueue::new(name),
        }
    }

    pub fn draft(&self) -> &Draft {
        &self.draft
    }

    /// Local edits go through here; follow them with `update_peers`.
    pub fn draft_mut(&mut self) -> &mut Draft {
        &mut self.draft
    }

    pub fn into_draft(self) -> Draft {
        self.draft
    }

    pub fn transactions(&mut self) -> &mut TransactionQueue<Transaction> {
        &mut self.transactions
    }
}

impl SyncTarget for LiveDraft {
    fn sync_id(&self) -> String {
        self.draft.id().to_string()
    }

    fn replica_mut(&mut self) -> &mut dyn ReplicatedDoc {
        self.draft.replica_mut()
    }

    fn synced(&mut self, author: &Author, before: &Heads, _ops: &[OpRange]) {
        self.draft.notify_subscriber();
        let after = self.draft.heads();
        match self.draft.diff_between(before, &after) {
            Ok(changes) if changes.is_empty() => {}
            Ok(changes) => self.transactions.push(Transaction {
                author: author.clone(),
                changes,
                cursor: None,
            }),
            Err(e) => log::warn!("cannot diff remote changes on {}: {e}", self.draft.id()),
        }
    }

    fn cursor(&mut self, author: &Author, cursor: CursorPosition) {
        self.transactions.push(Transaction {
            author: author.clone(),
            changes: Vec::new(),
            cursor: Some(cursor),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn pair() -> (LiveDraft, Draft) {
        let ana = Author::new("ana", "Ana");
        let mut base = Draft::create("shared", &ana).unwrap();
        base.insert_at(0, "hello").unwrap();
        let remote = Draft::load(base.id(), &base.save(), &Author::new("bo", "Bo")).unwrap();
        (LiveDraft::new(base), remote)
    }

    #[test]
    fn test_remote_text_edit_queues_transaction() {
        let (mut live, mut remote) = pair();
        remote.insert_at(5, " world").unwrap();

        let before = live.draft().heads();
        live.draft_mut().update_to(&remote).unwrap();
        assert_eq!(live.draft().text(), "hello world");

        let bo = Author::new("bo", "Bo");
        live.synced(&bo, &before, &[]);
        assert_eq!(live.transactions().len(), 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        live.transactions()
            .subscribe(move |tx| sink.lock().unwrap().push(tx))
            .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].author, bo);
        assert_eq!(
            seen[0].changes,
            vec![TextChange::Insert { start: 5, end: 11, text: " world".into() }]
        );
    }

    #[test]
    fn test_metadata_only_change_is_not_queued() {
        let (mut live, mut remote) = pair();
        remote.set_message("renamed");
        let before = live.draft().heads();
        live.draft_mut().update_to(&remote).unwrap();
        live.synced(&Author::new("bo", "Bo"), &before, &[]);
        assert!(live.transactions().is_empty());
    }

    #[test]
    fn test_cursor_queues_transaction() {
        let (mut live, _) = pair();
        live.cursor(&Author::new("bo", "Bo"), CursorPosition::new(0, 3));
        let rx = live.transactions().first().unwrap();
        let tx = rx.blocking_recv().unwrap();
        assert!(tx.is_cursor());
        assert!(tx.changes.is_empty());
        assert!(!live.transactions().is_subscribed());
    }
}
