//! Threaded comments stored inside a draft's replica.
//!
//! Comment records live in the `comments` map. Each thread keeps its replies
//! in a separate list, `comment-children/<id>`, so concurrent replies from
//! different drafts all survive a merge.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::author::{AuthorId, CommentId};
use crate::error::{Result, UpwellError};
use crate::replica::ReplicatedDoc;

const COMMENTS: &str = "comments";

fn children_list(id: &str) -> String {
    format!("comment-children/{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommentState {
    Open,
    Closed,
    Child,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CommentRecord {
    id: CommentId,
    author: AuthorId,
    message: String,
    parent_id: Option<CommentId>,
    state: CommentState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub author: AuthorId,
    pub message: String,
    /// Reply ids in the order they were added.
    pub children: Vec<CommentId>,
    pub parent_id: Option<CommentId>,
    pub state: CommentState,
}

/// Read view over a draft's comments.
pub struct Comments<'a> {
    doc: &'a dyn ReplicatedDoc,
}

impl<'a> Comments<'a> {
    pub(crate) fn new(doc: &'a dyn ReplicatedDoc) -> Self {
        Self { doc }
    }

    pub fn get(&self, id: &str) -> Option<Comment> {
        let record: CommentRecord = serde_json::from_value(self.doc.get(COMMENTS, id)?).ok()?;
        let children = self
            .doc
            .list(&children_list(id))
            .into_iter()
            .filter_map(|child| child.as_str().map(str::to_string))
            .collect();
        Some(Comment {
            id: record.id,
            author: record.author,
            message: record.message,
            children,
            parent_id: record.parent_id,
            state: record.state,
        })
    }

    /// Every comment, replies included.
    pub fn all(&self) -> Vec<Comment> {
        self.doc
            .keys(COMMENTS)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Top-level comments only.
    pub fn threads(&self) -> Vec<Comment> {
        self.all()
            .into_iter()
            .filter(|comment| comment.parent_id.is_none())
            .collect()
    }

    pub fn replies(&self, id: &str) -> Vec<Comment> {
        self.get(id)
            .map(|comment| comment.children.iter().filter_map(|child| self.get(child)).collect())
            .unwrap_or_default()
    }
}

/// Write access to a draft's comments.
pub struct CommentsMut<'a> {
    doc: &'a mut dyn ReplicatedDoc,
}

impl<'a> CommentsMut<'a> {
    pub(crate) fn new(doc: &'a mut dyn ReplicatedDoc) -> Self {
        Self { doc }
    }

    pub fn view(&self) -> Comments<'_> {
        Comments::new(&*self.doc)
    }

    /// Start a new open thread.
    pub fn insert(&mut self, author: &str, message: &str) -> Result<CommentId> {
        let id = uuid::Uuid::new_v4().to_string();
        self.write(&CommentRecord {
            id: id.clone(),
            author: author.to_string(),
            message: message.to_string(),
            parent_id: None,
            state: CommentState::Open,
        })?;
        Ok(id)
    }

    /// Append a reply to `parent`'s children.
    pub fn add_child(&mut self, parent: &str, author: &str, message: &str) -> Result<CommentId> {
        if self.doc.get(COMMENTS, parent).is_none() {
            return Err(UpwellError::NotFound(parent.to_string()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.write(&CommentRecord {
            id: id.clone(),
            author: author.to_string(),
            message: message.to_string(),
            parent_id: Some(parent.to_string()),
            state: CommentState::Child,
        })?;
        self.doc
            .list_push(&children_list(parent), &Value::from(id.clone()));
        Ok(id)
    }

    /// Close a thread. Replies are left as they are.
    pub fn resolve(&mut self, id: &str) -> Result<()> {
        let value = self
            .doc
            .get(COMMENTS, id)
            .ok_or_else(|| UpwellError::NotFound(id.to_string()))?;
        let mut record: CommentRecord = serde_json::from_value(value)?;
        record.state = CommentState::Closed;
        self.write(&record)
    }

    fn write(&mut self, record: &CommentRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.doc.put(COMMENTS, &record.id, &value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::YrsReplica;

    #[test]
    fn test_insert_opens_thread() {
        let mut doc = YrsReplica::new();
        let mut comments = CommentsMut::new(&mut doc);
        let id = comments.insert("ana", "typo here").unwrap();

        let comment = comments.view().get(&id).unwrap();
        assert_eq!(comment.state, CommentState::Open);
        assert_eq!(comment.message, "typo here");
        assert!(comment.children.is_empty());
        assert!(comment.parent_id.is_none());
    }

    #[test]
    fn test_add_child_appends_in_order() {
        let mut doc = YrsReplica::new();
        let mut comments = CommentsMut::new(&mut doc);
        let parent = comments.insert("ana", "question").unwrap();
        let first = comments.add_child(&parent, "bo", "answer one").unwrap();
        let second = comments.add_child(&parent, "cy", "answer two").unwrap();
        let third = comments.add_child(&parent, "bo", "answer three").unwrap();

        let view = comments.view();
        let thread = view.get(&parent).unwrap();
        assert_eq!(thread.children, vec![first.clone(), second, third]);

        let reply = view.get(&first).unwrap();
        assert_eq!(reply.state, CommentState::Child);
        assert_eq!(reply.parent_id.as_deref(), Some(parent.as_str()));
        assert_eq!(view.replies(&parent).len(), 3);
        assert_eq!(view.threads().len(), 1);
        assert_eq!(view.all().len(), 4);
    }

    #[test]
    fn test_resolve_keeps_children() {
        let mut doc = YrsReplica::new();
        let mut comments = CommentsMut::new(&mut doc);
        let parent = comments.insert("ana", "question").unwrap();
        let child = comments.add_child(&parent, "bo", "reply").unwrap();

        comments.resolve(&parent).unwrap();
        let thread = comments.view().get(&parent).unwrap();
        assert_eq!(thread.state, CommentState::Closed);
        assert_eq!(thread.children, vec![child]);
    }

    #[test]
    fn test_unknown_parent_is_not_found() {
        let mut doc = YrsReplica::new();
        let mut comments = CommentsMut::new(&mut doc);
        assert!(matches!(
            comments.add_child("nope", "bo", "reply"),
            Err(UpwellError::NotFound(_))
        ));
        assert!(matches!(comments.resolve("nope"), Err(UpwellError::NotFound(_))));
    }
}
