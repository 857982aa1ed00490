use serde::{Deserialize, Serialize};

pub type AuthorId = String;
pub type DraftId = String;
pub type CommentId = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Author {
    pub id: AuthorId,
    pub name: String,
}

impl Author {
    pub fn new(id: impl Into<AuthorId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Synthetic author that owns merge results.
    pub fn merge() -> Self {
        Self::new("merge", "Merge")
    }
}
