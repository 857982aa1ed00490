//! # upwell-core: Versioning engine for Upwell documents
//!
//! Drafts are independently editable copies of one document. They fork from
//! each other, merge back with attribution, and carry comments and marks
//! that follow concurrent edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   create / fork / archive   ┌──────────────┐
//! │ Upwell       │ ──────────────────────────► │ Draft        │
//! │ (family)     │                             │ marks, blocks│
//! └──────┬───────┘                             │ comments     │
//!        │ metadata                            └──────┬───────┘
//!        ▼                                            ▼
//! ┌──────────────┐                             ┌──────────────┐
//! │ ReplicatedDoc│ ◄───── merge_with_edits ─── │ ReplicatedDoc│
//! │ (YrsReplica) │                             │ (YrsReplica) │
//! └──────────────┘                             └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`replica`]: The replicated document seam and its yrs backend
//! - [`draft`]: Draft editing, metadata, history and subscriber
//! - [`attribution`]: Merge-with-edits producing `insert`/`delete` marks
//! - [`family`]: Document family: root, archive, sharing, lazy drafts
//! - [`container`]: Tar container format for a whole family
//! - [`queue`]: Single-consumer transaction queue

pub mod attribution;
pub mod author;
pub mod block;
pub mod comments;
pub mod container;
pub mod draft;
pub mod error;
pub mod family;
pub mod mark;
pub mod queue;
pub mod replica;

pub use attribution::{merge_with_edits, Merged};
pub use author::{Author, AuthorId, CommentId, DraftId};
pub use block::{Block, BLOCK_SEPARATOR};
pub use comments::{Comment, CommentState, Comments, CommentsMut};
pub use draft::{Commit, Draft, TEXT, TITLE};
pub use error::{ReplicaError, Result, UpwellError};
pub use family::{DraftRef, Upwell};
pub use mark::{Mark, MarkType};
pub use queue::TransactionQueue;
pub use replica::{Heads, OpRange, PeerState, ReplicatedDoc, TextChange, YrsReplica};
