//! A document family: every draft of one document plus shared metadata.
//!
//! The metadata replica holds the family id, the root pointer, the author
//! registry and the archive list (most recent first). Archived drafts read
//! from a container stay as raw bytes until someone asks for them.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde_json::{json, Value};

use crate::author::{Author, AuthorId, DraftId};
use crate::container;
use crate::draft::Draft;
use crate::error::{Result, UpwellError};
use crate::replica::{ReplicatedDoc, YrsReplica};

const FAMILY: &str = "upwell";
const AUTHORS: &str = "authors";
const ARCHIVED: &str = "archived";

/// Message of the draft created with a new family.
pub const ROOT_MESSAGE: &str = "Initial draft";

/// A draft that may not have been parsed yet.
pub enum DraftRef {
    Hydrated(Box<Draft>),
    Raw(Vec<u8>),
}

impl DraftRef {
    pub fn is_hydrated(&self) -> bool {
        matches!(self, DraftRef::Hydrated(_))
    }

    fn bytes(&self) -> Vec<u8> {
        match self {
            DraftRef::Hydrated(draft) => draft.save(),
            DraftRef::Raw(bytes) => bytes.clone(),
        }
    }
}

type Subscriber = Box<dyn FnMut(&Upwell) + Send>;

pub struct Upwell {
    /// Local author; owns drafts created through this handle.
    author: Author,
    metadata: Box<dyn ReplicatedDoc>,
    drafts: HashMap<DraftId, DraftRef>,
    subscriber: Option<Subscriber>,
}

impl fmt::Debug for Upwell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upwell")
            .field("id", &self.id())
            .field("root", &self.root_id())
            .field("drafts", &self.drafts.len())
            .finish_non_exhaustive()
    }
}

impl Upwell {
    pub fn create(author: &Author) -> Result<Self> {
        Self::create_with_id(&uuid::Uuid::new_v4().simple().to_string(), author)
    }

    pub fn create_with_id(id: &str, author: &Author) -> Result<Self> {
        let root = Draft::create(ROOT_MESSAGE, author)?;
        let mut metadata: Box<dyn ReplicatedDoc> = Box::new(YrsReplica::new());
        metadata.put(FAMILY, "id", &Value::from(id));
        metadata.put(FAMILY, "root", &Value::from(root.id()));

        let mut upwell = Self::from_parts(metadata, author);
        upwell.drafts.insert(root.id().to_string(), DraftRef::Hydrated(Box::new(root)));
        log::info!("created document family {id}");
        Ok(upwell)
    }

    fn from_parts(metadata: Box<dyn ReplicatedDoc>, author: &Author) -> Self {
        let mut upwell = Self {
            author: author.clone(),
            metadata,
            drafts: HashMap::new(),
            subscriber: None,
        };
        upwell.add_author(author);
        upwell
    }

    // ─── Identity ─────────────────────────────────────────────────────

    pub fn id(&self) -> String {
        self.family_str("id").unwrap_or_default()
    }

    pub fn root_id(&self) -> DraftId {
        self.family_str("root").unwrap_or_default()
    }

    fn family_str(&self, key: &str) -> Option<String> {
        self.metadata
            .get(FAMILY, key)
            .and_then(|value| value.as_str().map(str::to_string))
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    pub fn root(&mut self) -> Result<&mut Draft> {
        let id = self.root_id();
        self.get(&id)
    }

    /// Point the family at a different root. The old root stays active.
    pub fn set_root(&mut self, id: &str) -> Result<()> {
        if !self.drafts.contains_key(id) {
            return Err(UpwellError::NotFound(id.to_string()));
        }
        if self.is_archived(id) {
            return Err(UpwellError::ArchivedRoot(id.to_string()));
        }
        self.metadata.put(FAMILY, "root", &Value::from(id));
        self.notify();
        Ok(())
    }

    // ─── Authors ──────────────────────────────────────────────────────

    pub fn add_author(&mut self, author: &Author) {
        self.metadata
            .put(AUTHORS, &author.id, &json!({"id": author.id, "name": author.name}));
    }

    pub fn authors(&self) -> Vec<Author> {
        let mut authors: Vec<Author> = self
            .metadata
            .materialize(AUTHORS)
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_value(value).ok())
            .collect();
        authors.sort_by(|a, b| a.id.cmp(&b.id));
        authors
    }

    pub fn author_name(&self, id: &AuthorId) -> Option<String> {
        let value = self.metadata.get(AUTHORS, id)?;
        value.get("name")?.as_str().map(str::to_string)
    }

    // ─── Drafts ───────────────────────────────────────────────────────

    /// Fetch a draft, parsing it first if it is still raw.
    pub fn get(&mut self, id: &str) -> Result<&mut Draft> {
        let entry = self
            .drafts
            .get_mut(id)
            .ok_or_else(|| UpwellError::NotFound(id.to_string()))?;
        if let DraftRef::Raw(bytes) = entry {
            log::debug!("hydrating draft {id}");
            let draft = Draft::load(id, bytes, &self.author)?;
            *entry = DraftRef::Hydrated(Box::new(draft));
        }
        match entry {
            DraftRef::Hydrated(draft) => Ok(draft.as_mut()),
            DraftRef::Raw(_) => Err(UpwellError::NotFound(id.to_string())),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.drafts.contains_key(id)
    }

    pub fn is_hydrated(&self, id: &str) -> bool {
        self.drafts.get(id).is_some_and(DraftRef::is_hydrated)
    }

    /// Active drafts, oldest first.
    pub fn drafts(&self) -> Vec<&Draft> {
        let archived = self.archived_set();
        let mut drafts: Vec<&Draft> = self
            .drafts
            .iter()
            .filter(|(id, _)| !archived.contains(id.as_str()))
            .filter_map(|(_, entry)| match entry {
                DraftRef::Hydrated(draft) => Some(draft.as_ref()),
                DraftRef::Raw(_) => None,
            })
            .collect();
        drafts.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then(a.id().cmp(b.id())));
        drafts
    }

    pub fn all_ids(&self) -> Vec<DraftId> {
        let mut ids: Vec<DraftId> = self.drafts.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Insert a draft, or merge it into the copy already known by its id.
    pub fn add(&mut self, draft: Draft) -> Result<()> {
        if self.drafts.contains_key(draft.id()) {
            self.get(draft.id())?.merge(&draft)?;
        } else {
            for contributor in draft.contributors() {
                self.add_author(&contributor);
            }
            self.drafts
                .insert(draft.id().to_string(), DraftRef::Hydrated(Box::new(draft)));
        }
        self.notify();
        Ok(())
    }

    /// Fork the root as the local author.
    pub fn create_draft(&mut self, message: &str) -> Result<&mut Draft> {
        let author = self.author.clone();
        let draft = self.root()?.fork(message, &author)?;
        let id = draft.id().to_string();
        self.add(draft)?;
        self.get(&id)
    }

    pub fn share(&mut self, id: &str) -> Result<()> {
        self.get(id)?.set_shared(true);
        self.notify();
        Ok(())
    }

    /// Bring a draft up to date with the root and re-parent it there.
    pub fn update_to_root(&mut self, id: &str) -> Result<()> {
        let root_id = self.root_id();
        if id == root_id {
            return Ok(());
        }
        // Hydrate the draft, then lift it out so both can be borrowed.
        self.get(id)?;
        let Some(DraftRef::Hydrated(mut draft)) = self.drafts.remove(id) else {
            return Err(UpwellError::NotFound(id.to_string()));
        };
        let updated = self.get(&root_id).and_then(|root| draft.update_to(root));
        draft.set_parent_id(&root_id);
        self.drafts.insert(id.to_string(), DraftRef::Hydrated(draft));
        updated?;
        self.notify();
        Ok(())
    }

    // ─── Archive ──────────────────────────────────────────────────────

    fn archived_set(&self) -> HashSet<DraftId> {
        self.history().into_iter().collect()
    }

    pub fn is_archived(&self, id: &str) -> bool {
        self.history().iter().any(|archived| archived == id)
    }

    /// Move a draft to the front of the archive list.
    pub fn archive(&mut self, id: &str) -> Result<()> {
        if id == self.root_id() {
            return Err(UpwellError::ArchiveRoot(id.to_string()));
        }
        if self.is_archived(id) {
            return Ok(());
        }
        self.get(id)?.set_archived(true);
        self.metadata.list_insert(ARCHIVED, 0, &Value::from(id));
        log::info!("archived draft {id}");
        self.notify();
        Ok(())
    }

    /// Archived draft ids, most recent first.
    pub fn history(&self) -> Vec<DraftId> {
        self.metadata
            .list(ARCHIVED)
            .into_iter()
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect()
    }

    // ─── Family merge ─────────────────────────────────────────────────

    /// Union another copy of this family into this one.
    pub fn merge(&mut self, other: &Upwell) -> Result<()> {
        let their_archive = other.archived_set();
        for (id, entry) in &other.drafts {
            match (self.drafts.contains_key(id), entry) {
                (true, DraftRef::Hydrated(theirs)) => {
                    self.get(id)?.merge(theirs)?;
                }
                // Raw on their side means archived and untouched there.
                (true, DraftRef::Raw(_)) => {}
                (false, entry) => {
                    self.drafts.insert(id.clone(), DraftRef::Raw(entry.bytes()));
                    if !their_archive.contains(id) {
                        self.get(id)?;
                    }
                }
            }
        }
        self.metadata.merge(other.metadata.as_ref())?;
        self.notify();
        Ok(())
    }

    pub fn metadata(&self) -> &dyn ReplicatedDoc {
        self.metadata.as_ref()
    }

    pub fn metadata_mut(&mut self) -> &mut dyn ReplicatedDoc {
        self.metadata.as_mut()
    }

    // ─── Container ────────────────────────────────────────────────────

    /// Every draft plus the metadata, as a tar container. Raw drafts are
    /// written back without being parsed.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let drafts: Vec<(DraftId, Vec<u8>)> = self
            .drafts
            .iter()
            .map(|(id, entry)| (id.clone(), entry.bytes()))
            .collect();
        container::write(
            &self.metadata.save(),
            drafts.iter().map(|(id, bytes)| (id.as_str(), bytes.as_slice())),
        )
    }

    /// Read a container. Archived drafts other than the root stay raw.
    pub fn deserialize(bytes: &[u8], author: &Author) -> Result<Self> {
        let contents = container::read(bytes)?;
        let metadata = YrsReplica::load(&contents.metadata)?;
        let mut upwell = Self::from_parts(Box::new(metadata), author);

        let archived = upwell.archived_set();
        let root = upwell.root_id();
        for (id, bytes) in contents.drafts {
            let entry = if archived.contains(&id) && id != root {
                DraftRef::Raw(bytes)
            } else {
                DraftRef::Hydrated(Box::new(Draft::load(id.as_str(), &bytes, author)?))
            };
            upwell.drafts.insert(id, entry);
        }
        if !upwell.drafts.contains_key(&root) {
            return Err(UpwellError::NotFound(root));
        }
        log::debug!(
            "loaded family {} with {} drafts ({} archived)",
            upwell.id(),
            upwell.drafts.len(),
            archived.len()
        );
        Ok(upwell)
    }

    // ─── Subscriber ───────────────────────────────────────────────────

    pub fn subscribe<F>(&mut self, subscriber: F)
    where
        F: FnMut(&Upwell) + Send + 'static,
    {
        self.subscriber = Some(Box::new(subscriber));
    }

    pub fn unsubscribe(&mut self) {
        self.subscriber = None;
    }

    pub fn notify(&mut self) {
        if let Some(mut subscriber) = self.subscriber.take() {
            subscriber(self);
            self.subscriber = Some(subscriber);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn author(id: &str) -> Author {
        Author::new(id, id.to_uppercase())
    }

    #[test]
    fn test_create_family() {
        let ana = author("ana");
        let mut upwell = Upwell::create_with_id("doc-1", &ana).unwrap();
        assert_eq!(upwell.id(), "doc-1");
        assert_eq!(upwell.authors(), vec![ana.clone()]);
        assert_eq!(upwell.author_name(&"ana".to_string()).as_deref(), Some("ANA"));

        let root_id = upwell.root_id();
        assert_eq!(upwell.root().unwrap().id(), root_id);
        assert_eq!(upwell.drafts().len(), 1);
    }

    #[test]
    fn test_create_draft_forks_root() {
        let mut upwell = Upwell::create(&author("ana")).unwrap();
        upwell.root().unwrap().insert_at(0, "root text").unwrap();
        let root_id = upwell.root_id();

        let draft = upwell.create_draft("idea").unwrap();
        assert_eq!(draft.text(), "root text");
        assert_eq!(draft.parent_id(), Some(root_id));
        let id = draft.id().to_string();
        assert_eq!(upwell.drafts().len(), 2);
        assert!(upwell.all_ids().contains(&id));
    }

    #[test]
    fn test_add_same_id_merges() {
        let ana = author("ana");
        let mut upwell = Upwell::create(&ana).unwrap();
        let id = upwell.create_draft("shared").unwrap().id().to_string();
        let copy_bytes = upwell.get(&id).unwrap().save();

        let mut copy = Draft::load(id.as_str(), &copy_bytes, &ana).unwrap();
        copy.insert_at(0, "remote ").unwrap();
        upwell.get(&id).unwrap().insert_at(0, "local").unwrap();

        upwell.add(copy).unwrap();
        let text = upwell.get(&id).unwrap().text();
        assert!(text.contains("remote "));
        assert!(text.contains("local"));
        assert_eq!(upwell.drafts().len(), 2);
    }

    #[test]
    fn test_archive_rules() {
        let mut upwell = Upwell::create(&author("ana")).unwrap();
        let root = upwell.root_id();
        let a = upwell.create_draft("a").unwrap().id().to_string();
        let b = upwell.create_draft("b").unwrap().id().to_string();

        assert!(matches!(upwell.archive(&root), Err(UpwellError::ArchiveRoot(_))));
        assert!(matches!(upwell.archive("ghost"), Err(UpwellError::NotFound(_))));

        upwell.archive(&a).unwrap();
        upwell.archive(&b).unwrap();
        upwell.archive(&a).unwrap();
        assert_eq!(upwell.history(), vec![b.clone(), a.clone()]);
        assert!(upwell.get(&a).unwrap().archived());
        assert_eq!(upwell.drafts().len(), 1);
        assert!(matches!(upwell.set_root(&a), Err(UpwellError::ArchivedRoot(_))));
    }

    #[test]
    fn test_drafts_skips_long_archive() {
        let mut upwell = Upwell::create(&author("ana")).unwrap();
        let mut kept = Vec::new();
        for i in 0..40 {
            let id = upwell.create_draft(&format!("d{i}")).unwrap().id().to_string();
            if i % 4 == 0 {
                kept.push(id);
            } else {
                upwell.archive(&id).unwrap();
            }
        }
        assert_eq!(upwell.history().len(), 30);

        let mut active: Vec<String> =
            upwell.drafts().iter().map(|d| d.id().to_string()).collect();
        active.sort();
        let mut expected = kept.clone();
        expected.push(upwell.root_id());
        expected.sort();
        assert_eq!(active, expected);
    }

    #[test]
    fn test_set_root_keeps_old_root_active() {
        let mut upwell = Upwell::create(&author("ana")).unwrap();
        let old = upwell.root_id();
        let next = upwell.create_draft("next").unwrap().id().to_string();
        upwell.set_root(&next).unwrap();
        assert_eq!(upwell.root_id(), next);
        assert!(!upwell.is_archived(&old));
        upwell.archive(&old).unwrap();
    }

    #[test]
    fn test_share_and_update_to_root() {
        let mut upwell = Upwell::create(&author("ana")).unwrap();
        let id = upwell.create_draft("mine").unwrap().id().to_string();
        upwell.share(&id).unwrap();
        assert!(upwell.get(&id).unwrap().shared());

        upwell.root().unwrap().insert_at(0, "new root text").unwrap();
        upwell.update_to_root(&id).unwrap();
        let draft = upwell.get(&id).unwrap();
        assert_eq!(draft.text(), "new root text");
        assert_eq!(draft.message(), "mine");
        assert!(draft.shared());
        assert_eq!(draft.parent_id(), Some(upwell.root_id()));
    }

    #[test]
    fn test_serialize_keeps_archived_raw() {
        let ana = author("ana");
        let mut upwell = Upwell::create(&ana).unwrap();
        let mut archived = Vec::new();
        for i in 0..4 {
            let id = upwell.create_draft(&format!("draft {i}")).unwrap().id().to_string();
            if i % 2 == 0 {
                archived.push(id);
            }
        }
        for id in &archived {
            upwell.archive(id).unwrap();
        }

        let bytes = upwell.serialize().unwrap();
        let mut loaded = Upwell::deserialize(&bytes, &ana).unwrap();
        assert_eq!(loaded.id(), upwell.id());
        assert_eq!(loaded.all_ids().len(), 5);
        assert_eq!(loaded.drafts().len(), 5 - archived.len());
        for id in &archived {
            assert!(!loaded.is_hydrated(id));
        }

        let message = loaded.get(&archived[0]).unwrap().message();
        assert_eq!(message, "draft 0");
        assert!(loaded.is_hydrated(&archived[0]));
        assert!(!loaded.is_hydrated(&archived[1]));

        // Raw drafts survive a second round trip untouched.
        let again = Upwell::deserialize(&loaded.serialize().unwrap(), &ana).unwrap();
        assert_eq!(again.all_ids(), loaded.all_ids());
    }

    #[test]
    fn test_merge_families() {
        let ana = author("ana");
        let bo = author("bo");
        let mut ours = Upwell::create(&ana).unwrap();
        let bytes = ours.serialize().unwrap();
        let mut theirs = Upwell::deserialize(&bytes, &bo).unwrap();

        let mine = ours.create_draft("mine").unwrap().id().to_string();
        let yours = theirs.create_draft("yours").unwrap().id().to_string();
        theirs.archive(&yours).unwrap();

        ours.merge(&theirs).unwrap();
        assert!(ours.contains(&mine));
        assert!(ours.contains(&yours));
        assert!(ours.is_archived(&yours));
        assert!(ours.authors().contains(&bo));
        assert_eq!(ours.drafts().len(), 2);
    }

    #[test]
    fn test_subscriber_notified() {
        let mut upwell = Upwell::create(&author("ana")).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        upwell.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let id = upwell.create_draft("x").unwrap().id().to_string();
        upwell.share(&id).unwrap();
        upwell.archive(&id).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        upwell.unsubscribe();
        upwell.create_draft("y").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
