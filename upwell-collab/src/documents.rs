//! Open families, backed by a local store and an optional remote.
//!
//! Reads are local first: memory, then the local store, then the remote.
//! `sync` reconciles one family with the remote copy and writes the
//! result to both stores.

use std::collections::HashMap;

use upwell_core::{Author, Upwell, UpwellError};

use crate::storage::{Storage, StoreError};

type ChangeListener = Box<dyn FnMut(&str, bool) + Send>;

/// Documents manager errors.
#[derive(Debug)]
pub enum DocumentsError {
    /// No family with this id in memory or any store
    NotFound(String),
    Store(StoreError),
    Upwell(UpwellError),
}

impl std::fmt::Display for DocumentsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentsError::NotFound(id) => write!(f, "No document with id={id}"),
            DocumentsError::Store(e) => write!(f, "Storage error: {e}"),
            DocumentsError::Upwell(e) => write!(f, "Document error: {e}"),
        }
    }
}

impl std::error::Error for DocumentsError {}

impl From<StoreError> for DocumentsError {
    fn from(e: StoreError) -> Self {
        DocumentsError::Store(e)
    }
}

impl From<UpwellError> for DocumentsError {
    fn from(e: UpwellError) -> Self {
        DocumentsError::Upwell(e)
    }
}

pub struct Documents {
    author: Author,
    upwells: HashMap<String, Upwell>,
    local: Box<dyn Storage>,
    remote: Option<Box<dyn Storage>>,
    listeners: HashMap<String, ChangeListener>,
}

impl Documents {
    pub fn new(author: Author, local: Box<dyn Storage>) -> Self {
        Self {
            author,
            upwells: HashMap::new(),
            local,
            remote: None,
            listeners: HashMap::new(),
        }
    }

    pub fn with_remote(mut self, remote: Box<dyn Storage>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    pub fn set_author(&mut self, author: Author) {
        self.author = author;
    }

    /// Create a family under `id` and save it locally.
    pub fn create(&mut self, id: &str) -> Result<&mut Upwell, DocumentsError> {
        let upwell = Upwell::create_with_id(id, &self.author)?;
        self.upwells.insert(id.to_string(), upwell);
        self.save(id)?;
        self.get(id)
    }

    /// Bring a family into memory from wherever it lives.
    pub fn open(&mut self, id: &str) -> Result<&mut Upwell, DocumentsError> {
        if !self.upwells.contains_key(id) {
            let bytes = match self.local.get_item(id)? {
                Some(bytes) => bytes,
                None => match self.fetch_remote(id)? {
                    Some(bytes) => {
                        self.local.set_item(id, &bytes)?;
                        bytes
                    }
                    None => return Err(DocumentsError::NotFound(id.to_string())),
                },
            };
            let upwell = Upwell::deserialize(&bytes, &self.author)?;
            log::info!("opened {id} ({} bytes)", bytes.len());
            self.upwells.insert(id.to_string(), upwell);
        }
        self.get(id)
    }

    /// An already open family.
    pub fn get(&mut self, id: &str) -> Result<&mut Upwell, DocumentsError> {
        self.upwells
            .get_mut(id)
            .ok_or_else(|| DocumentsError::NotFound(id.to_string()))
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.upwells.contains_key(id)
    }

    /// Write an open family to the local store.
    pub fn save(&mut self, id: &str) -> Result<(), DocumentsError> {
        let bytes = self.get(id)?.serialize()?;
        self.local.set_item(id, &bytes)?;
        self.changed(id, true);
        Ok(())
    }

    /// Reconcile with the remote copy, then write both stores.
    pub fn sync(&mut self, id: &str) -> Result<(), DocumentsError> {
        let theirs = self.fetch_remote(id)?;
        if !self.upwells.contains_key(id) {
            let Some(bytes) = theirs else {
                return Err(DocumentsError::NotFound(id.to_string()));
            };
            let upwell = Upwell::deserialize(&bytes, &self.author)?;
            self.upwells.insert(id.to_string(), upwell);
            self.local.set_item(id, &bytes)?;
            self.push_remote(id, &bytes)?;
            self.changed(id, false);
            return Ok(());
        }

        let merged = theirs.is_some();
        if let Some(bytes) = theirs {
            let theirs = Upwell::deserialize(&bytes, &self.author)?;
            self.get(id)?.merge(&theirs)?;
        }
        let bytes = self.get(id)?.serialize()?;
        self.local.set_item(id, &bytes)?;
        self.push_remote(id, &bytes)?;
        log::info!("synced {id} ({} bytes)", bytes.len());
        if merged {
            self.changed(id, false);
        }
        Ok(())
    }

    /// Ids in the local store.
    pub fn list(&self) -> Result<Vec<String>, DocumentsError> {
        Ok(self.local.ids()?)
    }

    /// Listen for saves (`true`) and remote merges (`false`) of one family.
    /// A second listener for the same id is ignored.
    pub fn subscribe<F>(&mut self, id: &str, listener: F)
    where
        F: FnMut(&str, bool) + Send + 'static,
    {
        self.listeners
            .entry(id.to_string())
            .or_insert_with(|| Box::new(listener));
    }

    pub fn unsubscribe(&mut self, id: &str) {
        self.listeners.remove(id);
    }

    fn changed(&mut self, id: &str, local: bool) {
        if let Some(listener) = self.listeners.get_mut(id) {
            listener(id, local);
        }
    }

    fn fetch_remote(&self, id: &str) -> Result<Option<Vec<u8>>, DocumentsError> {
        match &self.remote {
            Some(remote) => Ok(remote.get_item(id)?),
            None => Ok(None),
        }
    }

    fn push_remote(&self, id: &str, bytes: &[u8]) -> Result<(), DocumentsError> {
        if let Some(remote) = &self.remote {
            remote.set_item(id, bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::{Arc, Mutex};

    fn ana() -> Author {
        Author::new("ana", "Ana")
    }

    fn documents(local: &Arc<MemoryStore>, remote: &Arc<MemoryStore>) -> Documents {
        Documents::new(ana(), Box::new(local.clone())).with_remote(Box::new(remote.clone()))
    }

    #[test]
    fn test_create_saves_locally() {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryStore::new());
        let mut docs = documents(&local, &remote);
        docs.create("fam").unwrap();
        assert!(local.get_item("fam").unwrap().is_some());
        assert!(remote.is_empty());
        assert_eq!(docs.list().unwrap(), vec!["fam"]);
    }

    #[test]
    fn test_open_falls_back_to_local_then_remote() {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryStore::new());
        {
            let mut docs = documents(&local, &remote);
            docs.create("fam").unwrap().root().unwrap().insert_at(0, "hi").unwrap();
            docs.save("fam").unwrap();
        }

        let mut fresh = documents(&local, &remote);
        assert!(!fresh.is_open("fam"));
        assert_eq!(fresh.open("fam").unwrap().root().unwrap().text(), "hi");

        let empty_local = Arc::new(MemoryStore::new());
        remote.set_item("fam", &local.get_item("fam").unwrap().unwrap()).unwrap();
        let mut from_remote = documents(&empty_local, &remote);
        assert_eq!(from_remote.open("fam").unwrap().root().unwrap().text(), "hi");
        assert!(empty_local.get_item("fam").unwrap().is_some());
    }

    #[test]
    fn test_open_unknown_is_not_found() {
        let mut docs = Documents::new(ana(), Box::new(MemoryStore::new()));
        assert!(matches!(docs.open("nope"), Err(DocumentsError::NotFound(_))));
        assert!(matches!(docs.get("nope"), Err(DocumentsError::NotFound(_))));
        assert!(matches!(docs.sync("nope"), Err(DocumentsError::NotFound(_))));
    }

    #[test]
    fn test_sync_merges_remote_drafts() {
        let remote = Arc::new(MemoryStore::new());
        let ana_local = Arc::new(MemoryStore::new());
        let mut ana_docs = documents(&ana_local, &remote);
        ana_docs.create("fam").unwrap();
        ana_docs.sync("fam").unwrap();

        let bo_local = Arc::new(MemoryStore::new());
        let mut bo_docs = Documents::new(Author::new("bo", "Bo"), Box::new(bo_local.clone()))
            .with_remote(Box::new(remote.clone()));
        bo_docs.sync("fam").unwrap();
        let bo_draft = bo_docs
            .get("fam")
            .unwrap()
            .create_draft("bo's idea")
            .unwrap()
            .id()
            .to_string();
        bo_docs.sync("fam").unwrap();

        ana_docs.sync("fam").unwrap();
        let ana_fam = ana_docs.get("fam").unwrap();
        assert!(ana_fam.contains(&bo_draft));
        assert!(ana_fam.authors().iter().any(|a| a.id == "bo"));
        assert!(ana_local.get_item("fam").unwrap().is_some());
    }

    #[test]
    fn test_listener_sees_saves_and_merges() {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryStore::new());
        let mut docs = documents(&local, &remote);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        docs.subscribe("fam", move |id, local| sink.lock().unwrap().push((id.to_string(), local)));
        docs.subscribe("fam", |_, _| panic!("second listener must be ignored"));

        docs.create("fam").unwrap();
        docs.sync("fam").unwrap();
        docs.sync("fam").unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("fam".to_string(), true), ("fam".to_string(), false)]
        );

        docs.unsubscribe("fam");
        docs.save("fam").unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
