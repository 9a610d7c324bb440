//! Document store boundary used by chain resolution.
//!
//! The core only ever reads from a store, one `get` per ancestor step.
//! `MemoryStore` is a `HashMap`-backed implementation for tests and
//! single-process use.

use crate::covenant::CovenantDocument;
use crate::SteleError;
use std::collections::HashMap;

/// Read-only lookup of covenant documents by id.
pub trait DocumentStore {
    /// `Ok(None)` when no document has this id.
    fn get(&self, id: &str) -> Result<Option<CovenantDocument>, SteleError>;
}

impl<S: DocumentStore + ?Sized> DocumentStore for &S {
    fn get(&self, id: &str) -> Result<Option<CovenantDocument>, SteleError> {
        (**self).get(id)
    }
}

/// In-memory store keyed by document id.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    documents: HashMap<String, CovenantDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a document under its own id, replacing any previous one.
    pub fn put(&mut self, doc: CovenantDocument) -> Result<(), SteleError> {
        if doc.id.is_empty() {
            return Err(SteleError::Storage("document id cannot be empty".to_string()));
        }
        self.documents.insert(doc.id.clone(), doc);
        Ok(())
    }

    /// Returns whether a document was removed.
    pub fn delete(&mut self, id: &str) -> bool {
        self.documents.remove(id).is_some()
    }

    pub fn has(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> impl Iterator<Item = &CovenantDocument> {
        self.documents.values()
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<CovenantDocument>, SteleError> {
        Ok(self.documents.get(id).cloned())
    }
}

impl FromIterator<CovenantDocument> for MemoryStore {
    fn from_iter<I: IntoIterator<Item = CovenantDocument>>(iter: I) -> Self {
        MemoryStore {
            documents: iter.into_iter().map(|doc| (doc.id.clone(), doc)).collect(),
        }
    }
}
