//! Document and collection references, and read snapshots.

use std::fmt;

use firekit_models::{DatabaseId, Document, Fields, PathError, ResourcePath, Value};

use crate::error::FirestoreResult;

/// Reference to a document (even number of path segments).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentReference {
    path: ResourcePath,
}

impl DocumentReference {
    pub fn new(path: ResourcePath) -> FirestoreResult<Self> {
        if !path.is_document() {
            return Err(PathError::NotADocument(path.relative_name()).into());
        }
        Ok(Self { path })
    }

    /// Parse a slash-separated relative path such as `users/alice`.
    pub fn parse(path: &str) -> FirestoreResult<Self> {
        Self::new(ResourcePath::parse(path)?)
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment()
    }

    pub fn parent(&self) -> CollectionReference {
        // A document path always has a parent collection.
        let path = self.path.parent().unwrap_or_else(|| self.path.clone());
        CollectionReference { path }
    }

    /// Subcollection of this document.
    pub fn collection(&self, id: &str) -> FirestoreResult<CollectionReference> {
        CollectionReference::new(self.path.append(id)?)
    }

    pub fn full_name(&self, database: &DatabaseId) -> String {
        database.full_name(&self.path)
    }
}

impl fmt::Display for DocumentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.path, f)
    }
}

/// Reference to a collection (odd number of path segments).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionReference {
    path: ResourcePath,
}

impl CollectionReference {
    pub fn new(path: ResourcePath) -> FirestoreResult<Self> {
        if !path.is_collection() {
            return Err(PathError::NotACollection(path.relative_name()).into());
        }
        Ok(Self { path })
    }

    pub fn parse(path: &str) -> FirestoreResult<Self> {
        Self::new(ResourcePath::parse(path)?)
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment()
    }

    /// Owning document, or `None` for a top-level collection.
    pub fn parent(&self) -> Option<DocumentReference> {
        self.path.parent().map(|path| DocumentReference { path })
    }

    pub fn doc(&self, id: &str) -> FirestoreResult<DocumentReference> {
        DocumentReference::new(self.path.append(id)?)
    }

    /// Full name of the resource queries over this collection are rooted at.
    pub fn parent_name(&self, database: &DatabaseId) -> String {
        match self.parent() {
            Some(doc) => doc.full_name(database),
            None => database.documents_root(),
        }
    }
}

impl fmt::Display for CollectionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.path, f)
    }
}

/// Result of reading a document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    reference: DocumentReference,
    document: Option<Document>,
    read_time: Option<String>,
}

impl DocumentSnapshot {
    pub(crate) fn found(database: &DatabaseId, document: Document, read_time: Option<String>) -> FirestoreResult<Self> {
        let name = document.name.clone().unwrap_or_default();
        let reference = DocumentReference::new(database.relative_path(&name)?)?;
        Ok(Self {
            reference,
            document: Some(document),
            read_time,
        })
    }

    pub(crate) fn missing(reference: DocumentReference, read_time: Option<String>) -> Self {
        Self {
            reference,
            document: None,
            read_time,
        }
    }

    pub fn reference(&self) -> &DocumentReference {
        &self.reference
    }

    pub fn exists(&self) -> bool {
        self.document.is_some()
    }

    pub fn fields(&self) -> Option<&Fields> {
        self.document.as_ref().and_then(|d| d.fields.as_ref())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.document.as_ref().and_then(|d| d.field(field))
    }

    pub fn update_time(&self) -> Option<&str> {
        self.document.as_ref().and_then(|d| d.update_time.as_deref())
    }

    pub fn read_time(&self) -> Option<&str> {
        self.read_time.as_deref()
    }

    pub fn into_document(self) -> Option<Document> {
        self.document
    }
}
