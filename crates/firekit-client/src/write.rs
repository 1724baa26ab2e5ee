//! Construction of individual writes, shared by batches, transactions and
//! the bulk writer.

use firekit_models::{DatabaseId, Document, Fields, Precondition, Write};
use firekit_models::wire::DocumentMask;

use crate::reference::DocumentReference;

/// Kind of mutation, as reported in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Set,
    Update,
    Delete,
}

impl WriteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteKind::Create => "create",
            WriteKind::Set => "set",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        }
    }
}

/// Builds wire writes for one database.
#[derive(Debug, Clone)]
pub struct WriteBuilder {
    database: DatabaseId,
}

impl WriteBuilder {
    pub fn new(database: DatabaseId) -> Self {
        Self { database }
    }

    fn document(&self, doc: &DocumentReference, fields: Fields) -> Document {
        Document::named(doc.full_name(&self.database), fields)
    }

    /// Insert; fails server-side if the document exists.
    pub fn create(&self, doc: &DocumentReference, fields: Fields) -> Write {
        Write {
            update: Some(self.document(doc, fields)),
            current_document: Some(Precondition::exists(false)),
            ..Write::default()
        }
    }

    /// Overwrite the whole document, creating it if needed.
    pub fn set(&self, doc: &DocumentReference, fields: Fields) -> Write {
        Write {
            update: Some(self.document(doc, fields)),
            ..Write::default()
        }
    }

    /// Overwrite only the given top-level fields, creating the document if needed.
    pub fn set_merge(&self, doc: &DocumentReference, fields: Fields) -> Write {
        let mask = field_mask(&fields);
        Write {
            update: Some(self.document(doc, fields)),
            update_mask: Some(mask),
            ..Write::default()
        }
    }

    /// Update the given fields of an existing document.
    pub fn update(&self, doc: &DocumentReference, fields: Fields) -> Write {
        let mask = field_mask(&fields);
        Write {
            update: Some(self.document(doc, fields)),
            update_mask: Some(mask),
            current_document: Some(Precondition::exists(true)),
            ..Write::default()
        }
    }

    pub fn delete(&self, doc: &DocumentReference, precondition: Option<Precondition>) -> Write {
        Write {
            delete: Some(doc.full_name(&self.database)),
            current_document: precondition,
            ..Write::default()
        }
    }
}

/// Sorted mask over the top-level field names.
fn field_mask(fields: &Fields) -> DocumentMask {
    let mut field_paths: Vec<String> = fields.keys().map(|k| quote_field(k)).collect();
    field_paths.sort();
    DocumentMask { field_paths }
}

/// Quote a field name that is not a simple identifier.
fn quote_field(name: &str) -> String {
    let simple = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}
