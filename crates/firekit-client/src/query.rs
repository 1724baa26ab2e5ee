//! Structured query builder.
//!
//! Queries are assembled client-side and executed by the backend; the
//! builder only covers what callers in this crate need: filters, ordering,
//! projection, cursors and limits.

use firekit_models::wire::{
    CollectionSelector, Cursor, Direction, FieldOperator, FieldReference, Filter, Order,
    Projection, StructuredQuery,
};
use firekit_models::{DatabaseId, ResourcePath, Value};

use crate::reference::{CollectionReference, DocumentReference};

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Document the query is rooted under; `None` is the database root.
    parent: Option<ResourcePath>,
    /// `None` selects every collection.
    collection_id: Option<String>,
    all_descendants: bool,
    filters: Vec<Filter>,
    order_by: Vec<Order>,
    select: Option<Vec<FieldReference>>,
    start_at: Option<Cursor>,
    end_at: Option<Cursor>,
    limit: Option<i32>,
}

impl Query {
    fn rooted(parent: Option<ResourcePath>, collection_id: Option<String>, all_descendants: bool) -> Self {
        Self {
            parent,
            collection_id,
            all_descendants,
            filters: Vec::new(),
            order_by: Vec::new(),
            select: None,
            start_at: None,
            end_at: None,
            limit: None,
        }
    }

    /// Documents directly inside `collection`.
    pub fn collection(collection: &CollectionReference) -> Self {
        Self::rooted(
            collection.parent().map(|doc| doc.path().clone()),
            Some(collection.id().to_string()),
            false,
        )
    }

    /// Every collection named `collection_id`, anywhere in the database.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        Self::rooted(None, Some(collection_id.into()), true)
    }

    /// Every document below `parent` (or the whole database), regardless of
    /// collection.
    pub fn all_descendants(parent: Option<&DocumentReference>) -> Self {
        Self::rooted(parent.map(|doc| doc.path().clone()), None, true)
    }

    pub fn filter(mut self, field: impl Into<String>, op: FieldOperator, value: Value) -> Self {
        self.filters.push(Filter::field(FieldReference::new(field), op, value));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(Order {
            field: FieldReference::new(field),
            direction,
        });
        self
    }

    /// Return only these fields. An empty projection still returns names.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(fields.into_iter().map(FieldReference::new).collect());
        self
    }

    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_at(mut self, values: Vec<Value>) -> Self {
        self.start_at = Some(Cursor {
            values,
            before: Some(true),
        });
        self
    }

    pub fn start_after(mut self, values: Vec<Value>) -> Self {
        self.start_at = Some(Cursor {
            values,
            before: Some(false),
        });
        self
    }

    pub fn end_before(mut self, values: Vec<Value>) -> Self {
        self.end_at = Some(Cursor {
            values,
            before: Some(true),
        });
        self
    }

    /// Full resource name the query runs under.
    pub fn parent_name(&self, database: &DatabaseId) -> String {
        match &self.parent {
            Some(path) => database.full_name(path),
            None => database.documents_root(),
        }
    }

    pub fn to_structured(&self) -> StructuredQuery {
        let r#where = match self.filters.len() {
            0 => None,
            1 => self.filters.first().cloned(),
            _ => Some(Filter::and(self.filters.clone())),
        };

        StructuredQuery {
            select: self.select.clone().map(|fields| Projection { fields }),
            from: vec![CollectionSelector {
                collection_id: self.collection_id.clone(),
                all_descendants: self.all_descendants.then_some(true),
            }],
            r#where,
            order_by: (!self.order_by.is_empty()).then(|| self.order_by.clone()),
            start_at: self.start_at.clone(),
            end_at: self.end_at.clone(),
            limit: self.limit,
        }
    }
}
