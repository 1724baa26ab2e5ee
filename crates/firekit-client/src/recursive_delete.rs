//! Delete a document or collection together with everything below it.
//!
//! Descendants are listed with a names-only all-descendants query, paged in
//! descending name order, and deleted through a [`BulkWriter`]. Paging
//! pauses while too many deletes are unresolved.

use firekit_models::wire::{Direction, FieldOperator, FieldReference};
use firekit_models::Value;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tracing::{debug, info_span, warn, Instrument};

use crate::bulk_writer::{BulkWriter, BulkWriterOptions, WriteHandle};
use crate::error::{FirestoreError, FirestoreResult};
use crate::funnel::RequestFunnel;
use crate::query::Query;
use crate::read::{run_query, Consistency};
use crate::reference::{CollectionReference, DocumentReference};

/// Unresolved deletes at which paging pauses.
pub const DEFAULT_MAX_PENDING_OPS: usize = 5000;

/// Unresolved deletes at which paging resumes.
pub const DEFAULT_MIN_PENDING_OPS: usize = 1000;

/// Smallest possible document id, used to bound a collection's key range.
const REFERENCE_NAME_MIN_ID: &str = "__id-9223372036854775808__";

/// What to delete.
#[derive(Debug, Clone, PartialEq)]
pub enum RecursiveDeleteTarget {
    Document(DocumentReference),
    Collection(CollectionReference),
}

impl From<DocumentReference> for RecursiveDeleteTarget {
    fn from(doc: DocumentReference) -> Self {
        Self::Document(doc)
    }
}

impl From<CollectionReference> for RecursiveDeleteTarget {
    fn from(collection: CollectionReference) -> Self {
        Self::Collection(collection)
    }
}

impl From<&DocumentReference> for RecursiveDeleteTarget {
    fn from(doc: &DocumentReference) -> Self {
        Self::Document(doc.clone())
    }
}

impl From<&CollectionReference> for RecursiveDeleteTarget {
    fn from(collection: &CollectionReference) -> Self {
        Self::Collection(collection.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecursiveDeleteOptions {
    pub max_pending_ops: usize,
    pub min_pending_ops: usize,
    /// Documents per query page; defaults to `max_pending_ops`.
    pub page_size: Option<usize>,
}

impl Default for RecursiveDeleteOptions {
    fn default() -> Self {
        Self {
            max_pending_ops: DEFAULT_MAX_PENDING_OPS,
            min_pending_ops: DEFAULT_MIN_PENDING_OPS,
            page_size: None,
        }
    }
}

impl RecursiveDeleteOptions {
    pub fn with_watermarks(mut self, max_pending_ops: usize, min_pending_ops: usize) -> Self {
        self.max_pending_ops = max_pending_ops;
        self.min_pending_ops = min_pending_ops;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    fn page_size(&self) -> usize {
        self.page_size.unwrap_or(self.max_pending_ops)
    }

    fn validate(&self) -> FirestoreResult<()> {
        if self.max_pending_ops == 0 || self.page_size() == 0 {
            return Err(FirestoreError::invalid_argument(
                "max_pending_ops and page_size must be at least 1",
            ));
        }
        if self.min_pending_ops > self.max_pending_ops {
            return Err(FirestoreError::invalid_argument(format!(
                "min_pending_ops ({}) exceeds max_pending_ops ({})",
                self.min_pending_ops, self.max_pending_ops
            )));
        }
        Ok(())
    }
}

/// Names-only query over everything below `target`. Each page asks for one
/// name more than it deletes so the last page is known without an extra
/// round trip.
fn descendants_query(funnel: &RequestFunnel, target: &RecursiveDeleteTarget, page_size: usize) -> Query {
    let query = match target {
        RecursiveDeleteTarget::Document(doc) => Query::all_descendants(Some(doc)),
        RecursiveDeleteTarget::Collection(collection) => {
            let query = Query::all_descendants(collection.parent().as_ref());
            // Every name in the collection sorts between its minimum key and
            // the minimum key of the next possible collection id.
            let prefix = format!("{}/{}", query.parent_name(funnel.database()), collection.id());
            query
                .filter(
                    FieldReference::DOCUMENT_ID,
                    FieldOperator::GreaterThanOrEqual,
                    Value::reference(format!("{}/{}", prefix, REFERENCE_NAME_MIN_ID)),
                )
                .filter(
                    FieldReference::DOCUMENT_ID,
                    FieldOperator::LessThan,
                    Value::reference(format!("{}\u{0}/{}", prefix, REFERENCE_NAME_MIN_ID)),
                )
        }
    };

    query
        .select([FieldReference::DOCUMENT_ID])
        .order_by(FieldReference::DOCUMENT_ID, Direction::Descending)
        .limit(i32::try_from(page_size.saturating_add(1)).unwrap_or(i32::MAX))
}

#[derive(Default)]
struct Failures {
    count: usize,
    last: Option<FirestoreError>,
}

impl Failures {
    fn record(&mut self, result: FirestoreResult<()>) {
        if let Err(e) = result {
            warn!("Recursive delete failed for one document: {}", e);
            self.count += 1;
            self.last = Some(e);
        }
    }
}

type Pending = FuturesUnordered<WriteHandle>;

async fn settle_until(pending: &mut Pending, failures: &mut Failures, remaining: usize) {
    while pending.len() > remaining {
        match pending.next().await {
            Some(result) => failures.record(result.map(|_| ())),
            None => break,
        }
    }
}

/// Delete `target` and all of its descendants.
///
/// With no `writer` a private one is created and closed afterwards; a
/// supplied writer is only flushed.
pub(crate) async fn recursive_delete(
    funnel: &RequestFunnel,
    target: RecursiveDeleteTarget,
    writer: Option<&BulkWriter>,
    options: RecursiveDeleteOptions,
) -> FirestoreResult<()> {
    options.validate()?;
    let span = info_span!("firestore_recursive_delete", target = ?target);

    match writer {
        Some(writer) => {
            let result = drive(funnel, &target, writer, &options).instrument(span).await;
            writer.flush().await;
            result
        }
        None => {
            let writer = BulkWriter::new(funnel.clone(), BulkWriterOptions::default())?;
            let result = drive(funnel, &target, &writer, &options).instrument(span).await;
            writer.close().await;
            result
        }
    }
}

async fn drive(
    funnel: &RequestFunnel,
    target: &RecursiveDeleteTarget,
    writer: &BulkWriter,
    options: &RecursiveDeleteOptions,
) -> FirestoreResult<()> {
    let page_size = options.page_size();
    let base = descendants_query(funnel, target, page_size);
    let mut pending = Pending::new();
    let mut failures = Failures::default();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;
    let mut query_error = None;

    loop {
        if pending.len() >= options.max_pending_ops {
            debug!(pending = pending.len(), "Recursive delete paused at high watermark");
            settle_until(&mut pending, &mut failures, options.min_pending_ops).await;
        }

        let query = match &cursor {
            Some(name) => base.clone().start_after(vec![Value::reference(name.clone())]),
            None => base.clone(),
        };
        let mut page = match run_query(funnel, &query, Consistency::Latest, "recursive_delete").await {
            Ok(outcome) => outcome.snapshots,
            Err(e) => {
                query_error = Some(e);
                break;
            }
        };
        pages += 1;

        let more = page.len() > page_size;
        page.truncate(page_size);
        if let Some(last) = page.last() {
            cursor = Some(last.reference().full_name(funnel.database()));
        }
        for snapshot in &page {
            match writer.delete(snapshot.reference()) {
                Ok(handle) => pending.push(handle),
                Err(e) => failures.record(Err(e)),
            }
        }
        debug!(page = pages, deleted = page.len(), pending = pending.len(), "Recursive delete page enqueued");

        if !more {
            break;
        }
    }

    if query_error.is_none() {
        if let RecursiveDeleteTarget::Document(doc) = target {
            match writer.delete(doc) {
                Ok(handle) => pending.push(handle),
                Err(e) => failures.record(Err(e)),
            }
        }
    }

    settle_until(&mut pending, &mut failures, 0).await;

    if let Some(e) = query_error {
        return Err(e);
    }
    match failures.last {
        Some(last) => Err(FirestoreError::RecursiveDeleteFailed {
            count: failures.count,
            last: last.to_string(),
        }),
        None => Ok(()),
    }
}
