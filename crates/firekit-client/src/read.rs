//! Document reads over the streaming RPCs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::debug;

use firekit_models::wire::{BatchGetDocumentsRequest, RunQueryRequest, TransactionOptions};

use crate::error::FirestoreResult;
use crate::funnel::RequestFunnel;
use crate::query::Query;
use crate::reference::{DocumentReference, DocumentSnapshot};
use crate::transport::{BatchGetDocuments, RunQuery};

/// Snapshot a read is served from.
#[derive(Debug, Clone, Default)]
pub(crate) enum Consistency {
    #[default]
    Latest,
    Transaction(String),
    /// Begin a transaction with the read; its token comes back in the stream.
    NewTransaction(TransactionOptions),
    ReadTime(DateTime<Utc>),
}

impl Consistency {
    fn split(self) -> (Option<String>, Option<TransactionOptions>, Option<DateTime<Utc>>) {
        match self {
            Consistency::Latest => (None, None, None),
            Consistency::Transaction(token) => (Some(token), None, None),
            Consistency::NewTransaction(options) => (None, Some(options), None),
            Consistency::ReadTime(time) => (None, None, Some(time)),
        }
    }
}

/// Result of a read plus the transaction it began, if any.
#[derive(Debug)]
pub(crate) struct ReadOutcome {
    pub snapshots: Vec<DocumentSnapshot>,
    pub transaction: Option<String>,
}

/// Fetch documents in one `batchGet`, returning snapshots in request order.
pub(crate) async fn batch_get(
    funnel: &RequestFunnel,
    docs: &[DocumentReference],
    consistency: Consistency,
    tag: &str,
) -> FirestoreResult<ReadOutcome> {
    let database = funnel.database();
    let mut names: Vec<String> = docs.iter().map(|d| d.full_name(database)).collect();
    names.sort();
    names.dedup();

    let (transaction, new_transaction, read_time) = consistency.split();
    let request = BatchGetDocumentsRequest {
        database: database.database_root(),
        documents: names,
        mask: None,
        transaction,
        new_transaction,
        read_time,
    };

    let mut stream = funnel.request_stream::<BatchGetDocuments>(&request, tag).await?;
    let mut found: HashMap<String, DocumentSnapshot> = HashMap::new();
    let mut began = None;

    while let Some(item) = stream.next().await {
        let item = item?;
        if item.transaction.is_some() {
            began = item.transaction;
        }
        if let Some(document) = item.found {
            let name = document.name.clone().unwrap_or_default();
            found.insert(name, DocumentSnapshot::found(database, document, item.read_time)?);
        } else if let Some(name) = item.missing {
            let reference = DocumentReference::new(database.relative_path(&name)?)?;
            found.insert(name, DocumentSnapshot::missing(reference, item.read_time));
        }
    }

    debug!(request_tag = %tag, requested = docs.len(), received = found.len(), "batchGet complete");

    let snapshots = docs
        .iter()
        .map(|doc| {
            found
                .get(&doc.full_name(database))
                .cloned()
                .unwrap_or_else(|| DocumentSnapshot::missing(doc.clone(), None))
        })
        .collect();

    Ok(ReadOutcome {
        snapshots,
        transaction: began,
    })
}

/// Run a query to completion.
pub(crate) async fn run_query(
    funnel: &RequestFunnel,
    query: &Query,
    consistency: Consistency,
    tag: &str,
) -> FirestoreResult<ReadOutcome> {
    let database = funnel.database();
    let (transaction, new_transaction, read_time) = consistency.split();
    let request = RunQueryRequest {
        parent: query.parent_name(database),
        structured_query: query.to_structured(),
        transaction,
        new_transaction,
        read_time,
    };

    let mut stream = funnel.request_stream::<RunQuery>(&request, tag).await?;
    let mut snapshots = Vec::new();
    let mut began = None;

    while let Some(item) = stream.next().await {
        let item = item?;
        if item.transaction.is_some() {
            began = item.transaction;
        }
        if let Some(document) = item.document {
            snapshots.push(DocumentSnapshot::found(database, document, item.read_time)?);
        }
    }

    Ok(ReadOutcome {
        snapshots,
        transaction: began,
    })
}
