//! Atomic, non-transactional write batches.

use firekit_models::wire::CommitRequest;
use firekit_models::{Fields, Precondition, Write, WriteResult};
use tracing::debug;

use crate::error::FirestoreResult;
use crate::funnel::RequestFunnel;
use crate::reference::DocumentReference;
use crate::transport::Commit;
use crate::write::WriteBuilder;

/// Writes applied together by a single `commit`.
pub struct WriteBatch {
    funnel: RequestFunnel,
    builder: WriteBuilder,
    writes: Vec<Write>,
}

impl WriteBatch {
    pub(crate) fn new(funnel: RequestFunnel) -> Self {
        let builder = WriteBuilder::new(funnel.database().clone());
        Self {
            funnel,
            builder,
            writes: Vec::new(),
        }
    }

    pub fn create(&mut self, doc: &DocumentReference, fields: Fields) -> &mut Self {
        self.writes.push(self.builder.create(doc, fields));
        self
    }

    pub fn set(&mut self, doc: &DocumentReference, fields: Fields) -> &mut Self {
        self.writes.push(self.builder.set(doc, fields));
        self
    }

    pub fn set_merge(&mut self, doc: &DocumentReference, fields: Fields) -> &mut Self {
        self.writes.push(self.builder.set_merge(doc, fields));
        self
    }

    pub fn update(&mut self, doc: &DocumentReference, fields: Fields) -> &mut Self {
        self.writes.push(self.builder.update(doc, fields));
        self
    }

    pub fn delete(&mut self, doc: &DocumentReference) -> &mut Self {
        self.writes.push(self.builder.delete(doc, None));
        self
    }

    pub fn delete_with_precondition(&mut self, doc: &DocumentReference, precondition: Precondition) -> &mut Self {
        self.writes.push(self.builder.delete(doc, Some(precondition)));
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Apply every write atomically. Returns one result per write.
    pub async fn commit(self) -> FirestoreResult<Vec<WriteResult>> {
        let count = self.writes.len();
        let request = CommitRequest {
            database: self.funnel.database().database_root(),
            writes: self.writes,
            transaction: None,
        };

        let response = self.funnel.request::<Commit>(&request, "batch_commit", &[]).await?;
        debug!(writes = count, commit_time = ?response.commit_time, "Committed write batch");
        Ok(response.write_results.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fast_retry, mock_pool, test_database, MockTransport, Reply};
    use crate::transport::Method;
    use serde_json::json;

    #[tokio::test]
    async fn test_commit_sends_writes_without_transaction() {
        let mock = MockTransport::new();
        mock.push(
            Method::Commit,
            Reply::Unary(Ok(json!({
                "writeResults": [{ "updateTime": "t1" }, {}],
                "commitTime": "t1"
            }))),
        );
        let funnel = RequestFunnel::new(mock_pool(&mock), test_database(), fast_retry());

        let alice = DocumentReference::parse("users/alice").unwrap();
        let bob = DocumentReference::parse("users/bob").unwrap();
        let mut batch = WriteBatch::new(funnel);
        batch.set(&alice, Fields::new()).delete(&bob);
        assert_eq!(batch.len(), 2);

        let results = batch.commit().await.unwrap();
        assert_eq!(results.len(), 2);

        let request = &mock.requests(Method::Commit)[0];
        assert!(request.get("transaction").is_none());
        assert_eq!(request["writes"].as_array().unwrap().len(), 2);
        assert!(request["writes"][1]["delete"].as_str().unwrap().ends_with("users/bob"));
    }
}
