//! Outbox queue: durable `pending -> sending -> acked|failed` state
//! machine for commits awaiting server acknowledgement. Grounded on the
//! teacher's `OfflineQueue` (claim-and-retry loop over `sync_queue`) but
//! generalized from a flat retry counter to the explicit status machine.

use std::sync::Arc;

use uuid::Uuid;

use syncular_core::models::{OutboxCommit, Op, PendingOperation};
use syncular_core::protocol::{PushOperation, PushRequest};
use syncular_core::SyncResult;

use crate::database::ClientDatabase;

pub struct Outbox {
    db: Arc<ClientDatabase>,
}

impl Outbox {
    pub fn new(db: Arc<ClientDatabase>) -> Self {
        Self { db }
    }

    pub async fn enqueue(
        &self,
        operations: Vec<PendingOperation>,
        schema_version: i32,
    ) -> SyncResult<Uuid> {
        let client_commit_id = Uuid::new_v4().to_string();
        self.db
            .enqueue_outbox_commit(&client_commit_id, &operations, schema_version)
            .await
    }

    /// Claim the oldest pending commit, if any, and build the wire-format
    /// push request for it.
    pub async fn claim_next(&self, client_id: &str) -> SyncResult<Option<(OutboxCommit, PushRequest)>> {
        let Some(commit) = self.db.claim_next_pending().await? else {
            return Ok(None);
        };
        let operations = commit
            .operations
            .iter()
            .map(to_wire_operation)
            .collect();
        let request = PushRequest {
            client_id: client_id.to_string(),
            client_commit_id: commit.client_commit_id.clone(),
            schema_version: commit.schema_version,
            operations,
        };
        Ok(Some((commit, request)))
    }

    pub async fn mark_acked(&self, id: &Uuid, commit_seq: i64) -> SyncResult<()> {
        self.db.mark_outbox_acked(id, commit_seq).await
    }

    pub async fn mark_failed(&self, id: &Uuid, response_json: &serde_json::Value) -> SyncResult<()> {
        self.db.mark_outbox_failed(id, response_json).await
    }

    pub async fn retry(&self, id: &Uuid, error: &str) -> SyncResult<()> {
        self.db.retry_outbox(id, error).await
    }

    pub async fn pending_count(&self) -> SyncResult<i64> {
        self.db.pending_outbox_count().await
    }
}

fn to_wire_operation(op: &PendingOperation) -> PushOperation {
    PushOperation {
        table: op.table.clone(),
        row_id: op.row_id.clone(),
        op: op.op,
        payload: op.payload.clone(),
        base_version: op.base_version,
    }
}

pub fn is_delete(op: &PendingOperation) -> bool {
    op.op == Op::Delete
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_next_builds_matching_push_request() {
        let db = Arc::new(ClientDatabase::new("sqlite::memory:").await.unwrap());
        db.run_migrations().await.unwrap();
        let outbox = Outbox::new(db.clone());

        let ops = vec![PendingOperation {
            table: "tasks".into(),
            row_id: "t1".into(),
            op: Op::Upsert,
            payload: Some(serde_json::json!({"title": "x"})),
            base_version: None,
        }];
        outbox.enqueue(ops, 1).await.unwrap();

        let (commit, request) = outbox.claim_next("client_1").await.unwrap().unwrap();
        assert_eq!(request.client_commit_id, commit.client_commit_id);
        assert_eq!(request.operations.len(), 1);
        assert_eq!(request.operations[0].row_id, "t1");
    }
}
