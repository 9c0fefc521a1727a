//! Conflict persistence and resolution. New module -- the teacher has no
//! equivalent (its server always wins silently); grounded in shape on
//! how the teacher's `database.rs` stores and loads rows, applied to
//! `syncular_core::models::Conflict`.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use syncular_core::models::{Conflict, ConflictResolution};
use syncular_core::protocol::OperationResult;
use syncular_core::SyncResult;

use crate::database::ClientDatabase;

pub struct ConflictStore {
    db: Arc<ClientDatabase>,
}

impl ConflictStore {
    pub fn new(db: Arc<ClientDatabase>) -> Self {
        Self { db }
    }

    /// Record one conflict row per non-applied result in a rejected push
    /// response, per spec: a failed outbox commit may carry more than one
    /// conflicting operation result up to and including the failing op.
    pub async fn record_from_results(
        &self,
        outbox_commit_id: Uuid,
        results: &[OperationResult],
    ) -> SyncResult<()> {
        for result in results {
            if result.status == syncular_core::protocol::OperationStatus::Applied {
                continue;
            }
            let conflict = Conflict {
                id: Uuid::new_v4(),
                outbox_commit_id,
                op_index: result.op_index as i32,
                result_status: format!("{:?}", result.status).to_lowercase(),
                code: result.code.clone(),
                message: result.error.clone(),
                server_version: result.server_version,
                server_row_json: result.server_row.clone(),
                created_at: Utc::now(),
                resolved_at: None,
                resolution: None,
            };
            self.db.insert_conflict(&conflict).await?;
        }
        Ok(())
    }

    pub async fn unresolved(&self) -> SyncResult<Vec<Conflict>> {
        self.db.get_unresolved_conflicts().await
    }

    pub async fn resolve(&self, id: &Uuid, resolution: ConflictResolution) -> SyncResult<()> {
        self.db.resolve_conflict(id, &resolution).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncular_core::protocol::OperationStatus;

    #[tokio::test]
    async fn only_non_applied_results_become_conflicts() {
        let db = Arc::new(ClientDatabase::new("sqlite::memory:").await.unwrap());
        db.run_migrations().await.unwrap();
        let store = ConflictStore::new(db);

        let outbox_commit_id = Uuid::new_v4();
        let results = vec![
            OperationResult {
                op_index: 0,
                status: OperationStatus::Applied,
                error: None,
                code: None,
                retriable: None,
                server_version: Some(1),
                server_row: None,
            },
            OperationResult {
                op_index: 1,
                status: OperationStatus::Conflict,
                error: Some("stale write".into()),
                code: Some("VERSION_MISMATCH".into()),
                retriable: Some(false),
                server_version: Some(2),
                server_row: Some(serde_json::json!({"title": "server wins"})),
            },
        ];

        store.record_from_results(outbox_commit_id, &results).await.unwrap();
        let unresolved = store.unresolved().await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].op_index, 1);
        assert_eq!(unresolved[0].server_version, Some(2));
    }
}
