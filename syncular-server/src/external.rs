//! External data change notification (spec §4.3): a table changed by a path
//! other than a push (a migration, an admin console, a direct SQL update)
//! still has to show up to subscribed clients. New surface; wraps
//! `ServerDatabase::record_external_commit` and evicts any cached snapshot
//! chunks for the affected tables so the next bootstrap re-reads live data.

use std::sync::Arc;

use syncular_core::models::PartitionId;
use syncular_core::SyncResult;

use crate::chunk_cache::ChunkCache;
use crate::database::ServerDatabase;

pub struct ExternalChangeNotifier {
    db: Arc<ServerDatabase>,
    chunks: Arc<ChunkCache>,
}

impl ExternalChangeNotifier {
    pub fn new(db: Arc<ServerDatabase>, chunks: Arc<ChunkCache>) -> Self {
        Self { db, chunks }
    }

    /// Record a synthetic commit for `tables` and drop any cached snapshot
    /// chunks that might now be stale. Callers already know which tables
    /// changed -- there is no row-level diffing here.
    #[tracing::instrument(skip(self))]
    pub async fn notify(
        &self,
        partition_id: PartitionId,
        tables: &[String],
    ) -> SyncResult<i64> {
        let mut sorted: Vec<String> = tables.to_vec();
        sorted.sort();
        sorted.dedup();

        let commit_seq = self.db.record_external_commit(partition_id, &sorted).await?;
        self.chunks.evict_tables(&sorted).await?;
        Ok(commit_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_and_sort_is_idempotent_on_table_list() {
        let mut tables = vec!["tasks".to_string(), "projects".to_string(), "tasks".to_string()];
        tables.sort();
        tables.dedup();
        assert_eq!(tables, vec!["projects".to_string(), "tasks".to_string()]);
    }
}
