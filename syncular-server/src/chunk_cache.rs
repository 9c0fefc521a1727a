//! Snapshot chunk cache (spec §4.5): content-addressed metadata backed by a
//! pluggable [`BlobStore`]. New surface -- the teacher has no snapshot
//! concept -- built in the teacher's collaborator-on-`AppState` style (cf.
//! `AuthState`, `MonitoringLayer`).

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use syncular_core::models::{Compression, Encoding, PartitionId, SnapshotChunkMeta};
use syncular_core::snapshot::{blob_hash, BlobStore};
use syncular_core::SyncResult;

use crate::database::ServerDatabase;

/// Default lifetime of a snapshot chunk before it's eligible for cleanup.
pub const CHUNK_TTL_HOURS: i64 = 24;

pub struct ChunkCache {
    db: Arc<ServerDatabase>,
    blobs: Arc<dyn BlobStore>,
}

#[allow(clippy::too_many_arguments)]
pub struct ChunkKey<'a> {
    pub partition_id: PartitionId,
    pub table: &'a str,
    pub scope_key: &'a str,
    pub scope: &'a str,
    pub as_of_commit_seq: i64,
    pub row_cursor: Option<&'a str>,
    pub row_limit: i32,
}

impl ChunkCache {
    pub fn new(db: Arc<ServerDatabase>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { db, blobs }
    }

    /// Look up an existing chunk for `key`, or build one from `body` (the
    /// gzip-compressed row-frame bytes) and its pre-compression `sha256`.
    /// Spec §4.5 steps 1-4.
    pub async fn get_or_store(
        &self,
        key: ChunkKey<'_>,
        sha256: &str,
        body: Vec<u8>,
    ) -> SyncResult<SnapshotChunkMeta> {
        if let Some(existing) = self
            .db
            .find_snapshot_chunk(
                key.partition_id,
                key.scope_key,
                key.scope,
                key.as_of_commit_seq,
                key.row_cursor,
                key.row_limit,
                "row_frame_v1",
                "gzip",
            )
            .await?
        {
            return Ok(existing);
        }

        let hash = blob_hash("row_frame_v1", "gzip", sha256);
        let byte_length = body.len() as i64;

        if !self.blobs.exists(&hash).await? {
            self.blobs.put(&hash, &body).await?;
        }

        let meta = SnapshotChunkMeta {
            partition_id: key.partition_id,
            table: key.table.to_string(),
            scope_key: key.scope_key.to_string(),
            scope: key.scope.to_string(),
            as_of_commit_seq: key.as_of_commit_seq,
            row_cursor: key.row_cursor.map(str::to_string),
            row_limit: key.row_limit,
            encoding: Encoding::RowFrameV1,
            compression: Compression::Gzip,
            sha256: sha256.to_string(),
            byte_length,
            blob_hash: hash,
            expires_at: Utc::now() + ChronoDuration::hours(CHUNK_TTL_HOURS),
        };

        self.db.upsert_snapshot_chunk(&meta).await?;
        Ok(meta)
    }

    pub async fn read_body(&self, meta: &SnapshotChunkMeta) -> SyncResult<Option<Vec<u8>>> {
        self.blobs.get(&meta.blob_hash).await
    }

    /// Best-effort cleanup: delete expired metadata rows, then delete blobs
    /// that no other metadata row still references.
    pub async fn cleanup_expired(&self) -> SyncResult<usize> {
        let orphaned_blobs = self.db.cleanup_expired_snapshot_chunks().await?;
        let count = orphaned_blobs.len();
        for hash in orphaned_blobs {
            self.blobs.delete(&hash).await?;
        }
        Ok(count)
    }

    /// Evict all cached chunks for the given tables (spec §4.3: external
    /// data change invalidates cached snapshots outright).
    pub async fn evict_tables(&self, tables: &[String]) -> SyncResult<()> {
        self.db.evict_snapshot_chunks_for_tables(tables).await
    }
}
