//! Postgres-backed store for the commit/change log. Mirrors the teacher's
//! `ServerDatabase` (a pool plus a handful of transaction-aware methods);
//! generalized from one hardcoded `documents` table to the table-agnostic
//! commit/change model. SQLite is supported at the `DialectCapabilities`
//! level but, like the teacher, only Postgres gets a full reference
//! implementation here.

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use syncular_core::dialect::{decode_scopes_json, encode_scopes_json, DialectCapabilities};
use syncular_core::errors::{classify_constraint_violation, ConstraintCode};
use syncular_core::models::{
    Change, ClientCursor, Commit, Compression, Encoding, Op, PartitionId, ScopeMap,
    SnapshotChunkMeta,
};
use syncular_core::{SyncError, SyncResult};
use tracing::instrument;
use uuid::Uuid;

pub struct PostgresDialect;

impl DialectCapabilities for PostgresDialect {
    fn supports_savepoints(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

pub struct ServerDatabase {
    pub pool: PgPool,
    pub dialect: PostgresDialect,
}

/// Outcome of applying a single operation, before it becomes a wire
/// [`syncular_core::protocol::OperationResult`].
pub enum ApplyOutcome {
    Applied { row_version: i64, row_json: Option<serde_json::Value>, scopes: ScopeMap },
    Conflict { server_version: i64, server_row: serde_json::Value },
    RowMissing,
    ConstraintViolation { code: ConstraintCode, message: String },
}

impl ServerDatabase {
    #[instrument(skip(database_url))]
    pub async fn new(database_url: &str) -> SyncResult<Self> {
        let max_connections = if std::env::var("RUN_INTEGRATION_TESTS").is_ok() {
            3
        } else {
            10
        };

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .max_lifetime(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        Ok(Self { pool, dialect: PostgresDialect })
    }

    pub async fn new_with_options(database_url: &str, max_connections: u32) -> SyncResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .max_lifetime(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool, dialect: PostgresDialect })
    }

    pub async fn run_migrations(&self) -> SyncResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn begin(&self) -> SyncResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Attempt to insert a new commit placeholder row. On a unique-constraint
    /// clash on `(partition_id, client_id, client_commit_id)`, loads the
    /// existing row instead (spec §4.1). If the existing row's `result_json`
    /// is still null (a previous attempt crashed after placeholder insert but
    /// before finalize), the stale row is deleted and the insert retried --
    /// Postgres transactions are strong enough that this should not occur in
    /// practice, but the deletion keeps the contract in spec §5's "fallback"
    /// wording honest for dialects without the same guarantee.
    pub async fn insert_commit_placeholder(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        partition_id: PartitionId,
        actor_id: Uuid,
        client_id: &str,
        client_commit_id: &str,
    ) -> SyncResult<Result<i64, Commit>> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO sync_commits (partition_id, actor_id, client_id, client_commit_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (partition_id, client_id, client_commit_id) DO NOTHING
            RETURNING commit_seq
            "#,
        )
        .bind(partition_id.0)
        .bind(actor_id)
        .bind(client_id)
        .bind(client_commit_id)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row) = inserted {
            return Ok(Ok(row.try_get::<i64, _>("commit_seq")?));
        }

        let existing = self
            .load_commit_by_idempotency_key(tx, partition_id, client_id, client_commit_id)
            .await?;

        match existing {
            Some(commit) if commit.result_json.is_none() => {
                sqlx::query("DELETE FROM sync_commits WHERE commit_seq = $1")
                    .bind(commit.commit_seq)
                    .execute(&mut **tx)
                    .await?;
                let row = sqlx::query(
                    r#"
                    INSERT INTO sync_commits (partition_id, actor_id, client_id, client_commit_id)
                    VALUES ($1, $2, $3, $4)
                    RETURNING commit_seq
                    "#,
                )
                .bind(partition_id.0)
                .bind(actor_id)
                .bind(client_id)
                .bind(client_commit_id)
                .fetch_one(&mut **tx)
                .await?;
                Ok(Ok(row.try_get::<i64, _>("commit_seq")?))
            }
            Some(commit) => Ok(Err(commit)),
            None => Err(SyncError::InvalidRequest(
                "commit insert conflicted but no existing row found".into(),
            )),
        }
    }

    async fn load_commit_by_idempotency_key(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        partition_id: PartitionId,
        client_id: &str,
        client_commit_id: &str,
    ) -> SyncResult<Option<Commit>> {
        let row = sqlx::query(
            r#"
            SELECT commit_seq, partition_id, actor_id, client_id, client_commit_id,
                   created_at, result_json, change_count, affected_tables
            FROM sync_commits
            WHERE partition_id = $1 AND client_id = $2 AND client_commit_id = $3
            "#,
        )
        .bind(partition_id.0)
        .bind(client_id)
        .bind(client_commit_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|r| row_to_commit(&r)).transpose()
    }

    /// Apply a single upsert using the table/version-column conventions
    /// named by the handler's config (spec §4.1 `applyOperation` default).
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_upsert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        primary_key_column: &str,
        version_column: &str,
        row_id: &str,
        payload: &serde_json::Value,
        base_version: Option<i64>,
        scopes: &ScopeMap,
    ) -> SyncResult<ApplyOutcome> {
        if let Some(expected) = base_version {
            let sql = format!(
                "UPDATE {table} SET row_json = $1, {version_column} = {version_column} + 1 \
                 WHERE {primary_key_column} = $2 AND {version_column} = $3 \
                 RETURNING {version_column}"
            );
            let updated = sqlx::query(&sql)
                .bind(payload)
                .bind(row_id)
                .bind(expected)
                .fetch_optional(&mut **tx)
                .await?;

            if let Some(row) = updated {
                let new_version: i64 = row.try_get(version_column.as_str())?;
                return Ok(ApplyOutcome::Applied {
                    row_version: new_version,
                    row_json: Some(payload.clone()),
                    scopes: scopes.clone(),
                });
            }

            let current_sql = format!(
                "SELECT row_json, {version_column} FROM {table} WHERE {primary_key_column} = $1"
            );
            let current = sqlx::query(&current_sql)
                .bind(row_id)
                .fetch_optional(&mut **tx)
                .await?;

            return match current {
                None => Ok(ApplyOutcome::RowMissing),
                Some(row) => {
                    let server_version: i64 = row.try_get(version_column.as_str())?;
                    let server_row: serde_json::Value = row.try_get("row_json")?;
                    Ok(ApplyOutcome::Conflict { server_version, server_row })
                }
            };
        }

        let sql = format!(
            "UPDATE {table} SET row_json = $1, {version_column} = {version_column} + 1 \
             WHERE {primary_key_column} = $2 \
             RETURNING {version_column}"
        );
        let updated = sqlx::query(&sql)
            .bind(payload)
            .bind(row_id)
            .fetch_optional(&mut **tx)
            .await?;

        if let Some(row) = updated {
            let new_version: i64 = row.try_get(version_column.as_str())?;
            return Ok(ApplyOutcome::Applied {
                row_version: new_version,
                row_json: Some(payload.clone()),
                scopes: scopes.clone(),
            });
        }

        let insert_sql = format!(
            "INSERT INTO {table} ({primary_key_column}, row_json, {version_column}) \
             VALUES ($1, $2, 1)"
        );
        match sqlx::query(&insert_sql)
            .bind(row_id)
            .bind(payload)
            .execute(&mut **tx)
            .await
        {
            Ok(_) => Ok(ApplyOutcome::Applied {
                row_version: 1,
                row_json: Some(payload.clone()),
                scopes: scopes.clone(),
            }),
            Err(err) => {
                let code = classify_constraint_violation(&err);
                Ok(ApplyOutcome::ConstraintViolation { code, message: err.to_string() })
            }
        }
    }

    /// Delete by primary key, returning the pre-image's scopes via the
    /// caller-supplied extractor so the emitted change still routes
    /// correctly to subscribers (spec §4.1).
    pub async fn apply_delete(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        primary_key_column: &str,
        row_id: &str,
    ) -> SyncResult<Option<serde_json::Value>> {
        let select_sql = format!("SELECT row_json FROM {table} WHERE {primary_key_column} = $1");
        let existing = sqlx::query(&select_sql)
            .bind(row_id)
            .fetch_optional(&mut **tx)
            .await?;

        let Some(row) = existing else {
            return Ok(None);
        };
        let pre_image: serde_json::Value = row.try_get("row_json")?;

        let delete_sql = format!("DELETE FROM {table} WHERE {primary_key_column} = $1");
        sqlx::query(&delete_sql).bind(row_id).execute(&mut **tx).await?;

        Ok(Some(pre_image))
    }

    pub async fn insert_changes_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        commit_seq: i64,
        changes: &[(String, String, Op, Option<serde_json::Value>, i64, ScopeMap)],
    ) -> SyncResult<()> {
        for (table, row_id, op, row_json, row_version, scopes) in changes {
            sqlx::query(
                r#"
                INSERT INTO sync_changes (commit_seq, table_name, row_id, op, row_json, row_version, scopes)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(commit_seq)
            .bind(table)
            .bind(row_id)
            .bind(op.to_string())
            .bind(row_json)
            .bind(row_version)
            .bind(encode_scopes_json(scopes))
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    pub async fn insert_table_commit_index(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        partition_id: PartitionId,
        tables: &[String],
        commit_seq: i64,
    ) -> SyncResult<()> {
        for table in tables {
            sqlx::query(
                r#"
                INSERT INTO sync_table_commits (partition_id, table_name, commit_seq)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(partition_id.0)
            .bind(table)
            .bind(commit_seq)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    pub async fn finalize_commit(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        commit_seq: i64,
        result_json: &serde_json::Value,
        change_count: i32,
        affected_tables: &[String],
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_commits
            SET result_json = $2, change_count = $3, affected_tables = $4
            WHERE commit_seq = $1
            "#,
        )
        .bind(commit_seq)
        .bind(result_json)
        .bind(change_count)
        .bind(affected_tables)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn max_commit_seq(&self, partition_id: PartitionId) -> SyncResult<i64> {
        let seq: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(commit_seq) FROM sync_table_commits WHERE partition_id = $1",
        )
        .bind(partition_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(seq.unwrap_or(0))
    }

    pub async fn min_retained_commit_seq(&self, partition_id: PartitionId) -> SyncResult<i64> {
        let seq: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(cursor) FROM sync_client_cursors WHERE partition_id = $1",
        )
        .bind(partition_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(seq.unwrap_or(0))
    }

    /// Table-commit index lookup: up to `limit` commit sequences after
    /// `cursor` for this table (spec §4.2 step 5).
    pub async fn commit_seqs_since(
        &self,
        partition_id: PartitionId,
        table: &str,
        cursor: i64,
        limit: u32,
    ) -> SyncResult<Vec<i64>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT commit_seq FROM sync_table_commits
            WHERE partition_id = $1 AND table_name = $2 AND commit_seq > $3
            ORDER BY commit_seq ASC
            LIMIT $4
            "#,
        )
        .bind(partition_id.0)
        .bind(table)
        .bind(cursor)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Whether an external-data-change commit newer than `cursor` touched
    /// `table` (spec §4.2 step 3, §4.3).
    pub async fn has_external_commit_since(
        &self,
        partition_id: PartitionId,
        table: &str,
        cursor: i64,
    ) -> SyncResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM sync_table_commits tc
                JOIN sync_commits c ON c.commit_seq = tc.commit_seq
                WHERE tc.partition_id = $1 AND tc.table_name = $2 AND tc.commit_seq > $3
                  AND c.client_id = $4
            )
            "#,
        )
        .bind(partition_id.0)
        .bind(table)
        .bind(cursor)
        .bind(Commit::EXTERNAL_CLIENT_ID)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Stream changes for the given commit sequences, joined with their
    /// commit metadata, batched at most 500 rows at a time (spec §4.2).
    pub async fn read_incremental_pull_rows(
        &self,
        table: &str,
        commit_seqs: &[i64],
    ) -> SyncResult<Vec<(Commit, Change)>> {
        if commit_seqs.is_empty() {
            return Ok(Vec::new());
        }
        let batch: &[i64] = if commit_seqs.len() > 500 { &commit_seqs[..500] } else { commit_seqs };

        let rows = sqlx::query(
            r#"
            SELECT c.commit_seq, c.partition_id, c.actor_id, c.client_id, c.client_commit_id,
                   c.created_at, c.result_json, c.change_count, c.affected_tables,
                   ch.change_id, ch.op, ch.row_json, ch.row_version, ch.scopes, ch.row_id
            FROM sync_changes ch
            JOIN sync_commits c ON c.commit_seq = ch.commit_seq
            WHERE ch.table_name = $1 AND ch.commit_seq = ANY($2)
            ORDER BY ch.commit_seq ASC, ch.change_id ASC
            "#,
        )
        .bind(table)
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let commit = row_to_commit(&row)?;
            let change = Change {
                change_id: row.try_get("change_id")?,
                commit_seq: row.try_get("commit_seq")?,
                table: table.to_string(),
                row_id: row.try_get("row_id")?,
                op: row.try_get::<String, _>("op")?.parse().map_err(|_| {
                    SyncError::InvalidRequest("unrecognized op in sync_changes".into())
                })?,
                row_json: row.try_get("row_json")?,
                row_version: row.try_get("row_version")?,
                scopes: decode_scopes_json(row.try_get("scopes")?),
            };
            out.push((commit, change));
        }
        Ok(out)
    }

    pub async fn upsert_client_cursor(
        &self,
        partition_id: PartitionId,
        client_id: &str,
        actor_id: Uuid,
        cursor: i64,
        effective_scopes: &ScopeMap,
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_client_cursors (partition_id, client_id, actor_id, cursor, effective_scopes, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (partition_id, client_id) DO UPDATE
            SET cursor = EXCLUDED.cursor, effective_scopes = EXCLUDED.effective_scopes, updated_at = NOW()
            "#,
        )
        .bind(partition_id.0)
        .bind(client_id)
        .bind(actor_id)
        .bind(cursor)
        .bind(encode_scopes_json(effective_scopes))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_client_cursor(
        &self,
        partition_id: PartitionId,
        client_id: &str,
    ) -> SyncResult<Option<ClientCursor>> {
        let row = sqlx::query(
            r#"
            SELECT partition_id, client_id, actor_id, cursor, effective_scopes, updated_at
            FROM sync_client_cursors
            WHERE partition_id = $1 AND client_id = $2
            "#,
        )
        .bind(partition_id.0)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(ClientCursor {
                partition_id: PartitionId(r.try_get("partition_id")?),
                client_id: r.try_get("client_id")?,
                actor_id: r.try_get("actor_id")?,
                cursor: r.try_get("cursor")?,
                effective_scopes: decode_scopes_json(r.try_get("effective_scopes")?),
                updated_at: r.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    /// Find an existing snapshot chunk by its content-address key (spec §4.5).
    #[allow(clippy::too_many_arguments)]
    pub async fn find_snapshot_chunk(
        &self,
        partition_id: PartitionId,
        scope_key: &str,
        scope: &str,
        as_of_commit_seq: i64,
        row_cursor: Option<&str>,
        row_limit: i32,
        encoding: &str,
        compression: &str,
    ) -> SyncResult<Option<SnapshotChunkMeta>> {
        let row = sqlx::query(
            r#"
            SELECT partition_id, table_name, scope_key, scope, as_of_commit_seq, row_cursor, row_limit,
                   encoding, compression, sha256, byte_length, blob_hash, expires_at
            FROM sync_snapshot_chunks
            WHERE partition_id = $1 AND scope_key = $2 AND scope = $3 AND as_of_commit_seq = $4
              AND row_cursor IS NOT DISTINCT FROM $5 AND row_limit = $6
              AND encoding = $7 AND compression = $8
            "#,
        )
        .bind(partition_id.0)
        .bind(scope_key)
        .bind(scope)
        .bind(as_of_commit_seq)
        .bind(row_cursor)
        .bind(row_limit)
        .bind(encoding)
        .bind(compression)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_snapshot_chunk).transpose()
    }

    /// Upsert snapshot chunk metadata (spec §4.5 step 3): on conflict,
    /// refresh `expires_at`/`blob_hash` rather than erroring.
    pub async fn upsert_snapshot_chunk(&self, meta: &SnapshotChunkMeta) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_snapshot_chunks
                (partition_id, table_name, scope_key, scope, as_of_commit_seq, row_cursor, row_limit,
                 encoding, compression, sha256, byte_length, blob_hash, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (partition_id, scope_key, scope, as_of_commit_seq, row_cursor, row_limit, encoding, compression)
            DO UPDATE SET expires_at = EXCLUDED.expires_at, blob_hash = EXCLUDED.blob_hash
            "#,
        )
        .bind(meta.partition_id.0)
        .bind(&meta.table)
        .bind(&meta.scope_key)
        .bind(&meta.scope)
        .bind(meta.as_of_commit_seq)
        .bind(&meta.row_cursor)
        .bind(meta.row_limit)
        .bind(meta.encoding.to_string())
        .bind(meta.compression.to_string())
        .bind(&meta.sha256)
        .bind(meta.byte_length)
        .bind(&meta.blob_hash)
        .bind(meta.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete expired metadata rows, returning the `blob_hash`es that are no
    /// longer referenced by any remaining row (safe to delete from the blob
    /// store too). Spec §4.5: "a blob may still be referenced by another
    /// metadata row."
    pub async fn cleanup_expired_snapshot_chunks(&self) -> SyncResult<Vec<String>> {
        let mut tx = self.begin().await?;
        let expired: Vec<String> = sqlx::query_scalar(
            "DELETE FROM sync_snapshot_chunks WHERE expires_at <= NOW() RETURNING blob_hash",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut orphaned = Vec::new();
        for blob_hash in expired {
            let still_referenced: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM sync_snapshot_chunks WHERE blob_hash = $1)",
            )
            .bind(&blob_hash)
            .fetch_one(&mut *tx)
            .await?;
            if !still_referenced {
                orphaned.push(blob_hash);
            }
        }
        tx.commit().await?;
        Ok(orphaned)
    }

    /// Delete all cached snapshot chunk metadata for the given tables --
    /// used by external-change notification (spec §4.3) which evicts cached
    /// chunks wholesale rather than waiting for `expires_at`.
    pub async fn evict_snapshot_chunks_for_tables(&self, tables: &[String]) -> SyncResult<()> {
        if tables.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM sync_snapshot_chunks WHERE table_name = ANY($1)")
            .bind(tables)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a synthetic external-data-change commit (spec §4.3).
    pub async fn record_external_commit(
        &self,
        partition_id: PartitionId,
        affected_tables: &[String],
    ) -> SyncResult<i64> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO sync_commits (partition_id, actor_id, client_id, client_commit_id, result_json, change_count, affected_tables)
            VALUES ($1, $2, $3, $4, $5, 0, $6)
            RETURNING commit_seq
            "#,
        )
        .bind(partition_id.0)
        .bind(Uuid::nil())
        .bind(Commit::EXTERNAL_CLIENT_ID)
        .bind(Uuid::new_v4().to_string())
        .bind(serde_json::json!({"status": "external"}))
        .bind(affected_tables)
        .fetch_one(&mut *tx)
        .await?;
        let commit_seq: i64 = row.try_get("commit_seq")?;

        self.insert_table_commit_index(&mut tx, partition_id, affected_tables, commit_seq)
            .await?;

        tx.commit().await?;

        Ok(commit_seq)
    }
}

fn row_to_commit(row: &sqlx::postgres::PgRow) -> SyncResult<Commit> {
    Ok(Commit {
        commit_seq: row.try_get("commit_seq")?,
        partition_id: PartitionId(row.try_get("partition_id")?),
        actor_id: row.try_get("actor_id")?,
        client_id: row.try_get("client_id")?,
        client_commit_id: row.try_get("client_commit_id")?,
        created_at: row.try_get("created_at")?,
        result_json: row.try_get("result_json")?,
        change_count: row.try_get("change_count")?,
        affected_tables: row.try_get("affected_tables")?,
    })
}

fn row_to_snapshot_chunk(row: sqlx::postgres::PgRow) -> SyncResult<SnapshotChunkMeta> {
    let encoding: String = row.try_get("encoding")?;
    let compression: String = row.try_get("compression")?;
    Ok(SnapshotChunkMeta {
        partition_id: PartitionId(row.try_get("partition_id")?),
        table: row.try_get("table_name")?,
        scope_key: row.try_get("scope_key")?,
        scope: row.try_get("scope")?,
        as_of_commit_seq: row.try_get("as_of_commit_seq")?,
        row_cursor: row.try_get("row_cursor")?,
        row_limit: row.try_get("row_limit")?,
        encoding: encoding.parse::<Encoding>().map_err(|_| {
            SyncError::InvalidRequest("unrecognized snapshot chunk encoding".into())
        })?,
        compression: compression.parse::<Compression>().map_err(|_| {
            SyncError::InvalidRequest("unrecognized snapshot chunk compression".into())
        })?,
        sha256: row.try_get("sha256")?,
        byte_length: row.try_get("byte_length")?,
        blob_hash: row.try_get("blob_hash")?,
        expires_at: row.try_get("expires_at")?,
    })
}
