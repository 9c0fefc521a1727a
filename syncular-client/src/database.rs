//! Client-side sync metadata store: outbox commits, conflicts, and
//! subscription state. Grounded on the teacher's `ClientDatabase`
//! (`sqlx::SqlitePool` wrapper, `run_migrations`, upsert-by-primary-key
//! queries) but re-keyed around the commit/change model instead of a
//! single mutable `documents` table.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use uuid::Uuid;

use syncular_core::models::{
    BootstrapState, Conflict, ConflictResolution, OutboxCommit, PendingOperation,
    ScopeMap, SubscriptionState,
};
use syncular_core::SyncResult;

pub struct ClientDatabase {
    pub pool: SqlitePool,
}

impl ClientDatabase {
    pub async fn new(database_url: &str) -> SyncResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> SyncResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Ensure a `client_config` row exists, generating a fresh `client_id`
    /// if this is the first run against this database file.
    pub async fn ensure_client_config(&self, server_url: &str) -> SyncResult<String> {
        let existing = sqlx::query("SELECT client_id FROM client_config LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = existing {
            return Ok(row.try_get("client_id")?);
        }

        let client_id = format!("client_{}", Uuid::new_v4());
        sqlx::query("INSERT INTO client_config (client_id, server_url) VALUES (?1, ?2)")
            .bind(&client_id)
            .bind(server_url)
            .execute(&self.pool)
            .await?;
        Ok(client_id)
    }

    pub async fn set_actor_id(&self, client_id: &str, actor_id: Uuid) -> SyncResult<()> {
        sqlx::query("UPDATE client_config SET actor_id = ?1 WHERE client_id = ?2")
            .bind(actor_id.to_string())
            .bind(client_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_actor_id(&self, client_id: &str) -> SyncResult<Option<Uuid>> {
        let row = sqlx::query("SELECT actor_id FROM client_config WHERE client_id = ?1")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let actor_id: Option<String> = row.try_get("actor_id")?;
                Ok(actor_id.map(|id| Uuid::parse_str(&id)).transpose()?)
            }
            None => Ok(None),
        }
    }

    // -- outbox --------------------------------------------------------

    pub async fn enqueue_outbox_commit(
        &self,
        client_commit_id: &str,
        operations: &[PendingOperation],
        schema_version: i32,
    ) -> SyncResult<Uuid> {
        let id = Uuid::new_v4();
        let operations_json = serde_json::to_string(operations)?;
        sqlx::query(
            "INSERT INTO outbox_commits (id, client_commit_id, status, operations_json, schema_version)
             VALUES (?1, ?2, 'pending', ?3, ?4)",
        )
        .bind(id.to_string())
        .bind(client_commit_id)
        .bind(operations_json)
        .bind(schema_version)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Atomically claim the oldest `pending` outbox commit and mark it
    /// `sending`, so a concurrently-running cycle never reclaims it.
    pub async fn claim_next_pending(&self) -> SyncResult<Option<OutboxCommit>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT id FROM outbox_commits WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let id: String = row.try_get("id")?;

        sqlx::query(
            "UPDATE outbox_commits SET status = 'sending', updated_at = datetime('now') WHERE id = ?1",
        )
        .bind(&id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_outbox_commit(&Uuid::parse_str(&id)?).await
    }

    pub async fn get_outbox_commit(&self, id: &Uuid) -> SyncResult<Option<OutboxCommit>> {
        let row = sqlx::query(
            "SELECT id, client_commit_id, status, operations_json, attempt_count,
                    acked_commit_seq, schema_version, created_at, updated_at,
                    last_response_json, error
             FROM outbox_commits WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_outbox_commit).transpose()
    }

    pub async fn mark_outbox_acked(&self, id: &Uuid, acked_commit_seq: i64) -> SyncResult<()> {
        sqlx::query(
            "UPDATE outbox_commits SET status = 'acked', acked_commit_seq = ?2, updated_at = datetime('now')
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(acked_commit_seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_outbox_failed(
        &self,
        id: &Uuid,
        response_json: &serde_json::Value,
    ) -> SyncResult<()> {
        sqlx::query(
            "UPDATE outbox_commits
             SET status = 'failed', attempt_count = attempt_count + 1,
                 last_response_json = ?2, updated_at = datetime('now')
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(serde_json::to_string(response_json)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bumps the attempt counter and returns the commit to `pending` so the
    /// next cycle retries it; used for retriable (non-conflict, non-error)
    /// failures like transport timeouts.
    pub async fn retry_outbox(&self, id: &Uuid, error: &str) -> SyncResult<()> {
        sqlx::query(
            "UPDATE outbox_commits
             SET status = 'pending', attempt_count = attempt_count + 1, error = ?2, updated_at = datetime('now')
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn pending_outbox_count(&self) -> SyncResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM outbox_commits WHERE status IN ('pending', 'sending')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("count")?)
    }

    /// True if `commit_seq` is the server-assigned sequence of one of our
    /// own acked outbox commits, i.e. this client authored it. Used to
    /// learn our own `actor_id` the first time one of our pushes comes
    /// back through a pull response.
    pub async fn has_acked_commit_seq(&self, commit_seq: i64) -> SyncResult<bool> {
        let row = sqlx::query("SELECT 1 FROM outbox_commits WHERE acked_commit_seq = ?1 LIMIT 1")
            .bind(commit_seq)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    // -- conflicts -------------------------------------------------------

    pub async fn insert_conflict(&self, conflict: &Conflict) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO conflicts
                (id, outbox_commit_id, op_index, result_status, code, message,
                 server_version, server_row_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(conflict.id.to_string())
        .bind(conflict.outbox_commit_id.to_string())
        .bind(conflict.op_index)
        .bind(&conflict.result_status)
        .bind(&conflict.code)
        .bind(&conflict.message)
        .bind(conflict.server_version)
        .bind(conflict.server_row_json.as_ref().map(serde_json::to_string).transpose()?)
        .bind(conflict.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_unresolved_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        let rows = sqlx::query(
            "SELECT id, outbox_commit_id, op_index, result_status, code, message,
                    server_version, server_row_json, created_at, resolved_at, resolution_json
             FROM conflicts WHERE resolved_at IS NULL ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_conflict).collect()
    }

    pub async fn resolve_conflict(&self, id: &Uuid, resolution: &ConflictResolution) -> SyncResult<()> {
        let resolution_json = match resolution {
            ConflictResolution::Accept => "\"accept\"".to_string(),
            ConflictResolution::Reject => "\"reject\"".to_string(),
            ConflictResolution::Merge(value) => format!("\"merge:{}\"", value),
        };
        sqlx::query(
            "UPDATE conflicts SET resolved_at = datetime('now'), resolution_json = ?2 WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(resolution_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- subscription state ----------------------------------------------

    pub async fn load_subscription_state(&self, subscription_id: &str) -> SyncResult<Option<SubscriptionState>> {
        let row = sqlx::query(
            "SELECT state_id, subscription_id, table_name, scopes_json, params_json,
                    cursor, bootstrap_state_json, status, created_at, updated_at
             FROM subscription_states WHERE subscription_id = ?1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_subscription_state).transpose()
    }

    pub async fn upsert_subscription_state(&self, state: &SubscriptionState) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO subscription_states
                (state_id, subscription_id, table_name, scopes_json, params_json,
                 cursor, bootstrap_state_json, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))
             ON CONFLICT(subscription_id) DO UPDATE SET
                table_name = excluded.table_name,
                scopes_json = excluded.scopes_json,
                params_json = excluded.params_json,
                cursor = excluded.cursor,
                bootstrap_state_json = excluded.bootstrap_state_json,
                status = excluded.status,
                updated_at = excluded.updated_at",
        )
        .bind(state.state_id.to_string())
        .bind(&state.subscription_id)
        .bind(&state.table)
        .bind(serde_json::to_string(&state.scopes)?)
        .bind(state.params_json.as_ref().map(serde_json::to_string).transpose()?)
        .bind(state.cursor)
        .bind(state.bootstrap_state.as_ref().map(serde_json::to_string).transpose()?)
        .bind(state.status.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- mutation fingerprints --------------------------------------------

    pub async fn touch_fingerprint(&self, table: &str, row_id: &str) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO mutation_fingerprints (table_name, row_id, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(table_name, row_id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(table)
        .bind(row_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_fingerprint(&self, table: &str, row_id: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM mutation_fingerprints WHERE table_name = ?1 AND row_id = ?2")
            .bind(table)
            .bind(row_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_outbox_commit(row: sqlx::sqlite::SqliteRow) -> SyncResult<OutboxCommit> {
    let id: String = row.try_get("id")?;
    let operations_json: String = row.try_get("operations_json")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let last_response_json: Option<String> = row.try_get("last_response_json")?;

    Ok(OutboxCommit {
        id: Uuid::parse_str(&id)?,
        client_commit_id: row.try_get("client_commit_id")?,
        status: status.parse().map_err(|_| {
            syncular_core::SyncError::InvalidRequest(format!("unknown outbox status {status}"))
        })?,
        operations: serde_json::from_str(&operations_json)?,
        attempt_count: row.try_get("attempt_count")?,
        acked_commit_seq: row.try_get("acked_commit_seq")?,
        schema_version: row.try_get("schema_version")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        last_response_json: last_response_json.map(|s| serde_json::from_str(&s)).transpose()?,
        error: row.try_get("error")?,
    })
}

fn parse_conflict(row: sqlx::sqlite::SqliteRow) -> SyncResult<Conflict> {
    let id: String = row.try_get("id")?;
    let outbox_commit_id: String = row.try_get("outbox_commit_id")?;
    let created_at: String = row.try_get("created_at")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;
    let server_row_json: Option<String> = row.try_get("server_row_json")?;
    let resolution_json: Option<String> = row.try_get("resolution_json")?;

    Ok(Conflict {
        id: Uuid::parse_str(&id)?,
        outbox_commit_id: Uuid::parse_str(&outbox_commit_id)?,
        op_index: row.try_get("op_index")?,
        result_status: row.try_get("result_status")?,
        code: row.try_get("code")?,
        message: row.try_get("message")?,
        server_version: row.try_get("server_version")?,
        server_row_json: server_row_json.map(|s| serde_json::from_str(&s)).transpose()?,
        created_at: parse_timestamp(&created_at)?,
        resolved_at: resolved_at.map(|s| parse_timestamp(&s)).transpose()?,
        resolution: resolution_json.map(|s| parse_resolution(&s)).transpose()?,
    })
}

fn parse_resolution(stored: &str) -> SyncResult<ConflictResolution> {
    let stripped = stored.trim_matches('"');
    if stripped == "accept" {
        Ok(ConflictResolution::Accept)
    } else if stripped == "reject" {
        Ok(ConflictResolution::Reject)
    } else if let Some(json) = stripped.strip_prefix("merge:") {
        Ok(ConflictResolution::Merge(serde_json::from_str(json)?))
    } else {
        Err(syncular_core::SyncError::InvalidRequest(format!(
            "unrecognized conflict resolution {stored}"
        )))
    }
}

fn parse_subscription_state(row: sqlx::sqlite::SqliteRow) -> SyncResult<SubscriptionState> {
    let state_id: String = row.try_get("state_id")?;
    let scopes_json: String = row.try_get("scopes_json")?;
    let params_json: Option<String> = row.try_get("params_json")?;
    let bootstrap_state_json: Option<String> = row.try_get("bootstrap_state_json")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(SubscriptionState {
        state_id: Uuid::parse_str(&state_id)?,
        subscription_id: row.try_get("subscription_id")?,
        table: row.try_get("table_name")?,
        scopes: serde_json::from_str::<ScopeMap>(&scopes_json)?,
        params_json: params_json.map(|s| serde_json::from_str(&s)).transpose()?,
        cursor: row.try_get("cursor")?,
        bootstrap_state: bootstrap_state_json
            .map(|s| serde_json::from_str::<BootstrapState>(&s))
            .transpose()?,
        status: status.parse().map_err(|_| {
            syncular_core::SyncError::InvalidRequest(format!("unknown subscription status {status}"))
        })?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn parse_timestamp(s: &str) -> SyncResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // sqlite's `datetime('now')` default yields "YYYY-MM-DD HH:MM:SS" with no
    // offset; treat it as UTC.
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| syncular_core::SyncError::InvalidRequest(format!("bad timestamp {s}: {e}")))?;
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> ClientDatabase {
        let db = ClientDatabase::new("sqlite::memory:").await.unwrap();
        db.run_migrations().await.unwrap();
        db
    }

    #[tokio::test]
    async fn ensure_client_config_is_idempotent() {
        let db = test_db().await;
        let id1 = db.ensure_client_config("http://localhost").await.unwrap();
        let id2 = db.ensure_client_config("http://localhost").await.unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn claim_next_pending_moves_to_sending() {
        let db = test_db().await;
        db.enqueue_outbox_commit("cc1", &[], 1).await.unwrap();

        let claimed = db.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(claimed.status, syncular_core::models::OutboxStatus::Sending);

        // a second claim in the same tick must not pick it up again
        let second = db.claim_next_pending().await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn mark_outbox_acked_records_commit_seq() {
        let db = test_db().await;
        let id = db.enqueue_outbox_commit("cc1", &[], 1).await.unwrap();
        db.claim_next_pending().await.unwrap();
        db.mark_outbox_acked(&id, 42).await.unwrap();

        let commit = db.get_outbox_commit(&id).await.unwrap().unwrap();
        assert_eq!(commit.status, syncular_core::models::OutboxStatus::Acked);
        assert_eq!(commit.acked_commit_seq, Some(42));
    }

    #[tokio::test]
    async fn fingerprint_round_trips() {
        let db = test_db().await;
        db.touch_fingerprint("tasks", "t1").await.unwrap();
        db.clear_fingerprint("tasks", "t1").await.unwrap();
    }
}
