//! Server push engine (spec §4.1): applies one client commit atomically,
//! emits changes, persists commit metadata, and caches the response for
//! idempotent replay. Grounded on `sync_handler.rs`'s per-message
//! transaction + optimistic-version-check shape, generalized from one
//! hardcoded `documents` table to the handler registry and from
//! whole-document replacement to per-operation application.

use std::sync::Arc;

use syncular_core::dialect::DialectCapabilities;
use syncular_core::errors::ConstraintCode;
use syncular_core::handler::HandlerRegistry;
use syncular_core::models::{Op, PartitionId};
use syncular_core::plugin::{OperationContext, PluginChain};
use syncular_core::protocol::{
    OperationResult, OperationStatus, PushRequest, PushResponse, PushStatus,
};
use syncular_core::{SyncError, SyncResult};
use uuid::Uuid;

use crate::database::{ApplyOutcome, ServerDatabase};

pub struct PushEngine {
    db: Arc<ServerDatabase>,
    handlers: Arc<HandlerRegistry>,
    plugins: Arc<PluginChain>,
}

impl PushEngine {
    pub fn new(db: Arc<ServerDatabase>, handlers: Arc<HandlerRegistry>, plugins: Arc<PluginChain>) -> Self {
        Self { db, handlers, plugins }
    }

    /// Apply a push request for `actor_id` within `partition_id` (spec §4.1).
    #[tracing::instrument(skip(self, request), fields(client_id = %request.client_id, client_commit_id = %request.client_commit_id))]
    pub async fn apply_push(
        &self,
        partition_id: PartitionId,
        actor_id: Uuid,
        request: &PushRequest,
    ) -> SyncResult<PushResponse> {
        if request.client_id.is_empty() || request.client_commit_id.is_empty() {
            return Err(SyncError::InvalidRequest(
                "clientId and clientCommitId are required".into(),
            ));
        }
        if request.operations.is_empty() {
            return Err(SyncError::InvalidRequest("empty commit".into()));
        }

        let mut tx = self.db.begin().await?;

        let commit_seq = match self
            .db
            .insert_commit_placeholder(
                &mut tx,
                partition_id,
                actor_id,
                &request.client_id,
                &request.client_commit_id,
            )
            .await?
        {
            Ok(seq) => seq,
            Err(existing) => {
                tx.rollback().await.ok();
                let mut response: PushResponse = existing
                    .result_json
                    .as_ref()
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .ok_or_else(|| {
                        SyncError::InvalidRequest(
                            "replayed commit has no cached response (idempotency cache miss)"
                                .into(),
                        )
                    })?;
                if response.status == PushStatus::Applied {
                    response.status = PushStatus::Cached;
                }
                tracing::info!(commit_seq = existing.commit_seq, "replayed push via idempotency key");
                return Ok(response);
            }
        };

        let savepoint_supported = self.db.dialect.supports_savepoints();
        if savepoint_supported {
            sqlx::query("SAVEPOINT sync_apply").execute(&mut *tx).await?;
        }

        let mut results = Vec::with_capacity(request.operations.len());
        let mut emitted: Vec<(String, String, Op, Option<serde_json::Value>, i64, syncular_core::models::ScopeMap)> =
            Vec::new();
        let mut affected_tables: Vec<String> = Vec::new();
        let mut rejected_at: Option<usize> = None;

        for (op_index, operation) in request.operations.iter().enumerate() {
            let handler = match self.handlers.get(&operation.table) {
                Ok(h) => h,
                Err(_) => {
                    results.push(OperationResult {
                        op_index,
                        status: OperationStatus::Error,
                        error: Some(format!("unknown table handler: {}", operation.table)),
                        code: Some("UNKNOWN_TABLE".into()),
                        retriable: Some(false),
                        server_version: None,
                        server_row: None,
                    });
                    rejected_at = Some(op_index);
                    break;
                }
            };
            let config = handler.config();

            let mut ctx = OperationContext {
                table: operation.table.clone(),
                row_id: operation.row_id.clone(),
                op: operation.op,
                payload: operation.payload.clone(),
                base_version: operation.base_version,
            };
            self.plugins.run_before(&mut ctx).await?;

            let result = match ctx.op {
                Op::Upsert => {
                    let payload = ctx.payload.clone().ok_or_else(|| {
                        SyncError::InvalidRequest("upsert operation missing payload".into())
                    })?;
                    let scopes = handler.extract_scopes(&payload);
                    let outcome = self
                        .db
                        .apply_upsert(
                            &mut tx,
                            &config.table,
                            &config.primary_key_column,
                            &config.version_column,
                            &ctx.row_id,
                            &payload,
                            ctx.base_version,
                            &scopes,
                        )
                        .await?;
                    match outcome {
                        ApplyOutcome::Applied { row_version, row_json, scopes } => {
                            if scopes.is_empty() {
                                return Err(SyncError::MissingScopes(ctx.table.clone()));
                            }
                            emitted.push((
                                ctx.table.clone(),
                                ctx.row_id.clone(),
                                Op::Upsert,
                                row_json,
                                row_version,
                                scopes,
                            ));
                            if !affected_tables.contains(&ctx.table) {
                                affected_tables.push(ctx.table.clone());
                            }
                            OperationResult {
                                op_index,
                                status: OperationStatus::Applied,
                                error: None,
                                code: None,
                                retriable: None,
                                server_version: Some(row_version),
                                server_row: None,
                            }
                        }
                        ApplyOutcome::Conflict { server_version, server_row } => OperationResult {
                            op_index,
                            status: OperationStatus::Conflict,
                            error: Some("version mismatch".into()),
                            code: Some("VERSION_MISMATCH".into()),
                            retriable: Some(false),
                            server_version: Some(server_version),
                            server_row: Some(server_row),
                        },
                        ApplyOutcome::RowMissing => OperationResult {
                            op_index,
                            status: OperationStatus::Error,
                            error: Some(format!(
                                "row missing for conditional update: {}",
                                ctx.row_id
                            )),
                            code: Some("ROW_MISSING".into()),
                            retriable: Some(false),
                            server_version: None,
                            server_row: None,
                        },
                        ApplyOutcome::ConstraintViolation { code, message } => OperationResult {
                            op_index,
                            status: OperationStatus::Error,
                            error: Some(message),
                            code: Some(constraint_code_wire(code)),
                            retriable: Some(false),
                            server_version: None,
                            server_row: None,
                        },
                    }
                }
                Op::Delete => {
                    let pre_image = self
                        .db
                        .apply_delete(&mut tx, &config.table, &config.primary_key_column, &ctx.row_id)
                        .await?;
                    match pre_image {
                        Some(row) => {
                            let scopes = handler.extract_scopes(&row);
                            if scopes.is_empty() {
                                return Err(SyncError::MissingScopes(ctx.table.clone()));
                            }
                            emitted.push((ctx.table.clone(), ctx.row_id.clone(), Op::Delete, None, 0, scopes));
                            if !affected_tables.contains(&ctx.table) {
                                affected_tables.push(ctx.table.clone());
                            }
                            OperationResult {
                                op_index,
                                status: OperationStatus::Applied,
                                error: None,
                                code: None,
                                retriable: None,
                                server_version: None,
                                server_row: None,
                            }
                        }
                        None => OperationResult {
                            op_index,
                            status: OperationStatus::Applied,
                            error: None,
                            code: None,
                            retriable: None,
                            server_version: None,
                            server_row: None,
                        },
                    }
                }
            };

            self.plugins.run_after(&ctx, &result).await?;

            let is_terminal_failure = result.status != OperationStatus::Applied;
            results.push(result);
            if is_terminal_failure {
                rejected_at = Some(op_index);
                break;
            }
        }

        if rejected_at.is_some() {
            let response = PushResponse {
                ok: true,
                status: PushStatus::Rejected,
                commit_seq: None,
                results,
            };

            if savepoint_supported {
                // Roll back only the failed operations; the commit placeholder
                // row survives so the rejected response is cached for replay.
                sqlx::query("ROLLBACK TO SAVEPOINT sync_apply")
                    .execute(&mut *tx)
                    .await?;
                let result_json = serde_json::to_value(&response)?;
                self.db
                    .finalize_commit(&mut tx, commit_seq, &result_json, 0, &[])
                    .await?;
                tx.commit().await?;
            } else {
                // No savepoint to isolate the failure: the whole transaction,
                // including the commit placeholder, is discarded (spec §5). A
                // retry with the same idempotency key re-inserts cleanly.
                tx.rollback().await?;
            }
            return Ok(response);
        }

        affected_tables.sort();
        affected_tables.dedup();

        self.db.insert_changes_batch(&mut tx, commit_seq, &emitted).await?;
        self.db
            .insert_table_commit_index(&mut tx, partition_id, &affected_tables, commit_seq)
            .await?;

        let response = PushResponse {
            ok: true,
            status: PushStatus::Applied,
            commit_seq: Some(commit_seq),
            results,
        };
        let result_json = serde_json::to_value(&response)?;
        self.db
            .finalize_commit(
                &mut tx,
                commit_seq,
                &result_json,
                emitted.len() as i32,
                &affected_tables,
            )
            .await?;
        tx.commit().await?;

        Ok(response)
    }
}

fn constraint_code_wire(code: ConstraintCode) -> String {
    code.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_code_maps_to_wire_string() {
        assert_eq!(constraint_code_wire(ConstraintCode::UniqueConstraint), "UNIQUE_CONSTRAINT");
    }
}
