//! Server pull engine (spec §4.2): per-subscription bootstrap-vs-incremental
//! decision, paginated snapshot delivery through the chunk cache, and
//! incremental commit/change batches. New surface -- the teacher's
//! `RequestFullSync`/`GetChangesSince` handlers are stubs -- built from the
//! six-step algorithm, reusing `read_incremental_pull_rows`'s cursor-query
//! shape as its incremental leg.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use syncular_core::handler::HandlerRegistry;
use syncular_core::models::{intersect_scopes, BootstrapState, PartitionId, ScopeMap};
use syncular_core::protocol::{
    ChangeWire, CommitWire, PullRequest, PullResponse, SnapshotChunkRef, SnapshotWire,
    SubscriptionPullResponse, SubscriptionPullStatus, SubscriptionRequest,
};
use syncular_core::snapshot::RowFrameBuilder;
use syncular_core::SyncResult;

use crate::chunk_cache::{ChunkCache, ChunkKey};
use crate::database::ServerDatabase;
use crate::scope_resolver::ScopeResolver;

pub struct PullEngine {
    db: Arc<ServerDatabase>,
    handlers: Arc<HandlerRegistry>,
    resolver: Arc<ScopeResolver>,
    chunks: Arc<ChunkCache>,
}

impl PullEngine {
    pub fn new(
        db: Arc<ServerDatabase>,
        handlers: Arc<HandlerRegistry>,
        resolver: Arc<ScopeResolver>,
        chunks: Arc<ChunkCache>,
    ) -> Self {
        Self { db, handlers, resolver, chunks }
    }

    #[tracing::instrument(skip(self, request), fields(client_id = %request.client_id))]
    pub async fn run_pull(
        &self,
        partition_id: PartitionId,
        actor_id: Uuid,
        request: &PullRequest,
    ) -> SyncResult<PullResponse> {
        let limit_commits = request.effective_limit_commits();
        let limit_snapshot_rows = request.effective_limit_snapshot_rows();
        let max_snapshot_pages = request.effective_max_snapshot_pages();
        let dedupe_rows = request.dedupe_rows();

        let mut memo = HashMap::new();
        let mut subscriptions = Vec::with_capacity(request.subscriptions.len());
        let mut watermark: Option<i64> = None;

        for sub in &request.subscriptions {
            let response = self
                .run_subscription(
                    partition_id,
                    actor_id,
                    sub,
                    limit_commits,
                    limit_snapshot_rows,
                    max_snapshot_pages,
                    dedupe_rows,
                    &mut memo,
                )
                .await?;
            watermark = Some(match watermark {
                Some(w) => w.min(response.next_cursor),
                None => response.next_cursor,
            });
            subscriptions.push(response);
        }

        if let Some(cursor) = watermark {
            let effective_scopes = subscriptions
                .last()
                .map(|s| s.scopes.clone())
                .unwrap_or_default();
            self.db
                .upsert_client_cursor(partition_id, &request.client_id, actor_id, cursor, &effective_scopes)
                .await?;
        }

        Ok(PullResponse { ok: true, subscriptions })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_subscription(
        &self,
        partition_id: PartitionId,
        actor_id: Uuid,
        sub: &SubscriptionRequest,
        limit_commits: u32,
        limit_snapshot_rows: u32,
        max_snapshot_pages: u32,
        dedupe_rows: bool,
        memo: &mut HashMap<(PartitionId, Uuid, String), ScopeMap>,
    ) -> SyncResult<SubscriptionPullResponse> {
        // Step 1+errors: scope resolution errors revoke only this subscription.
        let allowed = match self.resolver.resolve(memo, partition_id, actor_id, &sub.table).await {
            Ok(scopes) => scopes,
            Err(err) => {
                tracing::warn!(table = %sub.table, error = %err, "scope resolution failed, revoking subscription");
                return Ok(SubscriptionPullResponse {
                    id: sub.id.clone(),
                    status: SubscriptionPullStatus::Revoked,
                    scopes: ScopeMap::new(),
                    bootstrap: false,
                    bootstrap_state: None,
                    next_cursor: sub.cursor,
                    commits: Vec::new(),
                    snapshots: None,
                });
            }
        };

        // Step 2: scope intersection.
        let effective = intersect_scopes(&sub.scopes, &allowed);
        if effective.is_empty() {
            return Ok(SubscriptionPullResponse {
                id: sub.id.clone(),
                status: SubscriptionPullStatus::Revoked,
                scopes: ScopeMap::new(),
                bootstrap: false,
                bootstrap_state: None,
                next_cursor: sub.cursor,
                commits: Vec::new(),
                snapshots: None,
            });
        }

        // Step 3: bootstrap decision.
        let max_commit_seq = self.db.max_commit_seq(partition_id).await?;
        let min_commit_seq = self.db.min_retained_commit_seq(partition_id).await?;
        let external_since =
            self.db.has_external_commit_since(partition_id, &sub.table, sub.cursor).await?;
        let needs_bootstrap = sub.bootstrap_state.is_some()
            || sub.cursor < 0
            || sub.cursor > max_commit_seq
            || sub.cursor < min_commit_seq - 1
            || external_since;

        if needs_bootstrap {
            return self
                .run_bootstrap(
                    partition_id,
                    sub,
                    &effective,
                    max_commit_seq,
                    limit_snapshot_rows,
                    max_snapshot_pages,
                )
                .await;
        }

        // Step 5: incremental.
        self.run_incremental(partition_id, sub, &effective, limit_commits, dedupe_rows).await
    }

    async fn run_bootstrap(
        &self,
        partition_id: PartitionId,
        sub: &SubscriptionRequest,
        effective: &ScopeMap,
        max_commit_seq: i64,
        limit_snapshot_rows: u32,
        max_snapshot_pages: u32,
    ) -> SyncResult<SubscriptionPullResponse> {
        let mut state = sub.bootstrap_state.clone().unwrap_or_else(|| BootstrapState {
            as_of_commit_seq: max_commit_seq,
            tables: dependency_closure(&self.handlers, &sub.table),
            table_index: 0,
            row_cursor: None,
        });

        let scope_key = effective
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "*".to_string());
        let scope_repr = serde_json::to_string(effective).unwrap_or_default();

        let mut snapshots = Vec::new();
        let mut pages_used = 0u32;

        while (state.table_index as usize) < state.tables.len() && pages_used < max_snapshot_pages {
            let table = state.tables[state.table_index as usize].clone();
            let handler = self.handlers.get(&table)?;
            let is_first_page = state.row_cursor.is_none();

            let rows = handler
                .snapshot(effective, state.row_cursor.as_deref(), limit_snapshot_rows)
                .await?;
            let is_last_page = rows.len() < limit_snapshot_rows as usize;

            let mut builder = RowFrameBuilder::new();
            let mut last_row_id = None;
            for row in &rows {
                builder.push_row(&row.row_json)?;
                last_row_id = Some(row.row_id.clone());
            }
            let encoded = builder.finish()?;
            pages_used += 1;

            let meta = self
                .chunks
                .get_or_store(
                    ChunkKey {
                        partition_id,
                        table: &table,
                        scope_key: &scope_key,
                        scope: &scope_repr,
                        as_of_commit_seq: state.as_of_commit_seq,
                        row_cursor: state.row_cursor.as_deref(),
                        row_limit: limit_snapshot_rows as i32,
                    },
                    &encoded.sha256,
                    encoded.body,
                )
                .await?;

            snapshots.push(SnapshotWire {
                table: table.clone(),
                chunks: vec![SnapshotChunkRef {
                    id: meta.blob_hash.clone(),
                    sha256: meta.sha256.clone(),
                    byte_length: meta.byte_length,
                    encoding: meta.encoding,
                    compression: meta.compression,
                }],
                rows: None,
                is_first_page,
                is_last_page,
            });

            if is_last_page {
                state.table_index += 1;
                state.row_cursor = None;
            } else {
                state.row_cursor = last_row_id;
            }
        }

        let fully_drained = state.table_index as usize >= state.tables.len();
        let (bootstrap_state, next_cursor) =
            if fully_drained { (None, state.as_of_commit_seq) } else { (Some(state), sub.cursor) };

        Ok(SubscriptionPullResponse {
            id: sub.id.clone(),
            status: SubscriptionPullStatus::Active,
            scopes: effective.clone(),
            bootstrap: true,
            bootstrap_state,
            next_cursor,
            commits: Vec::new(),
            snapshots: Some(snapshots),
        })
    }

    async fn run_incremental(
        &self,
        partition_id: PartitionId,
        sub: &SubscriptionRequest,
        effective: &ScopeMap,
        limit_commits: u32,
        dedupe_rows: bool,
    ) -> SyncResult<SubscriptionPullResponse> {
        let commit_seqs = self
            .db
            .commit_seqs_since(partition_id, &sub.table, sub.cursor, limit_commits)
            .await?;

        if commit_seqs.is_empty() {
            return Ok(SubscriptionPullResponse {
                id: sub.id.clone(),
                status: SubscriptionPullStatus::Active,
                scopes: effective.clone(),
                bootstrap: false,
                bootstrap_state: None,
                next_cursor: sub.cursor,
                commits: Vec::new(),
                snapshots: None,
            });
        }

        let next_cursor = *commit_seqs.iter().max().unwrap();
        let rows = self.db.read_incremental_pull_rows(&sub.table, &commit_seqs).await?;

        let mut visible: Vec<(i64, chrono::DateTime<chrono::Utc>, Uuid, ChangeWire)> = Vec::new();
        for (commit, change) in rows {
            if intersect_scopes(&change.scopes, effective).is_empty() {
                continue;
            }
            visible.push((
                commit.commit_seq,
                commit.created_at,
                commit.actor_id,
                ChangeWire {
                    change_id: change.change_id,
                    table: change.table,
                    row_id: change.row_id,
                    op: change.op,
                    row_json: change.row_json,
                    row_version: change.row_version,
                    scopes: change.scopes,
                },
            ));
        }

        if dedupe_rows {
            let mut latest: HashMap<String, usize> = HashMap::new();
            for (idx, (_, _, _, change)) in visible.iter().enumerate() {
                latest.insert(change.row_id.clone(), idx);
            }
            let mut kept_indices: Vec<usize> = latest.values().copied().collect();
            kept_indices.sort_unstable();
            visible = kept_indices.into_iter().map(|i| visible[i].clone()).collect();
        }

        let mut commits: Vec<CommitWire> = Vec::new();
        for (commit_seq, created_at, actor_id, change) in visible {
            match commits.last_mut() {
                Some(last) if last.commit_seq == commit_seq => last.changes.push(change),
                _ => commits.push(CommitWire { commit_seq, created_at, actor_id, changes: vec![change] }),
            }
        }

        Ok(SubscriptionPullResponse {
            id: sub.id.clone(),
            status: SubscriptionPullStatus::Active,
            scopes: effective.clone(),
            bootstrap: false,
            bootstrap_state: None,
            next_cursor,
            commits,
            snapshots: None,
        })
    }
}

/// Dependency-ordered table list for a bootstrap thread: `root`'s
/// transitive `dependsOn` closure, dependencies first, root last.
fn dependency_closure(registry: &HandlerRegistry, root: &str) -> Vec<String> {
    let mut order = Vec::new();
    let mut seen = std::collections::HashSet::new();
    fn visit(
        registry: &HandlerRegistry,
        table: &str,
        seen: &mut std::collections::HashSet<String>,
        order: &mut Vec<String>,
    ) {
        if !seen.insert(table.to_string()) {
            return;
        }
        if let Ok(handler) = registry.get(table) {
            for dep in &handler.config().depends_on {
                visit(registry, dep, seen, order);
            }
        }
        order.push(table.to_string());
    }
    visit(registry, root, &mut seen, &mut order);
    order
}
