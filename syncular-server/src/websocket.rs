//! Realtime transport (spec §7): a websocket carries `RealtimeClientMessage`/
//! `RealtimeServerMessage` envelopes -- auth handshake, inline pushes, and
//! presence -- while cross-client wake-up notifications ride the same
//! connection registry the teacher's `websocket.rs` already builds. Pull
//! itself stays HTTP; the socket's job is "something changed, go pull."

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;

use syncular_core::protocol::{
    ChangeWire, PushResponseEventData, RealtimeClientMessage, RealtimeServerMessage, SyncEventData,
};

use crate::AppState;

/// Parse a `"<api_key>.<timestamp>.<signature>"` bearer token and resolve it
/// to an actor id, signing over an empty body (the handshake carries no
/// payload beyond the token itself).
async fn authenticate_token(state: &AppState, token: &str) -> Option<Uuid> {
    let mut parts = token.splitn(3, '.');
    let api_key = parts.next()?;
    let timestamp: i64 = parts.next()?.parse().ok()?;
    let signature = parts.next()?;
    state
        .auth
        .verify_hmac(api_key, signature, timestamp, "")
        .await
        .ok()
        .flatten()
}

pub async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4().to_string();
    if let Some(ref monitoring) = state.monitoring {
        monitoring.log_client_connected(&connection_id).await;
    }

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<RealtimeServerMessage>(100);

    let monitoring_clone = state.monitoring.clone();
    let connection_id_clone = connection_id.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Some(ref monitoring) = monitoring_clone {
                monitoring.log_message_sent(&connection_id_clone, msg.clone()).await;
            }
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(err) => {
                    tracing::error!(error = %err, "failed to serialize realtime message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let mut authenticated_actor: Option<Uuid> = None;
    let mut registered_client: Option<String> = None;
    let partition_id = state.default_partition;

    while let Some(msg) = receiver.next().await {
        let Ok(Message::Text(text)) = msg else { continue };
        let parsed: Result<RealtimeClientMessage, _> = serde_json::from_str(&text);
        let client_msg = match parsed {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!(error = %err, "invalid realtime message");
                continue;
            }
        };

        if let Some(ref monitoring) = state.monitoring {
            monitoring.log_message_received(&connection_id, client_msg.clone()).await;
        }

        match client_msg {
            RealtimeClientMessage::Auth { token } => match authenticate_token(&state, &token).await {
                Some(actor_id) => {
                    authenticated_actor = Some(actor_id);
                    let client_id = connection_id.clone();
                    registered_client = Some(client_id.clone());
                    state.clients.insert((actor_id, client_id.clone()), tx.clone());
                    state
                        .actor_clients
                        .entry(actor_id)
                        .and_modify(|clients| {
                            clients.insert(client_id.clone());
                        })
                        .or_insert_with(|| {
                            let mut set = HashSet::new();
                            set.insert(client_id);
                            set
                        });
                }
                None => {
                    tracing::warn!("realtime auth failed");
                    break;
                }
            },
            RealtimeClientMessage::Push {
                request_id,
                client_commit_id,
                operations,
                schema_version,
            } => {
                let Some(actor_id) = authenticated_actor else {
                    break;
                };
                let request = syncular_core::protocol::PushRequest {
                    client_id: registered_client.clone().unwrap_or_default(),
                    client_commit_id,
                    schema_version,
                    operations,
                };
                match state.push_engine.apply_push(partition_id, actor_id, &request).await {
                    Ok(response) => {
                        if let Some(ref monitoring) = state.monitoring {
                            if let Some(seq) = response.commit_seq {
                                monitoring.log_commit_applied(seq, response.results.len()).await;
                            }
                        }
                        let event = RealtimeServerMessage::PushResponse {
                            data: PushResponseEventData {
                                request_id,
                                ok: response.ok,
                                status: response.status,
                                commit_seq: response.commit_seq,
                                results: response.results,
                                timestamp: chrono::Utc::now(),
                            },
                        };
                        let _ = tx.send(event).await;
                        let tables: Vec<String> = request
                            .operations
                            .iter()
                            .map(|o| o.table.clone())
                            .collect::<HashSet<_>>()
                            .into_iter()
                            .collect();
                        broadcast_sync_notice(&state, actor_id, &registered_client, response.commit_seq, &tables)
                            .await;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "push over websocket failed");
                    }
                }
            }
            RealtimeClientMessage::Presence { action, scope_key, metadata } => {
                let Some(actor_id) = authenticated_actor else {
                    break;
                };
                broadcast_presence(&state, actor_id, &registered_client, action, scope_key, metadata)
                    .await;
            }
        }
    }

    forward_task.abort();

    if let (Some(actor_id), Some(client_id)) = (authenticated_actor, registered_client) {
        state.clients.remove(&(actor_id, client_id.clone()));
        if let Some(mut clients) = state.actor_clients.get_mut(&actor_id) {
            clients.remove(&client_id);
            if clients.is_empty() {
                drop(clients);
                state.actor_clients.remove(&actor_id);
            }
        }
    }

    if let Some(ref monitoring) = state.monitoring {
        monitoring.log_client_disconnected(&connection_id).await;
    }
}

/// Nudge every other connection belonging to this actor that new commits
/// may be waiting. When the pushed commit's changes fit on the wire, they
/// ride along inline (`cursor`/`changes` populated) so a receiver with an
/// otherwise-empty outbox can apply them directly instead of round-tripping
/// through HTTP pull; a receiver that can't take the inline path just
/// treats the envelope as a wake-up and pulls as usual.
async fn broadcast_sync_notice(
    state: &AppState,
    actor_id: Uuid,
    exclude_client: &Option<String>,
    commit_seq: Option<i64>,
    tables: &[String],
) {
    let client_ids: Vec<String> = match state.actor_clients.get(&actor_id) {
        Some(clients) if !clients.is_empty() => clients.iter().cloned().collect(),
        _ => return,
    };

    let changes = match commit_seq {
        Some(seq) => fetch_commit_changes(state, seq, tables).await,
        None => Vec::new(),
    };

    let event = RealtimeServerMessage::Sync {
        data: SyncEventData {
            cursor: commit_seq,
            actor_id: Some(actor_id),
            created_at: Some(chrono::Utc::now()),
            changes: if changes.is_empty() { None } else { Some(changes) },
            timestamp: chrono::Utc::now(),
        },
    };
    for client_id in &client_ids {
        if Some(client_id) == exclude_client.as_ref() {
            continue;
        }
        if let Some(sender) = state.clients.get(&(actor_id, client_id.clone())) {
            let _ = sender.try_send(event.clone());
        }
    }
}

/// Re-reads the changes a just-applied commit produced, across every
/// table it touched, for inlining onto the wake notice.
async fn fetch_commit_changes(state: &AppState, commit_seq: i64, tables: &[String]) -> Vec<ChangeWire> {
    let mut changes = Vec::new();
    for table in tables {
        match state.db.read_incremental_pull_rows(table, &[commit_seq]).await {
            Ok(rows) => {
                for (_, change) in rows {
                    changes.push(ChangeWire {
                        change_id: change.change_id,
                        table: change.table,
                        row_id: change.row_id,
                        op: change.op,
                        row_json: change.row_json,
                        row_version: change.row_version,
                        scopes: change.scopes,
                    });
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, table = %table, "failed to fetch commit changes for realtime wake");
            }
        }
    }
    changes.sort_by_key(|c| c.change_id);
    changes
}

async fn broadcast_presence(
    state: &AppState,
    actor_id: Uuid,
    exclude_client: &Option<String>,
    action: syncular_core::protocol::PresenceAction,
    scope_key: String,
    metadata: Option<serde_json::Value>,
) {
    let Some(clients) = state.actor_clients.get(&actor_id) else { return };
    let payload = serde_json::json!({ "action": action, "scopeKey": scope_key, "metadata": metadata });
    let event = RealtimeServerMessage::Presence { data: payload };
    for client_id in clients.iter() {
        if Some(client_id) == exclude_client.as_ref() {
            continue;
        }
        if let Some(sender) = state.clients.get(&(actor_id, client_id.clone())) {
            let _ = sender.try_send(event.clone());
        }
    }
}

