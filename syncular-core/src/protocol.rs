use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{BootstrapState, Encoding, Compression, Op, ScopeMap};

/// One operation inside a push request, e.g. `{table, rowId, op:"upsert", payload?, baseVersion?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOperation {
    pub table: String,
    pub row_id: String,
    pub op: Op,
    pub payload: Option<serde_json::Value>,
    pub base_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub client_id: String,
    pub client_commit_id: String,
    pub schema_version: i32,
    pub operations: Vec<PushOperation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Applied,
    Cached,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Applied,
    Conflict,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub op_index: usize,
    pub status: OperationStatus,
    pub error: Option<String>,
    pub code: Option<String>,
    pub retriable: Option<bool>,
    pub server_version: Option<i64>,
    pub server_row: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub ok: bool,
    pub status: PushStatus,
    pub commit_seq: Option<i64>,
    pub results: Vec<OperationResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub id: String,
    pub table: String,
    pub scopes: ScopeMap,
    pub params: Option<serde_json::Value>,
    pub cursor: i64,
    pub bootstrap_state: Option<BootstrapState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub client_id: String,
    pub subscriptions: Vec<SubscriptionRequest>,
    #[serde(default)]
    pub limit_commits: Option<u32>,
    #[serde(default)]
    pub limit_snapshot_rows: Option<u32>,
    #[serde(default)]
    pub max_snapshot_pages: Option<u32>,
    #[serde(default)]
    pub dedupe_rows: Option<bool>,
}

pub const DEFAULT_LIMIT_COMMITS: u32 = 50;
pub const LIMIT_COMMITS_RANGE: std::ops::RangeInclusive<u32> = 1..=500;
pub const DEFAULT_LIMIT_SNAPSHOT_ROWS: u32 = 1000;
pub const LIMIT_SNAPSHOT_ROWS_RANGE: std::ops::RangeInclusive<u32> = 1..=5000;
pub const DEFAULT_MAX_SNAPSHOT_PAGES: u32 = 4;
pub const MAX_SNAPSHOT_PAGES_RANGE: std::ops::RangeInclusive<u32> = 1..=50;

impl PullRequest {
    pub fn effective_limit_commits(&self) -> u32 {
        self.limit_commits
            .unwrap_or(DEFAULT_LIMIT_COMMITS)
            .clamp(*LIMIT_COMMITS_RANGE.start(), *LIMIT_COMMITS_RANGE.end())
    }

    pub fn effective_limit_snapshot_rows(&self) -> u32 {
        self.limit_snapshot_rows
            .unwrap_or(DEFAULT_LIMIT_SNAPSHOT_ROWS)
            .clamp(
                *LIMIT_SNAPSHOT_ROWS_RANGE.start(),
                *LIMIT_SNAPSHOT_ROWS_RANGE.end(),
            )
    }

    pub fn effective_max_snapshot_pages(&self) -> u32 {
        self.max_snapshot_pages
            .unwrap_or(DEFAULT_MAX_SNAPSHOT_PAGES)
            .clamp(
                *MAX_SNAPSHOT_PAGES_RANGE.start(),
                *MAX_SNAPSHOT_PAGES_RANGE.end(),
            )
    }

    pub fn dedupe_rows(&self) -> bool {
        self.dedupe_rows.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeWire {
    pub change_id: i64,
    pub table: String,
    pub row_id: String,
    pub op: Op,
    pub row_json: Option<serde_json::Value>,
    pub row_version: i64,
    pub scopes: ScopeMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitWire {
    pub commit_seq: i64,
    pub created_at: DateTime<Utc>,
    pub actor_id: Uuid,
    pub changes: Vec<ChangeWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotChunkRef {
    pub id: String,
    pub sha256: String,
    pub byte_length: i64,
    pub encoding: Encoding,
    pub compression: Compression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotWire {
    pub table: String,
    pub chunks: Vec<SnapshotChunkRef>,
    #[serde(default)]
    pub rows: Option<Vec<serde_json::Value>>,
    pub is_first_page: bool,
    pub is_last_page: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPullStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPullResponse {
    pub id: String,
    pub status: SubscriptionPullStatus,
    pub scopes: ScopeMap,
    pub bootstrap: bool,
    pub bootstrap_state: Option<BootstrapState>,
    pub next_cursor: i64,
    pub commits: Vec<CommitWire>,
    #[serde(default)]
    pub snapshots: Option<Vec<SnapshotWire>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub ok: bool,
    pub subscriptions: Vec<SubscriptionPullResponse>,
}

/// Inbound-from-server realtime envelope, `{event, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RealtimeServerMessage {
    Sync { data: SyncEventData },
    Heartbeat,
    PushResponse { data: PushResponseEventData },
    Presence { data: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEventData {
    pub cursor: Option<i64>,
    pub actor_id: Option<Uuid>,
    pub created_at: Option<DateTime<Utc>>,
    pub changes: Option<Vec<ChangeWire>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponseEventData {
    pub request_id: String,
    pub ok: bool,
    pub status: PushStatus,
    pub commit_seq: Option<i64>,
    pub results: Vec<OperationResult>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Join,
    Leave,
    Update,
}

/// Outbound-to-server realtime envelope, `{type, ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeClientMessage {
    Auth {
        token: String,
    },
    Push {
        request_id: String,
        client_commit_id: String,
        operations: Vec<PushOperation>,
        schema_version: i32,
    },
    Presence {
        action: PresenceAction,
        scope_key: String,
        metadata: Option<serde_json::Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_request_round_trips_camel_case() {
        let req = PushRequest {
            client_id: "c1".into(),
            client_commit_id: "cc1".into(),
            schema_version: 1,
            operations: vec![PushOperation {
                table: "tasks".into(),
                row_id: "t1".into(),
                op: Op::Upsert,
                payload: Some(serde_json::json!({"title": "x"})),
                base_version: Some(1),
            }],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["clientCommitId"], "cc1");
        assert_eq!(json["operations"][0]["rowId"], "t1");
        assert_eq!(json["operations"][0]["baseVersion"], 1);

        let parsed: PushRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.client_commit_id, "cc1");
    }

    #[test]
    fn realtime_server_message_tags_are_snake_case() {
        let msg = RealtimeServerMessage::Heartbeat;
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "heartbeat");
    }

    #[test]
    fn realtime_client_auth_message_tags_type() {
        let msg = RealtimeClientMessage::Auth { token: "tok".into() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "auth");
        assert_eq!(json["token"], "tok");
    }
}
