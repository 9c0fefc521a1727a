use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Logical tenant boundary. No cross-partition visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub Uuid);

impl PartitionId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Values routable to a scope key. `Any` ("*") matches any requested value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeValue {
    Any,
    One(String),
    Many(Vec<String>),
}

impl ScopeValue {
    pub fn as_set(&self) -> Vec<&str> {
        match self {
            ScopeValue::Any => vec!["*"],
            ScopeValue::One(v) => vec![v.as_str()],
            ScopeValue::Many(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, ScopeValue::Any)
    }
}

/// Mapping of declared scope keys (e.g. `user_id`) to routable value(s).
pub type ScopeMap = BTreeMap<String, ScopeValue>;

/// Intersect `requested` against `allowed` per scope key. An allowed value of
/// `"*"` passes through every requested value for that key. A key absent from
/// `allowed` drops out of the result entirely (handler did not grant it).
pub fn intersect_scopes(requested: &ScopeMap, allowed: &ScopeMap) -> ScopeMap {
    let mut result = ScopeMap::new();
    for (key, req_values) in requested {
        let Some(allowed_values) = allowed.get(key) else {
            continue;
        };
        if allowed_values.is_any() {
            result.insert(key.clone(), req_values.clone());
            continue;
        }
        let allowed_set: Vec<&str> = allowed_values.as_set();
        let intersected: Vec<String> = req_values
            .as_set()
            .into_iter()
            .filter(|v| allowed_set.contains(v))
            .map(str::to_string)
            .collect();
        if !intersected.is_empty() {
            result.insert(key.clone(), ScopeValue::Many(intersected));
        }
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Op {
    Upsert,
    Delete,
}

/// An atomic batch of operations with a server-assigned sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub commit_seq: i64,
    pub partition_id: PartitionId,
    pub actor_id: Uuid,
    pub client_id: String,
    pub client_commit_id: String,
    pub created_at: DateTime<Utc>,
    pub result_json: Option<serde_json::Value>,
    pub change_count: i32,
    pub affected_tables: Vec<String>,
}

impl Commit {
    /// The distinguished client id used for synthetic commits recorded by
    /// `notify_external_data_change` when data changes outside the push path.
    pub const EXTERNAL_CLIENT_ID: &'static str = "__external__";

    pub fn is_external(&self) -> bool {
        self.client_id == Self::EXTERNAL_CLIENT_ID
    }
}

/// One row mutation belonging to exactly one commit. Immutable once inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub change_id: i64,
    pub commit_seq: i64,
    pub table: String,
    pub row_id: String,
    pub op: Op,
    pub row_json: Option<serde_json::Value>,
    pub row_version: i64,
    pub scopes: ScopeMap,
}

/// `(partition_id, table, commit_seq)` unique index row; used for O(log n)
/// cursor advance during incremental pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableCommitIndexEntry {
    pub partition_id: PartitionId,
    pub table: String,
    pub commit_seq: i64,
}

/// A client's high-water `commit_seq` per partition, consulted by pruning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCursor {
    pub partition_id: PartitionId,
    pub client_id: String,
    pub actor_id: Uuid,
    pub cursor: i64,
    pub effective_scopes: ScopeMap,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Encoding {
    RowFrameV1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Compression {
    Gzip,
}

/// Content-addressed snapshot chunk metadata. The body lives in a
/// [`crate::snapshot::BlobStore`]; this row may outlive or be shared across
/// multiple bootstrap requests that hash to the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotChunkMeta {
    pub partition_id: PartitionId,
    /// Table this chunk's rows belong to. Not part of spec §4.5's literal
    /// content-address key (bundling is already per table, spec §4.2 step
    /// 4), but tracked so external-change notification can evict by table.
    pub table: String,
    pub scope_key: String,
    pub scope: String,
    pub as_of_commit_seq: i64,
    pub row_cursor: Option<String>,
    pub row_limit: i32,
    pub encoding: Encoding,
    pub compression: Compression,
    pub sha256: String,
    pub byte_length: i64,
    pub blob_hash: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sending,
    Acked,
    Failed,
}

/// A single operation queued in an outbox commit, mirroring the wire shape
/// of a push request operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub table: String,
    pub row_id: String,
    pub op: Op,
    pub payload: Option<serde_json::Value>,
    pub base_version: Option<i64>,
}

/// Client-side durable queue entry awaiting server acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxCommit {
    pub id: Uuid,
    pub client_commit_id: String,
    pub status: OutboxStatus,
    pub operations: Vec<PendingOperation>,
    pub attempt_count: i32,
    pub acked_commit_seq: Option<i64>,
    pub schema_version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_response_json: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl OutboxCommit {
    /// `server_version` on a freshly-created local row is `0` until a push
    /// response overwrites it; callers must not read `0` as "present on
    /// the server" (see design note on `server_version` defaults).
    pub const UNSYNCED_SERVER_VERSION: i64 = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConflictResolutionKind {
    Accept,
    Reject,
    Merge,
}

/// Resolution chosen by the application for a persisted [`Conflict`]. The
/// wire/storage form for `Merge` carries the merged JSON as `"merge:<json>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConflictResolution {
    Accept,
    Reject,
    Merge(serde_json::Value),
}

impl ConflictResolution {
    pub fn kind(&self) -> ConflictResolutionKind {
        match self {
            ConflictResolution::Accept => ConflictResolutionKind::Accept,
            ConflictResolution::Reject => ConflictResolutionKind::Reject,
            ConflictResolution::Merge(_) => ConflictResolutionKind::Merge,
        }
    }
}

/// Created when the server rejects an outbox commit with a conflict result.
/// Holds a weak reference (by id) to its outbox commit, not a lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    pub outbox_commit_id: Uuid,
    pub op_index: i32,
    pub result_status: String,
    pub code: Option<String>,
    pub message: Option<String>,
    pub server_version: Option<i64>,
    pub server_row_json: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<ConflictResolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionStatus {
    New,
    Bootstrapping,
    Live,
    Revoked,
}

/// Bootstrap progress threaded across pull rounds for a subscription still
/// draining its snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapState {
    pub as_of_commit_seq: i64,
    pub tables: Vec<String>,
    pub table_index: i32,
    pub row_cursor: Option<String>,
}

/// Client-side subscription bookkeeping: the cursor advances monotonically
/// and bootstrap state threads across pull rounds until fully drained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub state_id: Uuid,
    pub subscription_id: String,
    pub table: String,
    pub scopes: ScopeMap,
    pub params_json: Option<serde_json::Value>,
    pub cursor: i64,
    pub bootstrap_state: Option<BootstrapState>,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersects_exact_match() {
        let mut requested = ScopeMap::new();
        requested.insert("user_id".into(), ScopeValue::One("u1".into()));
        let mut allowed = ScopeMap::new();
        allowed.insert("user_id".into(), ScopeValue::One("u1".into()));

        let result = intersect_scopes(&requested, &allowed);
        assert_eq!(result.get("user_id").unwrap().as_set(), vec!["u1"]);
    }

    #[test]
    fn intersects_empty_when_disjoint() {
        let mut requested = ScopeMap::new();
        requested.insert("user_id".into(), ScopeValue::One("u1".into()));
        let mut allowed = ScopeMap::new();
        allowed.insert("user_id".into(), ScopeValue::One("u2".into()));

        let result = intersect_scopes(&requested, &allowed);
        assert!(result.is_empty());
    }

    #[test]
    fn wildcard_allowed_passes_through_requested() {
        let mut requested = ScopeMap::new();
        requested.insert(
            "team_id".into(),
            ScopeValue::Many(vec!["t1".into(), "t2".into()]),
        );
        let mut allowed = ScopeMap::new();
        allowed.insert("team_id".into(), ScopeValue::Any);

        let result = intersect_scopes(&requested, &allowed);
        assert_eq!(result.get("team_id").unwrap().as_set().len(), 2);
    }

    #[test]
    fn key_not_granted_by_handler_is_dropped() {
        let mut requested = ScopeMap::new();
        requested.insert("user_id".into(), ScopeValue::One("u1".into()));
        requested.insert("org_id".into(), ScopeValue::One("o1".into()));
        let mut allowed = ScopeMap::new();
        allowed.insert("user_id".into(), ScopeValue::One("u1".into()));

        let result = intersect_scopes(&requested, &allowed);
        assert!(!result.contains_key("org_id"));
    }

    #[test]
    fn commit_identifies_external_client() {
        let commit = Commit {
            commit_seq: 1,
            partition_id: PartitionId::new(Uuid::nil()),
            actor_id: Uuid::nil(),
            client_id: Commit::EXTERNAL_CLIENT_ID.to_string(),
            client_commit_id: "x".into(),
            created_at: Utc::now(),
            result_json: None,
            change_count: 0,
            affected_tables: vec!["tasks".into()],
        };
        assert!(commit.is_external());
    }
}
