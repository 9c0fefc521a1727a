use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt::{Display, Formatter};
use chrono::ParseError;
use thiserror::Error;
use tracing::log::warn;
use crate::protocol;
use tokio::sync::mpsc::error::SendError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("row missing for operation on table {table}: {row_id}")]
    RowMissing { table: String, row_id: String },

    #[error("version mismatch on table {table} row {row_id}: expected {expected}, got {actual}")]
    VersionMismatch {
        table: String,
        row_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("constraint violation ({code}): {message}")]
    ConstraintViolation { code: ConstraintCode, message: String },

    #[error("missing or empty scopes for emitted change on table {0}")]
    MissingScopes(String),

    #[error("unknown table handler: {0}")]
    UnknownTable(String),

    #[error("handler dependency graph has a cycle involving table {0}")]
    CyclicHandlerGraph(String),

    #[error("scope resolution failed for actor {actor_id} on table {table}: {message}")]
    ScopeResolutionFailed {
        actor_id: uuid::Uuid,
        table: String,
        message: String,
    },

    #[error("conflict detected for table {table} row {row_id}")]
    ConflictDetected { table: String, row_id: String },

    #[error("blob store error: {0}")]
    BlobStore(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("UUID parsing error: {0}")]
    UuidParse(#[from] uuid::Error),

    #[error("date parsing error: {0}")]
    DateParse(#[from] ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),
}

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintCode {
    UniqueConstraint,
    ForeignKeyConstraint,
    NotNullConstraint,
    Other,
}

impl Display for ConstraintCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConstraintCode::UniqueConstraint => "UNIQUE_CONSTRAINT",
            ConstraintCode::ForeignKeyConstraint => "FOREIGN_KEY_CONSTRAINT",
            ConstraintCode::NotNullConstraint => "NOT_NULL_CONSTRAINT",
            ConstraintCode::Other => "CONSTRAINT_VIOLATION",
        };
        write!(f, "{s}")
    }
}

/// Classify a raw `sqlx::Error` into one of the constraint subcodes from
/// the error taxonomy (spec §7), falling back to `Other` when the
/// dialect doesn't expose a kind for it.
pub fn classify_constraint_violation(err: &sqlx::Error) -> ConstraintCode {
    let Some(db_err) = err.as_database_error() else {
        return ConstraintCode::Other;
    };
    match db_err.kind() {
        sqlx::error::ErrorKind::UniqueViolation => ConstraintCode::UniqueConstraint,
        sqlx::error::ErrorKind::ForeignKeyViolation => ConstraintCode::ForeignKeyConstraint,
        sqlx::error::ErrorKind::NotNullViolation => ConstraintCode::NotNullConstraint,
        _ => ConstraintCode::Other,
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    #[error("{0}")]
    Api(#[from] ApiError),

    #[error("server channel send failed: {0}")]
    SendError(#[from] SendError<protocol::RealtimeServerMessage>),

    #[error("dialect does not support savepoints and cannot isolate operation failure")]
    SavepointsUnsupported,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("sync engine has been destroyed")]
    Destroyed,

    #[error("channel send failed: {0}")]
    SendError(String),

    #[error("apply of pulled change failed for table {table} row {row_id}: {message}")]
    ApplyFailed {
        table: String,
        row_id: String,
        message: String,
    },
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    #[error("internal server error: {0}")]
    Internal(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }
}

impl From<ApiError> for SyncError {
    fn from(value: ApiError) -> Self {
        SyncError::Server(ServerError::Api(value))
    }
}

impl From<SendError<protocol::RealtimeServerMessage>> for SyncError {
    fn from(value: SendError<protocol::RealtimeServerMessage>) -> Self {
        SyncError::Server(value.into())
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        #[derive(serde::Serialize)]
        struct ErrorBody {
            message: String,
        }

        let (status, message) = match self {
            SyncError::Server(ServerError::Api(e)) => {
                warn!("api error: {e}");
                match e {
                    ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
                    ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
                    ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m),
                }
            }
            SyncError::InvalidRequest(ref m) => (StatusCode::BAD_REQUEST, m.clone()),
            SyncError::VersionMismatch { .. } | SyncError::ConflictDetected { .. } => {
                let msg = self.to_string();
                (StatusCode::CONFLICT, msg)
            }
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        };

        (status, axum::Json(ErrorBody { message })).into_response()
    }
}
