//! Channel-based activity log (spec's ambient observability surface, not a
//! named module). Grounded on the teacher's `MonitoringLayer`/`LogMessage`
//! shape; the teacher's `colored`/`println!` terminal renderer is dropped
//! from the library (a demo binary owns presentation) and replaced with
//! structured `tracing` events so the log is useful without a TTY attached.

use tokio::sync::mpsc;
use tracing::info;

use syncular_core::protocol::{RealtimeClientMessage, RealtimeServerMessage};

#[derive(Debug, Clone)]
pub enum LogMessage {
    ClientConnected {
        connection_id: String,
    },
    ClientDisconnected {
        connection_id: String,
    },
    MessageReceived {
        connection_id: String,
        message: RealtimeClientMessage,
    },
    MessageSent {
        connection_id: String,
        message: RealtimeServerMessage,
    },
    CommitApplied {
        commit_seq: i64,
        change_count: usize,
    },
    CommitRejected {
        client_commit_id: String,
        reason: String,
    },
    ExternalChange {
        tables: Vec<String>,
        commit_seq: i64,
    },
    Error {
        message: String,
    },
}

#[derive(Clone)]
pub struct MonitoringLayer {
    tx: mpsc::Sender<LogMessage>,
}

impl MonitoringLayer {
    pub fn new(tx: mpsc::Sender<LogMessage>) -> Self {
        Self { tx }
    }

    pub async fn log_client_connected(&self, connection_id: &str) {
        let _ = self
            .tx
            .send(LogMessage::ClientConnected { connection_id: connection_id.to_string() })
            .await;
    }

    pub async fn log_client_disconnected(&self, connection_id: &str) {
        let _ = self
            .tx
            .send(LogMessage::ClientDisconnected { connection_id: connection_id.to_string() })
            .await;
    }

    pub async fn log_message_received(&self, connection_id: &str, message: RealtimeClientMessage) {
        let _ = self
            .tx
            .send(LogMessage::MessageReceived { connection_id: connection_id.to_string(), message })
            .await;
    }

    pub async fn log_message_sent(&self, connection_id: &str, message: RealtimeServerMessage) {
        let _ = self
            .tx
            .send(LogMessage::MessageSent { connection_id: connection_id.to_string(), message })
            .await;
    }

    pub async fn log_commit_applied(&self, commit_seq: i64, change_count: usize) {
        let _ = self.tx.send(LogMessage::CommitApplied { commit_seq, change_count }).await;
    }

    pub async fn log_commit_rejected(&self, client_commit_id: &str, reason: &str) {
        let _ = self
            .tx
            .send(LogMessage::CommitRejected {
                client_commit_id: client_commit_id.to_string(),
                reason: reason.to_string(),
            })
            .await;
    }

    pub async fn log_external_change(&self, tables: Vec<String>, commit_seq: i64) {
        let _ = self.tx.send(LogMessage::ExternalChange { tables, commit_seq }).await;
    }

    pub async fn log_error(&self, message: String) {
        let _ = self.tx.send(LogMessage::Error { message }).await;
    }
}

/// Drain the log channel into `tracing` events. Terminal presentation (if
/// any) is the caller's concern, not this crate's.
pub async fn spawn_monitoring_sink(mut rx: mpsc::Receiver<LogMessage>) {
    tokio::spawn(async move {
        while let Some(log) = rx.recv().await {
            match log {
                LogMessage::ClientConnected { connection_id } => {
                    info!(connection_id, "client connected");
                }
                LogMessage::ClientDisconnected { connection_id } => {
                    info!(connection_id, "client disconnected");
                }
                LogMessage::MessageReceived { connection_id, message } => {
                    info!(connection_id, kind = message_kind(&message), "message received");
                }
                LogMessage::MessageSent { connection_id, message } => {
                    info!(connection_id, kind = server_message_kind(&message), "message sent");
                }
                LogMessage::CommitApplied { commit_seq, change_count } => {
                    info!(commit_seq, change_count, "commit applied");
                }
                LogMessage::CommitRejected { client_commit_id, reason } => {
                    info!(client_commit_id, reason, "commit rejected");
                }
                LogMessage::ExternalChange { tables, commit_seq } => {
                    info!(?tables, commit_seq, "external change recorded");
                }
                LogMessage::Error { message } => {
                    tracing::error!(message, "monitoring error");
                }
            }
        }
    });
}

fn message_kind(message: &RealtimeClientMessage) -> &'static str {
    match message {
        RealtimeClientMessage::Auth { .. } => "auth",
        RealtimeClientMessage::Push { .. } => "push",
        RealtimeClientMessage::Presence { .. } => "presence",
    }
}

fn server_message_kind(message: &RealtimeServerMessage) -> &'static str {
    match message {
        RealtimeServerMessage::Sync { .. } => "sync",
        RealtimeServerMessage::Heartbeat => "heartbeat",
        RealtimeServerMessage::PushResponse { .. } => "push_response",
        RealtimeServerMessage::Presence { .. } => "presence",
    }
}
