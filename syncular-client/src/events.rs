//! Event dispatcher for sync lifecycle notifications. Grounded in spirit
//! on the teacher's `EventDispatcher`: the C-FFI callback marshaling
//! (`extern "C"`, `EventCallback`, `CString`) is dropped since no FFI
//! binding layer is in scope here; callers that want events just
//! subscribe to the broadcast channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

/// Realtime transport connection state (spec §4.4's engine state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Lifecycle and data events emitted by the sync engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    SyncStarted,
    SyncCompleted { applied_commits: u64 },
    SyncError { message: String },
    DataChange { table: String, row_id: String, source: ChangeSource },
    ConflictDetected { conflict_id: Uuid, table: String, row_id: String },
    ConnectionStateChanged { state: ConnectionState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Remote,
}

/// How long `sync:complete`/`data:change` notifications sit in the
/// coalescing buffer before flushing, per connection/sync state.
/// Ordering matters: a reconnect storm or a busy sync cycle both produce
/// bursts of changes, so they get a wider window than idle steady state.
#[derive(Debug, Clone, Copy)]
pub struct DebounceConfig {
    pub idle_ms: u64,
    pub syncing_ms: u64,
    pub reconnecting_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            idle_ms: 10,
            syncing_ms: 40,
            reconnecting_ms: 150,
        }
    }
}

#[derive(Default)]
struct PendingRefresh {
    scheduled: bool,
    changes: Vec<(String, String, ChangeSource)>,
    completed_commits: Option<u64>,
}

/// Thin wrapper over a `tokio::sync::broadcast` channel. Subscribers that
/// lag behind the buffer miss the oldest events rather than blocking the
/// engine. `sync:start`/`sync:error`/`conflict:detected`/connection-state
/// events fire immediately; `sync:complete` and `data:change` are
/// coalesced into a single flush per debounce window so a burst of pulled
/// changes doesn't wake every subscriber once per row.
#[derive(Clone)]
pub struct EventDispatcher {
    tx: broadcast::Sender<SyncEvent>,
    debounce: DebounceConfig,
    connection_state: Arc<Mutex<ConnectionState>>,
    is_syncing: Arc<Mutex<bool>>,
    pending: Arc<Mutex<PendingRefresh>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::with_debounce(DebounceConfig::default())
    }

    pub fn with_debounce(debounce: DebounceConfig) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            tx,
            debounce,
            connection_state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            is_syncing: Arc::new(Mutex::new(false)),
            pending: Arc::new(Mutex::new(PendingRefresh::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.lock().unwrap()
    }

    pub fn is_syncing(&self) -> bool {
        *self.is_syncing.lock().unwrap()
    }

    pub fn emit(&self, event: SyncEvent) {
        // No receivers is a normal state (e.g. headless sync with no UI
        // attached yet); the send error is not actionable.
        let _ = self.tx.send(event);
    }

    pub fn emit_sync_started(&self) {
        *self.is_syncing.lock().unwrap() = true;
        self.emit(SyncEvent::SyncStarted);
    }

    /// Queues a `sync:complete` notification for the next debounce flush
    /// rather than emitting it synchronously.
    pub fn emit_sync_completed(&self, applied_commits: u64) {
        *self.is_syncing.lock().unwrap() = false;
        {
            let mut pending = self.pending.lock().unwrap();
            pending.completed_commits = Some(pending.completed_commits.unwrap_or(0) + applied_commits);
        }
        self.schedule_refresh();
    }

    pub fn emit_sync_error(&self, message: impl Into<String>) {
        *self.is_syncing.lock().unwrap() = false;
        self.emit(SyncEvent::SyncError { message: message.into() });
    }

    /// Queues a `data:change` notification for the next debounce flush.
    pub fn emit_data_change(&self, table: impl Into<String>, row_id: impl Into<String>, source: ChangeSource) {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.changes.push((table.into(), row_id.into(), source));
        }
        self.schedule_refresh();
    }

    pub fn emit_conflict_detected(&self, conflict_id: Uuid, table: impl Into<String>, row_id: impl Into<String>) {
        self.emit(SyncEvent::ConflictDetected {
            conflict_id,
            table: table.into(),
            row_id: row_id.into(),
        });
    }

    pub fn emit_connection_state_changed(&self, state: ConnectionState) {
        *self.connection_state.lock().unwrap() = state;
        self.emit(SyncEvent::ConnectionStateChanged { state });
    }

    /// Current debounce window: reconnecting widens it the most, an
    /// active sync cycle widens it some, idle uses the configured floor.
    fn current_window(&self) -> Duration {
        if self.connection_state() == ConnectionState::Reconnecting {
            Duration::from_millis(self.debounce.reconnecting_ms)
        } else if self.is_syncing() {
            Duration::from_millis(self.debounce.syncing_ms)
        } else {
            Duration::from_millis(self.debounce.idle_ms)
        }
    }

    fn schedule_refresh(&self) {
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.scheduled {
                return;
            }
            pending.scheduled = true;
        }

        let window = self.current_window();
        let tx = self.tx.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let (changes, completed) = {
                let mut guard = pending.lock().unwrap();
                guard.scheduled = false;
                (std::mem::take(&mut guard.changes), guard.completed_commits.take())
            };
            for (table, row_id, source) in changes {
                let _ = tx.send(SyncEvent::DataChange { table, row_id, source });
            }
            if let Some(applied_commits) = completed {
                let _ = tx.send(SyncEvent::SyncCompleted { applied_commits });
            }
        });
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let dispatcher = EventDispatcher::new();
        let mut rx = dispatcher.subscribe();

        dispatcher.emit_sync_started();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SyncEvent::SyncStarted));
    }

    #[tokio::test]
    async fn data_change_carries_source() {
        let dispatcher = EventDispatcher::new();
        let mut rx = dispatcher.subscribe();

        dispatcher.emit_data_change("tasks", "t1", ChangeSource::Local);
        let event = rx.recv().await.unwrap();
        match event {
            SyncEvent::DataChange { table, row_id, source } => {
                assert_eq!(table, "tasks");
                assert_eq!(row_id, "t1");
                assert_eq!(source, ChangeSource::Local);
            }
            _ => panic!("unexpected event"),
        }
    }

    #[tokio::test]
    async fn bursts_of_data_changes_coalesce_into_one_flush_window() {
        let dispatcher = EventDispatcher::with_debounce(DebounceConfig {
            idle_ms: 20,
            syncing_ms: 20,
            reconnecting_ms: 20,
        });
        let mut rx = dispatcher.subscribe();

        dispatcher.emit_data_change("tasks", "t1", ChangeSource::Remote);
        dispatcher.emit_data_change("tasks", "t2", ChangeSource::Remote);
        dispatcher.emit_sync_completed(2);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().any(|e| matches!(e, SyncEvent::SyncCompleted { applied_commits: 2 })));
    }

    #[test]
    fn reconnecting_widens_the_debounce_window_past_syncing_past_idle() {
        let dispatcher = EventDispatcher::new();
        dispatcher.emit_connection_state_changed(ConnectionState::Reconnecting);
        assert_eq!(dispatcher.current_window(), Duration::from_millis(dispatcher.debounce.reconnecting_ms));

        dispatcher.emit_connection_state_changed(ConnectionState::Connected);
        *dispatcher.is_syncing.lock().unwrap() = true;
        assert_eq!(dispatcher.current_window(), Duration::from_millis(dispatcher.debounce.syncing_ms));

        *dispatcher.is_syncing.lock().unwrap() = false;
        assert_eq!(dispatcher.current_window(), Duration::from_millis(dispatcher.debounce.idle_ms));
    }
}
