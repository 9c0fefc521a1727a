pub mod conflict;
pub mod database;
pub mod events;
pub mod outbox;
pub mod sync_engine;
pub mod websocket;

pub use conflict::ConflictStore;
pub use database::ClientDatabase;
pub use events::{ChangeSource, ConnectionState, EventDispatcher, SyncEvent};
pub use outbox::Outbox;
pub use sync_engine::{ChangeApplier, EngineConfig, EngineState, SubscriptionSpec, SyncEngine, TransportMode};
pub use websocket::WebSocketClient;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use sqlx::SqliteConnection;
    use syncular_core::models::{Op, PendingOperation};
    use syncular_core::protocol::ChangeWire;
    use syncular_core::SyncResult;

    struct NoopApplier;

    #[async_trait]
    impl ChangeApplier for NoopApplier {
        async fn apply_change(&self, _conn: &mut SqliteConnection, _change: &ChangeWire) -> SyncResult<()> {
            Ok(())
        }

        async fn apply_snapshot_row(
            &self,
            _conn: &mut SqliteConnection,
            _table: &str,
            _row: &serde_json::Value,
        ) -> SyncResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn engine_queues_local_mutations_to_outbox() {
        let config = EngineConfig {
            database_url: "sqlite::memory:".into(),
            http_url: "http://localhost:4000".into(),
            ws_url: None,
            api_key: "sya_test".into(),
            api_secret: "sys_test".into(),
            schema_version: 1,
            subscriptions: vec![],
            poll_interval_secs: None,
        };
        let engine = SyncEngine::new(config, Arc::new(NoopApplier)).await.unwrap();

        engine
            .apply_local_mutation(vec![PendingOperation {
                table: "tasks".into(),
                row_id: "t1".into(),
                op: Op::Upsert,
                payload: Some(json!({"title": "write the client"})),
                base_version: None,
            }])
            .await
            .unwrap();

        assert_eq!(engine.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn state_reflects_pending_count_and_destroyed_engines_refuse_to_start() {
        let config = EngineConfig {
            database_url: "sqlite::memory:".into(),
            http_url: "http://localhost:4000".into(),
            ws_url: None,
            api_key: "sya_test".into(),
            api_secret: "sys_test".into(),
            schema_version: 1,
            subscriptions: vec![],
            poll_interval_secs: Some(3600),
        };
        let engine = SyncEngine::new(config, Arc::new(NoopApplier)).await.unwrap();

        let state = engine.state().await;
        assert!(!state.enabled);
        assert_eq!(state.pending_count, 0);
        assert_eq!(state.transport_mode, TransportMode::Polling);

        engine
            .apply_local_mutation(vec![PendingOperation {
                table: "tasks".into(),
                row_id: "t1".into(),
                op: Op::Upsert,
                payload: Some(json!({"title": "pending row"})),
                base_version: None,
            }])
            .await
            .unwrap();
        assert_eq!(engine.state().await.pending_count, 1);

        engine.destroy();
        assert!(engine.start().is_err());
    }
}
