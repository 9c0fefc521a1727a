//! Syncular - offline-first bidirectional sync between a local SQLite
//! database and a SQLite or Postgres server, built around a commit/change
//! log and scope-based row visibility.
//!
//! This crate re-exports the pieces applications actually wire up: the
//! client sync engine on the device, and the server app state for
//! standalone deployments.
//!
//! ```ignore
//! use syncular::{SyncEngine, EngineConfig};
//!
//! let engine = SyncEngine::new(config, applier).await?;
//! engine.start()?;
//! engine.sync().await?;
//! ```

pub use syncular_client::{
    ChangeApplier, ChangeSource, ClientDatabase, ConflictStore, ConnectionState, EngineConfig,
    EngineState, EventDispatcher, Outbox, SubscriptionSpec, SyncEngine, SyncEvent, TransportMode,
    WebSocketClient,
};

pub use syncular_server::AppState as Server;

pub use syncular_core::errors::SyncError;
pub use syncular_core::models;
pub use syncular_core::protocol;
pub use syncular_core::SyncResult;
