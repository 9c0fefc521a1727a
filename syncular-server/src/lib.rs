pub mod api;
pub mod auth;
pub mod chunk_cache;
pub mod database;
pub mod external;
pub mod monitoring;
pub mod pull;
pub mod push;
pub mod scope_resolver;
pub mod websocket;

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use syncular_core::handler::HandlerRegistry;
use syncular_core::models::PartitionId;
use syncular_core::plugin::PluginChain;
use syncular_core::protocol::RealtimeServerMessage;
use syncular_core::snapshot::BlobStore;

pub use auth::AuthState;
pub use database::ServerDatabase;

/// Registry of connected realtime clients: `(actor_id, client_id) -> channel`.
pub type ClientRegistry = Arc<DashMap<(Uuid, String), tokio::sync::mpsc::Sender<RealtimeServerMessage>>>;

/// Which client ids belong to which actor, for broadcast-to-others.
pub type ActorClients = Arc<DashMap<Uuid, HashSet<String>>>;

/// Shared application state threaded through every axum handler and the
/// websocket loop, mirroring the teacher's `AppState` shape (`db`, `auth`,
/// `monitoring`, `clients`) with the push/pull/handler collaborators this
/// crate's surface requires layered on top.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<database::ServerDatabase>,
    pub auth: auth::AuthState,
    pub monitoring: Option<monitoring::MonitoringLayer>,
    pub clients: ClientRegistry,
    pub actor_clients: ActorClients,
    pub handlers: Arc<HandlerRegistry>,
    pub plugins: Arc<PluginChain>,
    pub blob_store: Arc<dyn BlobStore>,
    pub chunk_cache: Arc<chunk_cache::ChunkCache>,
    pub scope_resolver: Arc<scope_resolver::ScopeResolver>,
    pub push_engine: Arc<push::PushEngine>,
    pub pull_engine: Arc<pull::PullEngine>,
    pub external: Arc<external::ExternalChangeNotifier>,
    /// Standalone deployments run a single tenant; multi-tenant deployments
    /// derive this per-request from the authenticated actor instead.
    pub default_partition: PartitionId,
}

impl AppState {
    pub fn new(
        db: Arc<database::ServerDatabase>,
        handlers: Arc<HandlerRegistry>,
        blob_store: Arc<dyn BlobStore>,
        default_partition: PartitionId,
        monitoring: Option<monitoring::MonitoringLayer>,
    ) -> Self {
        let plugins = Arc::new(PluginChain::new());
        let scope_resolver = Arc::new(scope_resolver::ScopeResolver::new(handlers.clone()));
        let chunk_cache = Arc::new(chunk_cache::ChunkCache::new(db.clone(), blob_store.clone()));
        let push_engine = Arc::new(push::PushEngine::new(db.clone(), handlers.clone(), plugins.clone()));
        let pull_engine = Arc::new(pull::PullEngine::new(
            db.clone(),
            handlers.clone(),
            scope_resolver.clone(),
            chunk_cache.clone(),
        ));
        let external = Arc::new(external::ExternalChangeNotifier::new(db.clone(), chunk_cache.clone()));

        let auth = auth::AuthState::new(db.clone());

        Self {
            db,
            auth,
            monitoring,
            clients: Arc::new(DashMap::new()),
            actor_clients: Arc::new(DashMap::new()),
            handlers,
            plugins,
            blob_store,
            chunk_cache,
            scope_resolver,
            push_engine,
            pull_engine,
            external,
            default_partition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_registry_keys_by_actor_and_client_id() {
        let registry: ClientRegistry = Arc::new(DashMap::new());
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let actor_id = Uuid::new_v4();
        registry.insert((actor_id, "c1".to_string()), tx);
        assert!(registry.contains_key(&(actor_id, "c1".to_string())));
    }
}
