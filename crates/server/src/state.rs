//! Shared application state
//!
//! One server object owns the registries, stores, and supervisor; all
//! collaborators are injected and shared by handle. No module-level
//! mutable state anywhere on the hot path.

use std::sync::Arc;
use std::time::Instant;

use orbit_config::{PersistenceBackend, Settings};
use orbit_core::{ApiKeyStore, Error, HistoryStore, PromptStore, Result, UserStore};
use orbit_inference::ClientFactory;
use orbit_moderation::ModeratorChain;
use orbit_pipeline::ChatPipeline;
use orbit_retrieval::RetrieverRegistry;
use orbit_store::{Db, SqliteHistoryStore, SqliteKeyStore, SqliteUserStore};
use orbit_supervisor::Supervisor;

use crate::admin_sessions::AdminSessions;
use crate::rate_limit::RateLimiter;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pipeline: Arc<ChatPipeline>,
    pub keys: Arc<dyn ApiKeyStore>,
    pub prompts: Arc<dyn PromptStore>,
    pub history: Arc<dyn HistoryStore>,
    pub users: Arc<dyn UserStore>,
    pub registry: Arc<RetrieverRegistry>,
    pub clients: Arc<ClientFactory>,
    pub supervisor: Arc<Supervisor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub admin_sessions: Arc<AdminSessions>,
    pub started_at: Instant,
    /// Janitor-only handle; present with the sqlite backend
    pub janitor_store: Option<Arc<SqliteHistoryStore>>,
}

impl AppState {
    /// Wire every collaborator from settings. This is the single
    /// composition point for the whole server.
    pub async fn build(settings: Settings) -> Result<Self> {
        let db = match settings.persistence.backend {
            PersistenceBackend::Sqlite => Db::open(&settings.persistence.path)
                .map_err(|e| Error::Config(format!("failed to open store: {e}")))?,
            PersistenceBackend::Memory => Db::open_in_memory()
                .map_err(|e| Error::Config(format!("failed to open store: {e}")))?,
        };

        let key_store = Arc::new(SqliteKeyStore::new(db.clone()));
        key_store.warm().await?;
        let history_store =
            Arc::new(SqliteHistoryStore::new(db.clone(), settings.session.max_messages));
        let user_store = Arc::new(SqliteUserStore::new(db));

        if settings.session.compact_on_start {
            history_store.compact_all().await?;
        }

        let registry = Arc::new(RetrieverRegistry::build(&settings).await?);
        let clients = Arc::new(ClientFactory::build(&settings.inference)?);
        let moderation = Arc::new(ModeratorChain::from_config(&settings.moderation)?);
        let supervisor = Arc::new(Supervisor::new(settings.fault_tolerance.clone()));

        let keys: Arc<dyn ApiKeyStore> = key_store.clone();
        let prompts: Arc<dyn PromptStore> = key_store;
        let history: Arc<dyn HistoryStore> = history_store.clone();
        let users: Arc<dyn UserStore> = user_store;

        let pipeline = Arc::new(ChatPipeline::new(
            settings.clone(),
            Arc::clone(&keys),
            Arc::clone(&prompts),
            Arc::clone(&history),
            Arc::clone(&registry),
            Arc::clone(&clients),
            moderation,
            Arc::clone(&supervisor),
        ));

        let rate_limiter = Arc::new(RateLimiter::new(settings.server.rate_limit.clone()));

        Ok(Self {
            settings: Arc::new(settings),
            pipeline,
            keys,
            prompts,
            history,
            users,
            registry,
            clients,
            supervisor,
            rate_limiter,
            admin_sessions: Arc::new(AdminSessions::new()),
            started_at: Instant::now(),
            janitor_store: Some(history_store),
        })
    }

    /// Probe every configured inference provider and datasource.
    /// Returns the names of unreachable targets.
    pub async fn verify_dependencies(&self) -> Vec<String> {
        let mut unreachable = Vec::new();

        for name in self.clients.provider_names() {
            if let Ok(client) = self.clients.get(&name) {
                if !client.verify_connection().await {
                    unreachable.push(format!("inference:{name}"));
                }
            }
        }

        for (adapter, status) in self.registry.health().await {
            if status == orbit_core::HealthStatus::Down {
                unreachable.push(format!("retriever:{adapter}"));
            }
        }

        unreachable
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
