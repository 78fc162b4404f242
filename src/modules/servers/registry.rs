use super::{
    catalog::ServerCatalog,
    database::ServersDatabase,
    error::ServerResult,
    session::{ServerSession, SessionController},
};
use crate::{
    database::Database,
    engine::{EngineError, ServerEngine},
};
use dashmap::DashMap;
use poise::serenity_prelude::GuildId;
use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs,
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, error, info};

/// A guild, keyed by its snowflake so renames never move its servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(u64);

impl TenantId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<GuildId> for TenantId {
    fn from(id: GuildId) -> Self {
        Self(id.get())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub(super) struct TenantInner {
    pub max_servers: usize,
    pub session: Option<ServerSession>,
    /// Names reserved by creations whose files are still being laid out.
    pub pending: HashSet<String>,
}

#[derive(Debug)]
pub struct TenantState {
    id: TenantId,
    storage_root: PathBuf,
    inner: Mutex<TenantInner>,
}

impl TenantState {
    fn new(id: TenantId, storage_root: PathBuf, max_servers: usize) -> Self {
        Self {
            id,
            storage_root,
            inner: Mutex::new(TenantInner {
                max_servers,
                session: None,
                pending: HashSet::new(),
            }),
        }
    }

    pub fn id(&self) -> TenantId {
        self.id
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub(super) async fn lock(&self) -> MutexGuard<'_, TenantInner> {
        self.inner.lock().await
    }

    pub async fn max_servers(&self) -> usize {
        self.lock().await.max_servers
    }
}

#[derive(Debug)]
pub struct GuildRegistry {
    tenants: DashMap<TenantId, Arc<TenantState>>,
    save_location: PathBuf,
    default_max_servers: usize,
    settings: Database<ServersDatabase>,
    engine: Arc<dyn ServerEngine>,
}

impl GuildRegistry {
    pub fn new(
        save_location: impl Into<PathBuf>,
        default_max_servers: usize,
        settings: Database<ServersDatabase>,
        engine: Arc<dyn ServerEngine>,
    ) -> Self {
        Self {
            tenants: DashMap::new(),
            save_location: save_location.into(),
            default_max_servers,
            settings,
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ServerEngine> {
        &self.engine
    }

    pub fn default_max_servers(&self) -> usize {
        self.default_max_servers
    }

    /// Returns the guild's state, creating its storage area the first time
    /// the guild is seen.
    pub async fn get_or_create(&self, id: TenantId) -> ServerResult<Arc<TenantState>> {
        if let Some(tenant) = self.tenants.get(&id) {
            return Ok(tenant.clone());
        }

        let storage_root = self.save_location.join(id.to_string());
        fs::create_dir_all(&storage_root).await.map_err(|e| {
            error!("Failed to create storage for guild {}: {}", id, e);
            e
        })?;

        let max_servers = self
            .settings
            .get_settings(id.get())
            .await
            .max_servers
            .unwrap_or(self.default_max_servers);

        // Another command may have raced us here; the first insert wins.
        let tenant = self
            .tenants
            .entry(id)
            .or_insert_with(|| {
                debug!("Registered guild {} with a quota of {}", id, max_servers);
                Arc::new(TenantState::new(id, storage_root, max_servers))
            })
            .clone();
        Ok(tenant)
    }

    pub fn for_each_tenant(&self) -> Vec<TenantId> {
        let mut ids: Vec<_> = self.tenants.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Registers every guild that already has a storage area on disk.
    pub async fn discover(&self) -> ServerResult<Vec<TenantId>> {
        if fs::try_exists(&self.save_location).await? {
            let mut entries = fs::read_dir(&self.save_location).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                match entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
                    Some(id) => {
                        self.get_or_create(TenantId::new(id)).await?;
                    }
                    None => debug!("Skipping {} in save location", entry.path().display()),
                }
            }
        }
        Ok(self.for_each_tenant())
    }

    pub async fn catalog(&self, id: TenantId) -> ServerResult<ServerCatalog> {
        Ok(ServerCatalog::new(
            self.get_or_create(id).await?,
            self.engine.clone(),
        ))
    }

    pub async fn sessions(&self, id: TenantId) -> ServerResult<SessionController> {
        Ok(SessionController::new(
            self.get_or_create(id).await?,
            self.engine.clone(),
        ))
    }

    /// Persists a quota override, or clears it with `None`, and applies it to
    /// the live guild. Existing definitions above a lowered quota are kept;
    /// only new creations are refused.
    pub async fn set_quota(&self, id: TenantId, max: Option<usize>) -> ServerResult<usize> {
        let tenant = self.get_or_create(id).await?;
        let mut inner = tenant.lock().await;

        self.settings
            .set_max_servers(id.get(), max)
            .await
            .map_err(EngineError::Custom)?;

        inner.max_servers = max.unwrap_or(self.default_max_servers);
        info!("Quota for guild {} is now {}", id, inner.max_servers);
        Ok(inner.max_servers)
    }

    /// The guild's own default memory for `start`, if it set one.
    pub async fn default_memory(&self, id: TenantId) -> Option<u32> {
        self.settings.get_settings(id.get()).await.default_memory_gb
    }

    pub async fn set_default_memory(&self, id: TenantId, gb: Option<u32>) -> ServerResult<()> {
        self.settings
            .set_default_memory(id.get(), gb)
            .await
            .map_err(EngineError::Custom)?;
        match gb {
            Some(gb) => info!("Default memory for guild {} is now {}GB", id, gb),
            None => info!("Default memory for guild {} was reset", id),
        }
        Ok(())
    }

    /// Stops every running server, ignoring who started it.
    pub async fn shutdown(&self) {
        for id in self.for_each_tenant() {
            let Ok(sessions) = self.sessions(id).await else {
                continue;
            };
            if let Err(e) = sessions.force_stop().await {
                error!("Failed to stop server for guild {} during shutdown: {}", id, e);
            }
        }
    }
}
