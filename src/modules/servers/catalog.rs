use super::{
    error::{ServerError, ServerResult},
    quota,
    registry::{TenantInner, TenantState},
};
use crate::engine::ServerEngine;
use std::{collections::BTreeSet, io::ErrorKind, path::Path, sync::Arc};
use tokio::fs;
use tracing::{error, info, warn};

const MAX_NAME_LEN: usize = 32;

/// A definition name that is always a single, safe path component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerName(String);

impl ServerName {
    pub fn parse(raw: &str) -> ServerResult<Self> {
        let name = raw.trim();
        let valid = !name.is_empty()
            && name.len() <= MAX_NAME_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(ServerError::InvalidName(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDefinition {
    pub name: String,
    pub version: String,
}

fn validate_property(key: &str, value: &str) -> ServerResult<()> {
    let key_ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
    if !key_ok {
        return Err(ServerError::InvalidProperty(format!(
            "`{}` is not a property name",
            key
        )));
    }
    if value.contains(['\n', '\r']) {
        return Err(ServerError::InvalidProperty(
            "values must fit on one line".into(),
        ));
    }
    Ok(())
}

/// Committed definitions on disk. Directories still being materialized are
/// left out.
pub(super) async fn definitions(
    storage_root: &Path,
    inner: &TenantInner,
) -> ServerResult<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    let mut entries = match fs::read_dir(storage_root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !inner.pending.contains(name) {
                names.insert(name.to_string());
            }
        }
    }
    Ok(names)
}

/// Rejects edits to the definition the guild's session is using.
fn ensure_not_active(inner: &TenantInner, name: &str) -> ServerResult<()> {
    match &inner.session {
        Some(session) if session.server_name == name => {
            Err(ServerError::ServerRunning(name.to_string()))
        }
        _ => Ok(()),
    }
}

/// A name held in `pending` by an unfinished `create`. If the create is
/// dropped before it settles, the name and any files already written are
/// removed in the background.
struct Reservation {
    tenant: Arc<TenantState>,
    name: String,
    settled: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("Creation of {} was abandoned outside a runtime", self.name);
            return;
        };

        let tenant = self.tenant.clone();
        let name = std::mem::take(&mut self.name);
        runtime.spawn(async move {
            let mut inner = tenant.lock().await;
            match fs::remove_dir_all(tenant.storage_root().join(&name)).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => error!("Cleanup of abandoned {} left files behind: {}", name, err),
            }
            inner.pending.remove(&name);
            warn!("Creation of {} for guild {} was abandoned", name, tenant.id());
        });
    }
}

#[derive(Debug, Clone)]
pub struct ServerCatalog {
    tenant: Arc<TenantState>,
    engine: Arc<dyn ServerEngine>,
}

impl ServerCatalog {
    pub fn new(tenant: Arc<TenantState>, engine: Arc<dyn ServerEngine>) -> Self {
        Self { tenant, engine }
    }

    pub async fn list(&self) -> ServerResult<Vec<String>> {
        let inner = self.tenant.lock().await;
        Ok(definitions(self.tenant.storage_root(), &inner)
            .await?
            .into_iter()
            .collect())
    }

    pub async fn count(&self) -> ServerResult<usize> {
        Ok(self.list().await?.len())
    }

    pub async fn exists(&self, name: &str) -> ServerResult<bool> {
        Ok(self.list().await?.iter().any(|n| n == name))
    }

    /// Reserves `name` under the guild lock, lets the engine lay out the files
    /// without holding it, then commits or removes whatever was written.
    pub async fn create(&self, name: &str, version: Option<&str>) -> ServerResult<ServerDefinition> {
        let name = ServerName::parse(name)?;
        let root = self.tenant.storage_root();

        {
            let mut inner = self.tenant.lock().await;
            let existing = definitions(root, &inner).await?;

            if existing.contains(name.as_str()) || inner.pending.contains(name.as_str()) {
                return Err(ServerError::NameTaken(name.as_str().to_string()));
            }
            if !quota::can_create(existing.len() + inner.pending.len(), inner.max_servers) {
                return Err(ServerError::QuotaExceeded {
                    max: inner.max_servers,
                });
            }
            inner.pending.insert(name.as_str().to_string());
        }
        let mut reservation = Reservation {
            tenant: self.tenant.clone(),
            name: name.as_str().to_string(),
            settled: false,
        };

        let result = self.engine.materialize(root, name.as_str(), version).await;

        let mut inner = self.tenant.lock().await;
        let outcome = match result {
            Ok(version) => {
                info!(
                    "Created server {} ({}) for guild {}",
                    name.as_str(),
                    version,
                    self.tenant.id()
                );
                Ok(ServerDefinition {
                    name: name.as_str().to_string(),
                    version,
                })
            }
            Err(e) => {
                warn!(
                    "Creating server {} for guild {} failed, rolling back: {}",
                    name.as_str(),
                    self.tenant.id(),
                    e
                );
                match fs::remove_dir_all(root.join(name.as_str())).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => error!("Rollback of {} left files behind: {}", name.as_str(), err),
                }
                Err(e.into())
            }
        };
        inner.pending.remove(name.as_str());
        reservation.settled = true;
        outcome
    }

    pub async fn edit_property(&self, name: &str, key: &str, value: &str) -> ServerResult<()> {
        validate_property(key, value)?;
        let inner = self.tenant.lock().await;
        let root = self.tenant.storage_root();

        if !definitions(root, &inner).await?.contains(name) {
            return Err(ServerError::ServerNotFound(name.to_string()));
        }
        ensure_not_active(&inner, name)?;

        self.engine.write_property(root, name, key, value).await?;
        info!(
            "Set {}={} on {} for guild {}",
            key,
            value,
            name,
            self.tenant.id()
        );
        Ok(())
    }

    pub async fn read_property(&self, name: &str, key: &str) -> ServerResult<Option<String>> {
        let inner = self.tenant.lock().await;
        let root = self.tenant.storage_root();

        if !definitions(root, &inner).await?.contains(name) {
            return Err(ServerError::ServerNotFound(name.to_string()));
        }
        Ok(self.engine.read_property(root, name, key).await?)
    }

    pub async fn delete(&self, name: &str) -> ServerResult<()> {
        let inner = self.tenant.lock().await;
        let root = self.tenant.storage_root();

        if !definitions(root, &inner).await?.contains(name) {
            return Err(ServerError::ServerNotFound(name.to_string()));
        }
        ensure_not_active(&inner, name)?;

        fs::remove_dir_all(root.join(name)).await?;
        info!("Deleted server {} for guild {}", name, self.tenant.id());
        Ok(())
    }
}
