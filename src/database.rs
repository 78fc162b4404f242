use serde::{de::DeserializeOwned, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{fs, sync::RwLock, time};
use tracing::{error, warn};

const SAVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Codec(String),
    #[error("Database error: {0}")]
    Custom(String),
}

#[derive(Debug)]
struct DatabaseInner<T> {
    data: T,
    path: PathBuf,
}

/// A bincode file mirrored in memory. Writers are serialized so every
/// transaction sees the result of the previous one.
#[derive(Clone, Debug)]
pub struct Database<T: Serialize + DeserializeOwned + Default + Send + Sync + Clone + 'static> {
    inner: Arc<RwLock<DatabaseInner<T>>>,
}

impl<T: Serialize + DeserializeOwned + Default + Send + Sync + Clone + 'static> Database<T> {
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self, DbError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                error!("Failed to create database directory: {}", e);
                DbError::Io(e)
            })?;
        }

        let data = match fs::read(&path).await {
            Ok(bytes) => bincode::deserialize(&bytes).unwrap_or_else(|e| {
                warn!("Failed to deserialize database {}: {}", path.display(), e);
                T::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(e) => {
                error!("Failed to read database {}: {}", path.display(), e);
                T::default()
            }
        };

        Ok(Self {
            inner: Arc::new(RwLock::new(DatabaseInner { data, path })),
        })
    }

    async fn save(path: &Path, data: &T) -> Result<(), DbError> {
        let bytes = bincode::serialize(data).map_err(|e| DbError::Codec(e.to_string()))?;
        let staging = path.with_extension("tmp");

        let write = async {
            fs::write(&staging, bytes).await?;
            fs::rename(&staging, path).await
        };

        match time::timeout(SAVE_TIMEOUT, write).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                error!("Database save operation timed out");
                Err(DbError::Custom("Save operation timed out".into()))
            }
        }
    }

    /// Applies `f` to a copy of the data and swaps it in once it is on disk.
    /// Nothing changes if `f` or the save fails.
    pub async fn transaction<F, R>(&self, f: F) -> Result<R, DbError>
    where
        F: FnOnce(&mut T) -> Result<R, String>,
    {
        let mut guard = self.inner.write().await;
        let mut data = guard.data.clone();
        let result = f(&mut data).map_err(DbError::Custom)?;

        Self::save(&guard.path, &data).await?;
        guard.data = data;

        Ok(result)
    }

    pub async fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        let guard = self.inner.read().await;
        f(&guard.data)
    }
}
