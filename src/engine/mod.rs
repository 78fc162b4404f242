//! The seam between the lifecycle controller and whatever actually downloads,
//! launches and stops Minecraft servers.

#[cfg(test)]
pub mod fake;
pub mod java;
pub mod manifest;
pub mod properties;

use async_trait::async_trait;
use std::{fmt, path::Path};
use thiserror::Error;

pub use java::JavaEngine;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Java could not be run ({0}), it must be installed to host servers")]
    MissingJava(String),
    #[error("Unknown Minecraft version `{0}`")]
    UnknownVersion(String),
    #[error("Server failed to start: {0}")]
    Launch(String),
    #[error("No server process is attached to session {0}")]
    UnknownSession(SessionHandle),
    #[error("{0}")]
    Custom(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Opaque reference to a process the engine launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A process that finished booting and accepts players.
#[derive(Debug, Clone)]
pub struct Launched {
    pub handle: SessionHandle,
    pub address: String,
}

/// Every path handed to an engine is a tenant storage root; the definition
/// itself lives in `storage.join(name)`.
#[async_trait]
pub trait ServerEngine: Send + Sync + fmt::Debug {
    async fn resolve_latest_version(&self) -> EngineResult<String>;

    /// Lays out a new definition on disk and returns the version it installed.
    async fn materialize(
        &self,
        storage: &Path,
        name: &str,
        version: Option<&str>,
    ) -> EngineResult<String>;

    /// Resolves once the server reports it is ready, or fails if it never does.
    async fn launch(&self, storage: &Path, name: &str, memory_gb: u32) -> EngineResult<Launched>;

    async fn terminate(&self, handle: SessionHandle) -> EngineResult<()>;

    async fn send_console_command(&self, handle: SessionHandle, text: &str)
        -> EngineResult<String>;

    async fn read_property(&self, storage: &Path, name: &str, key: &str)
        -> EngineResult<Option<String>>;

    async fn write_property(
        &self,
        storage: &Path,
        name: &str,
        key: &str,
        value: &str,
    ) -> EngineResult<()>;

    async fn is_alive(&self, handle: SessionHandle) -> bool;

    /// Forgets a handle whose process is gone, freeing whatever the engine
    /// kept for it. Unknown handles are ignored.
    async fn release(&self, handle: SessionHandle);
}
