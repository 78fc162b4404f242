use crate::engine::EngineError;
use thiserror::Error;

/// Everything a server command can fail with. The messages are shown to
/// guild members as they are.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("This Discord server already has {max} saved Minecraft servers, which is its limit")]
    QuotaExceeded { max: usize },
    #[error("A server named `{0}` already exists")]
    NameTaken(String),
    #[error("There is no saved server named `{0}`")]
    ServerNotFound(String),
    #[error("`{0}` is not a valid server name, use 1-32 letters, digits, `-` or `_`")]
    InvalidName(String),
    #[error("Invalid property: {0}")]
    InvalidProperty(String),
    #[error("`{0}` is already active here, stop it before starting another server")]
    AlreadyRunning(String),
    #[error("No server is running")]
    NotRunning,
    #[error("Only the member who started the server, or someone holding its secret, can do that")]
    Unauthorized,
    #[error("`{0}` is active, stop it before changing it")]
    ServerRunning(String),
    #[error("Server engine error: {0}")]
    Engine(#[from] EngineError),
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Engine(EngineError::Io(e))
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
