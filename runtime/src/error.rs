use module_kit_protocol::RpcError;
use thiserror::Error;

/// Errors from the module registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate name of module: {0}")]
    DuplicateName(String),

    #[error("not found for name: {0}")]
    NotFound(String),

    #[error("not support remote name now: {0}")]
    RemoteNotSupported(String),

    #[error("module {0} does not serve the requested protocol")]
    ProtocolMismatch(String),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
}

/// Errors loading server configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown log level: {0}")]
    UnknownLogLevel(String),

    #[error("failed to install logger: {0}")]
    Logger(String),
}
