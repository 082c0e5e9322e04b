/// Shared error type used across all skillrunner crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("MCP: {0}")]
    Mcp(String),

    #[error("session: {0}")]
    Session(String),

    /// Caller misuse that maps to a 400-equivalent at the transport edge
    /// (wrong response mode, unpublished preset, bad option values).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
