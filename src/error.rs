//! Error types for termshare

use thiserror::Error;

/// Main error type for termshare
#[derive(Error, Debug)]
pub enum Error {
    #[error("bad identifier: {0}")]
    BadIdentifier(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session registry unavailable: {0}")]
    Unavailable(String),

    #[error("session already exists: {0}")]
    Conflict(String),

    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected by upstream")]
    AuthRejected,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("proxy is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    SshKey(#[from] russh::keys::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("admin socket error: {0}")]
    Admin(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error aborts a downstream handshake as expected
    /// per-connection noise (worth a debug line, not an error line).
    pub fn is_handshake_noise(&self) -> bool {
        matches!(self, Error::BadIdentifier(_) | Error::NotFound(_))
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
