// Error types for boringproxy

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("Domain already in use: {0}")]
    DomainInUse(String),

    #[error("Tunnel port already in use: {0}")]
    PortInUse(u16),

    #[error("Connection is not TLS")]
    NotTls,

    #[error("Malformed TLS ClientHello")]
    MalformedClientHello,

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("SSH key error: {0}")]
    SshKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
