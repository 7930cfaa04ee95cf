use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid subdomain: {0}")]
    InvalidSubdomain(String),

    #[error("invalid greeting message: {0}")]
    InvalidGreeting(String),

    #[error("frame encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("frame decode error: malformed or missing frame: {0}")]
    Decode(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
