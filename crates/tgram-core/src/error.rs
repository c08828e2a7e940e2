use thiserror::Error;

/// Errors produced by the tgram protocol layer.
#[derive(Debug, Error)]
pub enum TgramError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid gram: {0}")]
    InvalidGram(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TgramError {
    fn from(e: serde_json::Error) -> Self {
        TgramError::Codec(e.to_string())
    }
}

impl From<base64::DecodeError> for TgramError {
    fn from(e: base64::DecodeError) -> Self {
        TgramError::Codec(e.to_string())
    }
}

pub type TgramResult<T> = Result<T, TgramError>;
