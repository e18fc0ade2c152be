use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
