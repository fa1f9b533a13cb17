use thiserror::Error;

/// Ошибки кодирования события в кадр wire-протокола.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Payload serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
