use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("item not found: {0}")]
    NotFound(String),

    #[error("queue is at capacity")]
    Full,

    #[error("queue is stopped")]
    Stopped,
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Store(e.to_string())
    }
}
