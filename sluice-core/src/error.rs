use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("lock on {0} could not be acquired")]
    LockTimeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
