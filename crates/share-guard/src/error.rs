use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShareGuardError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stage cancelled")]
    Cancelled,

    #[error("Worker pool closed")]
    WorkerPoolClosed,

    #[error("{0}")]
    Stage(String),
}

pub type Result<T> = std::result::Result<T, ShareGuardError>;
