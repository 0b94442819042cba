use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Local store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Malformed record data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{table}: server returned {status}: {message}")]
    Status {
        table: String,
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("{0}: insert returned no rows")]
    EmptyInsert(&'static str),

    #[error("Invalid backend configuration: {0}")]
    InvalidConfig(String),

    #[error("Local store lock poisoned")]
    Poisoned,
}

impl StorageError {
    /// PostgREST / Postgres error code, when the server supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            StorageError::Status { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
