#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("integrity: {0}")]
    Integrity(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for sa_domain::error::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => sa_domain::error::Error::Other(format!("not found: {m}")),
            StoreError::Validation(m) => sa_domain::error::Error::Validation(m),
            StoreError::Integrity(m) => sa_domain::error::Error::StoreIntegrity(m),
            StoreError::Io(e) => sa_domain::error::Error::Io(e),
            StoreError::Json(e) => sa_domain::error::Error::Json(e),
            StoreError::Sqlite(e) => sa_domain::error::Error::StoreIntegrity(e.to_string()),
        }
    }
}
