#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid header payload: {0}")]
    Header(#[from] serde_json::Error),

    #[error("invalid request URL: {0}")]
    Url(String),

    #[error("compression error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for webreq_common::Error {
    fn from(e: StoreError) -> Self {
        webreq_common::Error::Store(e.to_string())
    }
}
