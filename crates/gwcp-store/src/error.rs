use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Core(#[from] gwcp_core::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<StoreError> for gwcp_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Core(e) => e,
            StoreError::Database(sqlx::Error::RowNotFound) => {
                gwcp_core::Error::NotFound("row not found".to_string())
            }
            StoreError::Database(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                gwcp_core::Error::Conflict(db_err.to_string())
            }
            StoreError::Database(e) => gwcp_core::Error::Dependency(e.to_string()),
            StoreError::Migration(e) => gwcp_core::Error::Fatal(e.to_string()),
        }
    }
}
