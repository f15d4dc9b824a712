use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrismError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unsupported schema in table '{table}': {reason}")]
    UnsupportedSchema { table: String, reason: String },

    #[error("Workspace invariant violated: {0}")]
    WorkspaceInvariant(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] rusqlite::Error),

    #[error("Changeset error: {0}")]
    ChangesetError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PrismError>;
