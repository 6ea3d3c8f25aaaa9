use thiserror::Error;

/// Errors that can occur while reading or writing run records.
#[derive(Debug, Error)]
pub enum RunLogError {
    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No run with the given id was ever started.
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The run already reached a terminal status; records are finalized once.
    #[error("run {run_id} already finalized as {status}")]
    AlreadyFinalized { run_id: String, status: String },

    /// Another thread panicked while holding the connection lock.
    #[error("run log connection poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, RunLogError>;
