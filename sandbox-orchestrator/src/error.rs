use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Bookkeeping and request errors. Anything returned from an executor as an
/// `OrchestratorError` aborts the unit of work; driver failures never do and
/// are recorded against the member instead.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Workshop not found: {0}")]
    WorkshopNotFound(String),

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Workshop busy: {0}")]
    WorkshopBusy(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Corrupt record: {0}")]
    InvalidData(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job failed to complete: {0}")]
    Job(String),
}

/// Why a blocking driver call produced no answer.
#[derive(Error, Debug)]
pub enum DriverCallError {
    #[error(transparent)]
    Driver(#[from] sandbox_driver::DriverError),

    #[error("driver call timed out after {:?}", .0)]
    TimedOut(Duration),

    #[error("driver task failed: {0}")]
    Join(String),
}
