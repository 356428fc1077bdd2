use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The schedule entry definition failed validation.
    #[error("Invalid schedule entry: {0}")]
    InvalidEntry(String),

    /// No schedule entry with the given name exists in the store.
    #[error("Schedule entry not found: {name}")]
    EntryNotFound { name: String },

    /// A schedule entry with the given name already exists.
    #[error("Schedule entry already exists: {name}")]
    EntryExists { name: String },

    /// The action name is not registered.
    #[error("No such action: {name}")]
    UnknownAction { name: String },

    /// A task-result callback could not be delivered.
    #[error("Callback delivery failed: {0}")]
    Callback(String),

    /// Filesystem error (health-check file, CA bundle).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Broken invariant inside the scheduler itself.
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
