use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Malformed cron expression, unknown reference, missing storage settings.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dump failed for database {database}: {message}")]
    Dump { database: String, message: String },

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Retention failed: {0}")]
    Retention(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("History store error: {0}")]
    Store(String),

    #[error("Lock error on {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("FTP error: {0}")]
    Ftp(#[from] suppaftp::FtpError),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl BackupError {
    pub fn config(message: impl Into<String>) -> Self {
        BackupError::Config(message.into())
    }

    pub fn upload(message: impl Into<String>) -> Self {
        BackupError::Upload(message.into())
    }

    pub fn dump(database: impl Into<String>, message: impl Into<String>) -> Self {
        BackupError::Dump {
            database: database.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
