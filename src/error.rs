use thiserror::Error;

/// Failures surfaced by the record store and its backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("postgres backend failed: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{kind} with id {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid {kind}: {message}")]
    Invalid { kind: &'static str, message: String },
}

impl StoreError {
    pub fn invalid(kind: &'static str, message: impl Into<String>) -> Self {
        StoreError::Invalid {
            kind,
            message: message.into(),
        }
    }
}

/// Failures surfaced while mounting or rendering the distribution report.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no report container could be created after {attempts} attempts")]
    MissingContainer { attempts: u32 },

    #[error("chart rendering failed: {0}")]
    Chart(String),

    #[error("render cancelled")]
    Cancelled,

    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}
