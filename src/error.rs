use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("authentication required: {0}")]
    Unauthenticated(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("eligibility snapshot is stale: {0}")]
    StaleSnapshot(String),

    #[error("cannot {action} while the session is at the {stage} stage")]
    InvalidTransition { action: String, stage: String },

    #[error("storage error: {0}")]
    Storage(String),
}

pub type PromotionResult<T> = Result<T, PromotionError>;

impl PromotionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

impl From<sqlx::Error> for PromotionError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("record".to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for PromotionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("invalid stored document: {err}"))
    }
}
