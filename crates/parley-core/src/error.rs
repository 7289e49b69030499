use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ForumError {
    /// The caller may not see any of the requested content.
    #[error("not authorized")]
    Unauthorized,

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("invalid request: {0}")]
    Validation(String),

    /// Store, file, or mail collaborator failure.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ForumError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }
}

pub type Result<T> = std::result::Result<T, ForumError>;
