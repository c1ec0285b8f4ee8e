use sonata_core::IdentityError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Hash(String),

    #[error("failed to read user file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid user file: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AuthError> for IdentityError {
    fn from(err: AuthError) -> Self {
        IdentityError::Internal(err.to_string())
    }
}
