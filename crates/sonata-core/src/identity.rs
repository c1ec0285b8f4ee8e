//! Contract for the user store behind `/login` and `/register`.

use thiserror::Error;

/// Reply sent back to the client as `success` / `message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub success: bool,
    pub message: String,
}

impl Verdict {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
    #[error("identity store error: {0}")]
    Internal(String),
}

/// User lookup and insertion.
///
/// Called concurrently from every worker thread; implementations serialize
/// internally. Calls may block.
pub trait IdentityStore: Send + Sync {
    fn login(&self, username: &str, password: &str) -> Result<Verdict, IdentityError>;

    fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<Verdict, IdentityError>;
}

pub(crate) const GENERIC_FAILURE: &str = "Service temporarily unavailable, please try again";

/// Run a store call, folding errors and panics into a failed [`Verdict`].
pub(crate) fn guarded<F>(op: &'static str, call: F) -> Verdict
where
    F: FnOnce() -> Result<Verdict, IdentityError>,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(call)) {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(e)) => {
            tracing::warn!(op, error = %e, "identity store call failed");
            Verdict::failure(GENERIC_FAILURE)
        }
        Err(_) => {
            tracing::warn!(op, "identity store panicked");
            Verdict::failure(GENERIC_FAILURE)
        }
    }
}
