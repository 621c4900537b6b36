//! Error taxonomy shared by every service module.
//!
//! Every rejected mutation surfaces one of these variants verbatim to the
//! caller; none of them is retried internally. The storage layer's unique
//! constraints act as the final backstop behind the read-then-check pattern,
//! so a raw `sqlx` unique violation is translated into [`ClinicError::Conflict`]
//! before it reaches the caller.

use thiserror::Error;

pub type Result<T, E = ClinicError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ClinicError {
    /// Malformed or missing input, reported per field.
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// Uniqueness or state-machine violation (duplicate national id,
    /// duplicate dependent pair, duplicate active visit, bad transition).
    #[error("{0}")]
    Conflict(String),

    /// The operation targets an id that does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Permission or ownership check failed. Raised before any data is
    /// touched; a denied call has zero observable side effects.
    #[error("{0}")]
    Unauthorized(String),

    /// A referenced catalog row is still in use and cannot be removed.
    #[error("{0}")]
    Integrity(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl ClinicError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        ClinicError::Validation { field, message: message.into() }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        ClinicError::NotFound { entity, id: id.into() }
    }

    /// Remap a storage-layer unique violation to the conflict it protects
    /// against. The pre-check usually catches duplicates first; this covers
    /// the race window between the check and the write.
    pub fn on_unique(self, message: &str) -> Self {
        let raced = matches!(
            &self,
            ClinicError::Storage(sqlx::Error::Database(db)) if db.is_unique_violation()
        );
        if raced {
            ClinicError::Conflict(message.to_string())
        } else {
            self
        }
    }
}
