//! Error types for storage and domain operations.
//!
//! Database failures are folded into a small taxonomy so callers can tell a
//! missing row from a constraint problem without matching on driver errors.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let error = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(error, CoreError::NotFound(_)));
    }

    #[test]
    fn other_sqlx_errors_map_to_database() {
        let error = CoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(error, CoreError::Database(_)));
        assert!(error.to_string().starts_with("Database error:"));
    }
}
