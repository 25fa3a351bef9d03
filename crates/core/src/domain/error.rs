// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
