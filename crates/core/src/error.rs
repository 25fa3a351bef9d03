// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue error: {0}")]
    Queue(#[from] crate::port::QueueError),

    #[error("Invocation error: {0}")]
    Invocation(#[from] crate::port::InvocationError),

    #[error("Handler error: {0}")]
    Handler(#[from] crate::application::handler::HandlerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Fatal errors are configuration problems no reconnect can fix
    pub fn is_fatal(&self) -> bool {
        match self {
            AppError::Domain(_) | AppError::Config(_) => true,
            AppError::Queue(e) => e.is_fatal(),
            AppError::Invocation(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
