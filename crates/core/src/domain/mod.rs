// Domain Layer - Endpoints, queue declaration and message framing

pub mod endpoint;
pub mod error;
pub mod message;
pub mod queue;

// Re-exports
pub use endpoint::{BrokerEndpoint, Credentials, InvocationEndpoint, TlsSettings};
pub use error::DomainError;
pub use message::{payload_preview, InFlightMessage, InvocationEnvelope, InvocationResult};
pub use queue::{QueueName, QueueSpec};
