// Port Layer - Interfaces for external dependencies

pub mod invoker;
pub mod message_queue;

// Re-exports
pub use invoker::{InvocationError, Invoker, InvokerFactory};
pub use message_queue::{DeliveryHandler, QueueConnection, QueueConnector, QueueError};
