// RabbitWhisk Infrastructure - AMQP Adapter
// Implements: QueueConnector, QueueConnection

pub mod connection;
pub mod connector;

pub use connection::AmqpQueueConnection;
pub use connector::AmqpConnector;
