// RabbitWhisk Infrastructure - HTTP Adapter
// Implements: Invoker, InvokerFactory

mod whisk_invoker;

pub use whisk_invoker::{WhiskInvoker, WhiskInvokerFactory, WhiskSettings};
