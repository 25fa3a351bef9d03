//! Native action entry point
//! Parameters arrive as JSON in the first argument; the result is the last stdout line

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use rabbitwhisk_action::run_action;
use rabbitwhisk_core::domain::BrokerEndpoint;
use rabbitwhisk_core::port::QueueConnector;
use rabbitwhisk_infra_amqp::AmqpConnector;

const ACTIVATION_ID_VAR: &str = "__OW_ACTIVATION_ID";

#[tokio::main]
async fn main() -> Result<()> {
    // stdout is reserved for the result
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?)
        .init();

    let args: Value = match std::env::args().nth(1) {
        Some(raw) => serde_json::from_str(&raw).context("Action parameters are not JSON")?,
        None => Value::Object(Default::default()),
    };
    let activation = std::env::var(ACTIVATION_ID_VAR).ok();

    let result = run_action(&args, activation.as_deref(), |endpoint: BrokerEndpoint| -> Arc<dyn QueueConnector> {
        Arc::new(AmqpConnector::new(Arc::new(endpoint)))
    })
    .await;

    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}
