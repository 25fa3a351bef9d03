//! RabbitWhisk - Main Entry Point
//! Supervised broker consumers relaying every message to a serverless action

mod config;
mod logging;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use rabbitwhisk_core::application::{Supervisor, SupervisorSettings, WorkerSettings};
use rabbitwhisk_core::domain::{BrokerEndpoint, InvocationEndpoint};
use rabbitwhisk_core::AppError;
use rabbitwhisk_infra_amqp::AmqpConnector;
use rabbitwhisk_infra_http::{WhiskInvokerFactory, WhiskSettings};

use crate::config::Config;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration + logging
    let config = Config::parse();
    let _log_guard = logging::init_logging(config.log_format)?;

    info!("RabbitWhisk v{} starting...", VERSION);

    // 2. Validate everything before any worker starts
    let (broker, invocation, worker_settings, supervisor_settings) = match validate(&config) {
        Ok(validated) => validated,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };
    info!(
        broker = %broker,
        queue = %worker_settings.queue.name,
        action = %worker_settings.action,
        workers = supervisor_settings.num_workers,
        "Configuration loaded"
    );

    // 3. Wire adapters (DI)
    let connector = Arc::new(AmqpConnector::new(Arc::new(broker)));
    let invokers = Arc::new(WhiskInvokerFactory::new(
        Arc::new(invocation),
        WhiskSettings::default(),
    ));

    // 4. Termination signals, registered before workers start
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let terminate = async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    };

    // 5. Run the pool until terminated, then drain
    let supervisor = Supervisor::new(supervisor_settings, worker_settings, connector, invokers);
    let report = supervisor.run(terminate).await;

    info!(
        launched = report.launched,
        replaced = report.replaced,
        aborted = report.aborted,
        "Shutdown complete."
    );
    Ok(())
}

type Validated = (
    BrokerEndpoint,
    InvocationEndpoint,
    WorkerSettings,
    SupervisorSettings,
);

fn validate(config: &Config) -> Result<Validated, AppError> {
    Ok((
        config.broker_endpoint()?,
        config.invocation_endpoint()?,
        config.worker_settings()?,
        config.supervisor_settings()?,
    ))
}
