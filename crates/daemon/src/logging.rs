//! Logging setup
//! EnvFilter + JSON/pretty formatter over a non-blocking stdout writer

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "rabbitwhisk=info";

/// Install the global subscriber
///
/// Keep the returned guard alive until exit, or buffered events are lost.
pub fn init_logging(format: LogFormat) -> Result<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(writer))
                .try_init()?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_writer(writer))
                .try_init()?;
        }
    }

    Ok(guard)
}
