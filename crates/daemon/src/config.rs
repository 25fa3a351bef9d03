//! Daemon configuration
//! Flags with environment fallbacks, validated into core settings

use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use rabbitwhisk_core::application::worker::constants::{DEFAULT_MAX_RETRIES, MAX_WORKERS};
use rabbitwhisk_core::application::{SupervisorSettings, WorkerSettings};
use rabbitwhisk_core::domain::{
    BrokerEndpoint, Credentials, InvocationEndpoint, QueueSpec, TlsSettings,
};
use rabbitwhisk_core::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable, multi-line
    Pretty,
    /// One JSON object per event
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "rabbitwhisk")]
#[command(about = "Relay broker queue messages to serverless action invocations", long_about = None)]
#[command(version)]
pub struct Config {
    /// Broker host
    #[arg(long, env = "RABBIT_BROKER")]
    pub broker: String,

    /// Broker port
    #[arg(long, env = "RABBIT_PORT")]
    pub port: u16,

    /// Broker user
    #[arg(long, env = "RABBIT_USER")]
    pub user: String,

    /// Broker password
    #[arg(long, env = "RABBIT_PWD", hide_env_values = true)]
    pub password: String,

    /// Broker virtual host
    #[arg(long, env = "RABBIT_VHOST")]
    pub vhost: String,

    /// Connect over TLS
    #[arg(long, env = "RABBIT_TLS", default_value_t = true, action = ArgAction::Set)]
    pub tls: bool,

    /// CA certificate (PEM) trusted for the broker
    #[arg(long, env = "CERT")]
    pub cert: Option<PathBuf>,

    /// Queue to subscribe to
    #[arg(long, env = "FEED_QUEUE")]
    pub feed_queue: String,

    /// Concurrent broker connections (one worker each)
    #[arg(long, env = "RABBIT_CONNECTIONS", default_value_t = 1)]
    pub connections: usize,

    /// Seconds without a delivery before a connection is recycled
    #[arg(long, env = "SUBSCRIBE_TIMEOUT", default_value_t = 3600)]
    pub subscribe_timeout: u64,

    /// Action invoked for every message
    #[arg(long = "action", env = "WHISK_ACTION")]
    pub action: String,

    /// Invocation attempts per message
    #[arg(long, env = "WHISK_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub retries: u32,

    /// Invocation API base URL
    #[arg(long, env = "WHISK_URL")]
    pub whisk_url: String,

    /// Invocation credentials as `user:password`
    #[arg(long, env = "WHISK_AUTH", hide_env_values = true)]
    pub whisk_auth: String,

    /// Invocation namespace
    #[arg(long, env = "WHISK_SPACE")]
    pub whisk_space: String,

    /// Log output format
    #[arg(long, env = "RABBITWHISK_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Config {
    /// Broker coordinates; the CA file must exist when given
    pub fn broker_endpoint(&self) -> Result<BrokerEndpoint, AppError> {
        let tls = if self.tls {
            TlsSettings {
                enabled: true,
                ca_certificate: self.cert.clone(),
            }
        } else {
            TlsSettings::disabled()
        };

        if let Some(cert) = tls.ca_certificate.as_ref().filter(|_| tls.enabled) {
            if !cert.is_file() {
                return Err(AppError::Config(format!(
                    "CA certificate not found: {}",
                    cert.display()
                )));
            }
        }

        let endpoint = BrokerEndpoint::new(
            self.broker.clone(),
            self.port,
            self.vhost.clone(),
            Credentials::new(self.user.clone(), self.password.clone()),
        )
        .with_tls(tls);
        endpoint.validate()?;
        Ok(endpoint)
    }

    pub fn invocation_endpoint(&self) -> Result<InvocationEndpoint, AppError> {
        let credentials = Credentials::from_auth_key(&self.whisk_auth)?;
        let endpoint =
            InvocationEndpoint::new(self.whisk_url.clone(), self.whisk_space.clone(), credentials);
        endpoint.validate()?;
        Ok(endpoint)
    }

    pub fn worker_settings(&self) -> Result<WorkerSettings, AppError> {
        let queue = QueueSpec::new(self.feed_queue.clone());
        queue.validate()?;

        if self.action.trim().is_empty() {
            return Err(AppError::Config("action cannot be empty".to_string()));
        }
        if self.retries == 0 {
            return Err(AppError::Config("retries must be at least 1".to_string()));
        }
        if self.subscribe_timeout == 0 {
            return Err(AppError::Config(
                "subscribe timeout must be at least 1 second".to_string(),
            ));
        }

        let mut settings = WorkerSettings::new(queue, self.action.clone());
        settings.inactivity_timeout = Duration::from_secs(self.subscribe_timeout);
        settings.handler.max_retries = self.retries;
        Ok(settings)
    }

    pub fn supervisor_settings(&self) -> Result<SupervisorSettings, AppError> {
        if self.connections == 0 {
            return Err(AppError::Config(
                "connections must be at least 1".to_string(),
            ));
        }
        if self.connections > MAX_WORKERS {
            tracing::warn!(
                requested = self.connections,
                max = MAX_WORKERS,
                "Connection count capped"
            );
        }
        Ok(SupervisorSettings::new(self.connections))
    }
}
