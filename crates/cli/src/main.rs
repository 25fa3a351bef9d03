//! RabbitWhisk CLI - broker diagnostics
//! Connectivity check, round-trip latency test, publish, drain

mod commands;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::Table;
use tracing_subscriber::EnvFilter;

use rabbitwhisk_core::domain::{BrokerEndpoint, Credentials, TlsSettings};
use rabbitwhisk_infra_amqp::AmqpConnector;

const DEFAULT_ROUND_TRIP_MESSAGES: usize = 10;

#[derive(Parser)]
#[command(name = "rabbitwhisk-cli")]
#[command(about = "RabbitWhisk broker diagnostics", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    broker: BrokerArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BrokerArgs {
    /// Broker host
    #[arg(long, env = "RABBIT_BROKER", global = true)]
    broker: Option<String>,

    /// Broker port
    #[arg(long, env = "RABBIT_PORT", global = true)]
    port: Option<u16>,

    /// Broker user
    #[arg(long, env = "RABBIT_USER", global = true)]
    user: Option<String>,

    /// Broker password
    #[arg(long, env = "RABBIT_PWD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Broker virtual host
    #[arg(long, env = "RABBIT_VHOST", global = true)]
    vhost: Option<String>,

    /// Connect over TLS
    #[arg(long, env = "RABBIT_TLS", default_value_t = true, action = ArgAction::Set, global = true)]
    tls: bool,

    /// CA certificate (PEM) trusted for the broker
    #[arg(long, env = "CERT", global = true)]
    cert: Option<PathBuf>,
}

impl BrokerArgs {
    fn endpoint(&self) -> Result<BrokerEndpoint> {
        let host = self.broker.clone().context("RABBIT_BROKER must have a value")?;
        let port = self.port.context("RABBIT_PORT must have a value")?;
        let user = self.user.clone().context("RABBIT_USER must have a value")?;
        let password = self.password.clone().context("RABBIT_PWD must have a value")?;
        let vhost = self.vhost.clone().context("RABBIT_VHOST must have a value")?;

        let tls = if self.tls {
            TlsSettings {
                enabled: true,
                ca_certificate: self.cert.clone(),
            }
        } else {
            TlsSettings::disabled()
        };

        let endpoint =
            BrokerEndpoint::new(host, port, vhost, Credentials::new(user, password)).with_tls(tls);
        endpoint.validate()?;
        Ok(endpoint)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the broker accepts a connection
    Check,

    /// Publish requests to the feed queue and time the replies
    RoundTrip {
        /// Queue the relay consumes
        #[arg(long, env = "FEED_QUEUE")]
        feed_queue: String,

        /// Queue the action replies to
        #[arg(long, env = "REPLY_QUEUE")]
        reply_queue: String,

        /// Requests to send
        #[arg(short = 'n', long, default_value_t = DEFAULT_ROUND_TRIP_MESSAGES)]
        messages: usize,

        /// Seconds to wait for the next reply
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Publish one message
    Publish {
        /// Target queue
        #[arg(short, long)]
        queue: String,

        /// Message body
        body: String,
    },

    /// Consume and acknowledge messages
    Drain {
        /// Source queue
        #[arg(short, long)]
        queue: String,

        /// Maximum messages (0 = until idle)
        #[arg(short = 'n', long, default_value = "0")]
        max: usize,

        /// Seconds to wait for the next message
        #[arg(long, default_value = "5")]
        timeout: u64,

        /// Print a preview of every message
        #[arg(long)]
        echo: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(
            EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("warn"))?,
        )
        .init();

    let endpoint = cli.broker.endpoint()?;
    let connector = AmqpConnector::new(Arc::new(endpoint));

    match cli.command {
        Commands::Check => {
            println!("Connecting to {}...", connector.endpoint());
            match commands::check(&connector).await {
                Ok(()) => println!(
                    "{}",
                    "SUCCESS - connection to the broker verified.".green().bold()
                ),
                Err(e) => {
                    println!(
                        "{}",
                        "FAILED - connection to the broker not verified.".red().bold()
                    );
                    println!("  {} {:#}", "Error:".bold(), e);
                    std::process::exit(1);
                }
            }
        }

        Commands::RoundTrip {
            feed_queue,
            reply_queue,
            messages,
            timeout,
        } => {
            let report = commands::round_trip(
                &connector,
                &feed_queue,
                &reply_queue,
                messages,
                Duration::from_secs(timeout),
            )
            .await?;

            let headline = if report.received as usize == messages {
                "✓ Round trip complete".green().bold()
            } else {
                "✗ Round trip incomplete".yellow().bold()
            };
            println!("{}", headline);
            println!();
            println!("{}", Table::new(vec![report]));
        }

        Commands::Publish { queue, body } => {
            commands::publish(&connector, &queue, body.as_bytes()).await?;
            println!("{}", format!("✓ Published to {}", queue).green().bold());
        }

        Commands::Drain {
            queue,
            max,
            timeout,
            echo,
        } => {
            let drained =
                commands::drain(&connector, &queue, max, Duration::from_secs(timeout), echo)
                    .await?;
            println!(
                "{}",
                format!("✓ Drained {} message(s) from {}", drained, queue)
                    .green()
                    .bold()
            );
        }
    }

    Ok(())
}
