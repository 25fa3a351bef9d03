// AMQP connector
// Builds the broker URI + TLS trust once, opens one connection per worker cycle
use async_trait::async_trait;
use lapin::tcp::OwnedTLSConfig;
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{Connection, ConnectionProperties};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use rabbitwhisk_core::domain::BrokerEndpoint;
use rabbitwhisk_core::port::{QueueConnection, QueueConnector, QueueError};

use crate::connection::AmqpQueueConnection;

/// Connector over a shared, read-only broker endpoint
pub struct AmqpConnector {
    endpoint: Arc<BrokerEndpoint>,
}

impl AmqpConnector {
    pub fn new(endpoint: Arc<BrokerEndpoint>) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Broker URI; credentials and vhost are passed verbatim
    pub(crate) fn uri(&self) -> AMQPUri {
        let endpoint = &self.endpoint;
        let scheme = if endpoint.tls.enabled {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        };

        AMQPUri {
            scheme,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: endpoint.credentials.username().to_string(),
                    password: endpoint.credentials.password().to_string(),
                },
                host: endpoint.host.clone(),
                port: endpoint.port,
            },
            vhost: endpoint.vhost.clone(),
            ..Default::default()
        }
    }

    /// PEM CA chain to trust, read once per connect call
    ///
    /// `None` means the platform trust store (or no TLS at all).
    pub(crate) async fn ca_chain(&self) -> Result<Option<String>, QueueError> {
        let tls = &self.endpoint.tls;
        match &tls.ca_certificate {
            Some(path) if tls.enabled => Ok(Some(read_ca_certificate(path).await?)),
            _ => Ok(None),
        }
    }
}

/// TLS config for one connect attempt; each attempt takes ownership of its own
fn tls_config(cert_chain: Option<&str>) -> OwnedTLSConfig {
    OwnedTLSConfig {
        identity: None,
        cert_chain: cert_chain.map(str::to_string),
    }
}

async fn read_ca_certificate(path: &Path) -> Result<String, QueueError> {
    let pem = tokio::fs::read_to_string(path).await.map_err(|e| {
        QueueError::Config(format!(
            "cannot read CA certificate {}: {}",
            path.display(),
            e
        ))
    })?;

    if !pem.contains("-----BEGIN CERTIFICATE-----") {
        return Err(QueueError::Config(format!(
            "CA certificate {} contains no PEM certificate",
            path.display()
        )));
    }
    Ok(pem)
}

#[async_trait]
impl QueueConnector for AmqpConnector {
    async fn connect(
        &self,
        attempts: u32,
        retry_delay: Duration,
    ) -> Result<Arc<dyn QueueConnection>, QueueError> {
        let attempts = attempts.max(1);
        let ca_chain = self.ca_chain().await?;
        let uri = self.uri();
        let mut reason = String::new();

        for attempt in 1..=attempts {
            debug!(broker = %self.endpoint, attempt, "Opening broker connection");
            let connected = Connection::connect_uri_with_config(
                uri.clone(),
                ConnectionProperties::default(),
                tls_config(ca_chain.as_deref()),
            )
            .await;

            match connected {
                Ok(connection) => {
                    let channel = connection
                        .create_channel()
                        .await
                        .map_err(|e| QueueError::Broker(format!("channel open failed: {e}")))?;
                    info!(broker = %self.endpoint, "Connected to broker");
                    return Ok(Arc::new(AmqpQueueConnection::new(connection, channel)));
                }
                Err(e) => {
                    reason = e.to_string();
                    warn!(
                        broker = %self.endpoint,
                        attempt,
                        attempts,
                        error = %e,
                        "Broker connection failed"
                    );
                    if attempt < attempts {
                        sleep(retry_delay).await;
                    }
                }
            }
        }

        Err(QueueError::Connection { attempts, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rabbitwhisk_core::domain::{Credentials, TlsSettings};
    use std::path::PathBuf;

    fn endpoint(tls: TlsSettings) -> Arc<BrokerEndpoint> {
        Arc::new(
            BrokerEndpoint::new("mq.example.com", 5671, "relay", Credentials::new("feeder", "s3cret"))
                .with_tls(tls),
        )
    }

    #[test]
    fn test_uri_carries_endpoint_coordinates() {
        let connector = AmqpConnector::new(endpoint(TlsSettings::default()));
        let uri = connector.uri();

        assert_eq!(uri.scheme, AMQPScheme::AMQPS);
        assert_eq!(uri.authority.host, "mq.example.com");
        assert_eq!(uri.authority.port, 5671);
        assert_eq!(uri.authority.userinfo.username, "feeder");
        assert_eq!(uri.authority.userinfo.password, "s3cret");
        assert_eq!(uri.vhost, "relay");
    }

    #[test]
    fn test_plain_scheme_without_tls() {
        let connector = AmqpConnector::new(endpoint(TlsSettings::disabled()));
        assert_eq!(connector.uri().scheme, AMQPScheme::AMQP);
    }

    #[tokio::test]
    async fn test_missing_ca_file_is_config_error() {
        let connector = AmqpConnector::new(endpoint(TlsSettings {
            enabled: true,
            ca_certificate: Some(PathBuf::from("/nonexistent/rabbitwhisk/ca.pem")),
        }));

        let err = connector
            .connect(3, Duration::from_millis(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Config(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_ca_file_without_certificate_is_rejected() {
        let path = std::env::temp_dir().join(format!("rabbitwhisk-ca-{}.pem", std::process::id()));
        tokio::fs::write(&path, "not a certificate").await.unwrap();

        let connector = AmqpConnector::new(endpoint(TlsSettings {
            enabled: true,
            ca_certificate: Some(path.clone()),
        }));
        let result = connector.ca_chain().await;
        tokio::fs::remove_file(&path).await.unwrap();

        assert!(matches!(result.err(), Some(QueueError::Config(_))));
    }

    #[tokio::test]
    async fn test_ca_chain_feeds_every_attempt() {
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        let path = std::env::temp_dir().join(format!("rabbitwhisk-ca-ok-{}.pem", std::process::id()));
        tokio::fs::write(&path, pem).await.unwrap();

        let connector = AmqpConnector::new(endpoint(TlsSettings {
            enabled: true,
            ca_certificate: Some(path.clone()),
        }));
        let chain = connector.ca_chain().await;
        tokio::fs::remove_file(&path).await.unwrap();

        let chain = chain.unwrap();
        assert_eq!(chain.as_deref(), Some(pem));
        for _ in 0..2 {
            let config = tls_config(chain.as_deref());
            assert_eq!(config.cert_chain.as_deref(), Some(pem));
            assert!(config.identity.is_none());
        }
    }

    #[tokio::test]
    async fn test_no_ca_chain_without_tls() {
        let connector = AmqpConnector::new(endpoint(TlsSettings {
            enabled: false,
            ca_certificate: Some(PathBuf::from("/nonexistent/rabbitwhisk/ca.pem")),
        }));
        assert_eq!(connector.ca_chain().await, Ok(None));
        assert!(tls_config(None).cert_chain.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_broker_exhausts_attempts() {
        let connector = AmqpConnector::new(Arc::new(
            BrokerEndpoint::new("127.0.0.1", 1, "/", Credentials::new("guest", "guest"))
                .with_tls(TlsSettings::disabled()),
        ));

        let err = connector
            .connect(2, Duration::from_millis(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, QueueError::Connection { attempts: 2, .. }));
        assert!(!err.is_fatal());
    }
}
