// Endpoint Domain Model
// Broker and invocation coordinates; immutable once built, shared read-only by every worker

use super::error::{DomainError, Result};
use std::fmt;
use std::path::PathBuf;

/// Username/password pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse a `user:password` auth key
    ///
    /// Only the first `:` separates the pair, so passwords may contain colons.
    pub fn from_auth_key(auth_key: &str) -> Result<Self> {
        let (username, password) = auth_key.split_once(':').ok_or_else(|| {
            DomainError::InvalidCredentials("auth key must have the form user:password".to_string())
        })?;

        if username.is_empty() {
            return Err(DomainError::InvalidCredentials(
                "auth key has an empty user".to_string(),
            ));
        }

        Ok(Self::new(username, password))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// TLS settings for the broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub enabled: bool,
    /// PEM bundle used to verify the broker certificate
    pub ca_certificate: Option<PathBuf>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_certificate: None,
        }
    }
}

impl TlsSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ca_certificate: None,
        }
    }
}

/// Broker coordinates
#[derive(Debug, Clone)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub credentials: Credentials,
    pub tls: TlsSettings,
}

impl BrokerEndpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        vhost: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            vhost: vhost.into(),
            credentials,
            tls: TlsSettings::default(),
        }
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "broker host cannot be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(DomainError::ValidationError(
                "broker port must be non-zero".to_string(),
            ));
        }
        if self.credentials.username().is_empty() {
            return Err(DomainError::InvalidCredentials(
                "broker user cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls.enabled { "amqps" } else { "amqp" };
        write!(
            f,
            "{}://{}@{}:{}/{}",
            scheme,
            self.credentials.username(),
            self.host,
            self.port,
            self.vhost
        )
    }
}

/// Function-invocation endpoint
///
/// The action identifier is per call; workers carry it in `WorkerSettings::action`.
#[derive(Debug, Clone)]
pub struct InvocationEndpoint {
    pub base_url: String,
    pub namespace: String,
    pub credentials: Credentials,
}

impl InvocationEndpoint {
    pub fn new(
        base_url: impl Into<String>,
        namespace: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            namespace: namespace.into(),
            credentials,
        }
    }

    /// `{base}/namespaces/{namespace}/actions/{action}`
    pub fn action_url(&self, action: &str) -> String {
        format!(
            "{}/namespaces/{}/actions/{}",
            self.base_url, self.namespace, action
        )
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(DomainError::ValidationError(format!(
                "invocation URL must be http(s): {}",
                self.base_url
            )));
        }
        if self.namespace.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "namespace cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_key_split() {
        let creds = Credentials::from_auth_key("user:pa:ss").unwrap();
        assert_eq!(creds.username(), "user");
        assert_eq!(creds.password(), "pa:ss");
    }

    #[test]
    fn test_auth_key_without_separator() {
        let result = Credentials::from_auth_key("nocolon");
        assert!(matches!(result, Err(DomainError::InvalidCredentials(_))));
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("guest", "secret");
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("guest"));
    }

    #[test]
    fn test_action_url_trims_trailing_slash() {
        let endpoint = InvocationEndpoint::new(
            "https://whisk.example/api/v1/",
            "guest",
            Credentials::new("u", "p"),
        );
        assert_eq!(
            endpoint.action_url("relay"),
            "https://whisk.example/api/v1/namespaces/guest/actions/relay"
        );
    }

    #[test]
    fn test_broker_display_hides_password() {
        let endpoint = BrokerEndpoint::new("mq.local", 5671, "prod", Credentials::new("bob", "pw"));
        assert_eq!(endpoint.to_string(), "amqps://bob@mq.local:5671/prod");

        let plain = endpoint.with_tls(TlsSettings::disabled());
        assert_eq!(plain.to_string(), "amqp://bob@mq.local:5671/prod");
    }

    #[test]
    fn test_broker_validation() {
        let endpoint = BrokerEndpoint::new("", 5671, "/", Credentials::new("bob", "pw"));
        assert!(endpoint.validate().is_err());

        let endpoint = BrokerEndpoint::new("mq", 0, "/", Credentials::new("bob", "pw"));
        assert!(endpoint.validate().is_err());
    }

    #[test]
    fn test_invocation_validation() {
        let endpoint = InvocationEndpoint::new("ftp://x", "ns", Credentials::new("u", "p"));
        assert!(endpoint.validate().is_err());
    }
}
