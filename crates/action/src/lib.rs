//! Republish action
//!
//! Receives the relay envelope `{"messages": [...]}` merged with broker
//! parameters, and publishes `{"count": n}` to `publish_queue` for every entry.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use rabbitwhisk_core::application::worker::constants::{CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY};
use rabbitwhisk_core::domain::{BrokerEndpoint, Credentials, DomainError, QueueSpec, TlsSettings};
use rabbitwhisk_core::port::{QueueConnector, QueueError};

/// Parameters that must be present, in reporting order
pub const REQUIRED_PARAMS: [&str; 6] = [
    "broker_host",
    "broker_vhost",
    "broker_port",
    "broker_user",
    "broker_password",
    "publish_queue",
];

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("{0} is missing")]
    MissingParam(&'static str),

    #[error("Invalid parameters: {0}")]
    InvalidParams(#[from] serde_json::Error),

    #[error("{0}")]
    Domain(#[from] DomainError),

    #[error("{0}")]
    Queue(#[from] QueueError),
}

/// Broker port arrives as a number or a numeric string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Port {
    Number(u16),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionParams {
    broker_host: String,
    broker_vhost: String,
    broker_port: Port,
    broker_user: String,
    broker_password: String,
    pub publish_queue: String,
    #[serde(default = "default_tls")]
    broker_tls: bool,
    #[serde(default)]
    pub messages: Option<Vec<Value>>,
}

fn default_tls() -> bool {
    true
}

impl ActionParams {
    /// Reject missing or null required parameters before deserializing
    pub fn from_args(args: &Value) -> Result<Self, ActionError> {
        for key in REQUIRED_PARAMS {
            if args.get(key).map_or(true, Value::is_null) {
                return Err(ActionError::MissingParam(key));
            }
        }
        Ok(Self::deserialize(args)?)
    }

    pub fn broker_endpoint(&self) -> Result<BrokerEndpoint, ActionError> {
        let port = match &self.broker_port {
            Port::Number(port) => *port,
            Port::Text(text) => text.trim().parse().map_err(|_| {
                DomainError::ValidationError(format!("broker_port is not a port: {text}"))
            })?,
        };
        let tls = if self.broker_tls {
            TlsSettings::default()
        } else {
            TlsSettings::disabled()
        };

        let endpoint = BrokerEndpoint::new(
            self.broker_host.clone(),
            port,
            self.broker_vhost.clone(),
            Credentials::new(self.broker_user.clone(), self.broker_password.clone()),
        )
        .with_tls(tls);
        endpoint.validate()?;
        Ok(endpoint)
    }
}

/// Publish one running count per message; returns how many were published
pub async fn republish(
    connector: &dyn QueueConnector,
    queue: &str,
    messages: &[Value],
) -> Result<usize, ActionError> {
    let connection = connector
        .connect(CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY)
        .await?;

    let mut count = 0usize;
    let published = async {
        connection.start_consuming(&QueueSpec::new(queue)).await?;
        for message in messages {
            count += 1;
            info!(message = %message, count, "Received message");
            let body = json!({ "count": count }).to_string();
            connection.publish(body.as_bytes(), None).await?;
        }
        Ok::<_, QueueError>(())
    }
    .await;

    connection.stop().await;
    published?;
    Ok(count)
}

/// Run the action; never fails, errors are folded into the result
///
/// `connect` builds a connector for the broker named in `args`.
pub async fn run_action<F>(args: &Value, activation: Option<&str>, connect: F) -> Value
where
    F: FnOnce(BrokerEndpoint) -> Arc<dyn QueueConnector>,
{
    let outcome = async {
        let params = ActionParams::from_args(args)?;
        let endpoint = params.broker_endpoint()?;
        match &params.messages {
            Some(messages) => {
                let connector = connect(endpoint);
                republish(connector.as_ref(), &params.publish_queue, messages).await
            }
            None => Ok(0),
        }
    }
    .await;

    let mut result = match outcome {
        Ok(messages) => json!({ "messages": messages }),
        Err(e) => {
            tracing::error!(error = %e, "Action failed");
            json!({ "result": e.to_string() })
        }
    };
    result["activation"] = activation.map_or(Value::Null, |id| Value::String(id.to_string()));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rabbitwhisk_core::port::message_queue::mocks::{
        ConnectFailure, InMemoryBroker, MockConnector,
    };

    fn args(messages: Value) -> Value {
        json!({
            "broker_host": "mq.example.com",
            "broker_vhost": "relay",
            "broker_port": "5671",
            "broker_user": "feeder",
            "broker_password": "s3cret",
            "publish_queue": "replies",
            "messages": messages,
        })
    }

    fn connector_for(broker: &Arc<InMemoryBroker>) -> impl FnOnce(BrokerEndpoint) -> Arc<dyn QueueConnector> {
        let broker = Arc::clone(broker);
        move |_| -> Arc<dyn QueueConnector> { Arc::new(MockConnector::new(broker)) }
    }

    #[tokio::test]
    async fn test_republishes_running_count() {
        let broker = InMemoryBroker::new();
        let result = run_action(
            &args(json!(["{\"serviceRequest\":\"none\"}", "second"])),
            Some("act-1"),
            connector_for(&broker),
        )
        .await;

        assert_eq!(result, json!({ "messages": 2, "activation": "act-1" }));
        assert_eq!(
            broker.messages("replies"),
            vec![br#"{"count":1}"#.to_vec(), br#"{"count":2}"#.to_vec()]
        );
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_missing_param_reported_in_result() {
        let broker = InMemoryBroker::new();
        let mut params = args(json!(["x"]));
        params.as_object_mut().unwrap().remove("broker_user");

        let result = run_action(&params, None, connector_for(&broker)).await;
        assert_eq!(
            result,
            json!({ "result": "broker_user is missing", "activation": null })
        );
        assert_eq!(broker.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_no_messages_skips_broker() {
        let broker = InMemoryBroker::new();
        let mut params = args(json!([]));
        params.as_object_mut().unwrap().remove("messages");

        let result = run_action(&params, Some("act-2"), connector_for(&broker)).await;
        assert_eq!(result["messages"], 0);
        assert_eq!(broker.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_broker_failure_reported_in_result() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connect(ConnectFailure::Transient);

        let result = run_action(&args(json!(["x"])), Some("act-3"), connector_for(&broker)).await;
        assert!(result["result"]
            .as_str()
            .unwrap()
            .contains("Broker unreachable"));
        assert_eq!(result["activation"], "act-3");
    }

    #[test]
    fn test_numeric_port_accepted() {
        let mut params = args(json!([]));
        params["broker_port"] = json!(5672);
        params["broker_tls"] = json!(false);

        let endpoint = ActionParams::from_args(&params)
            .unwrap()
            .broker_endpoint()
            .unwrap();
        assert_eq!(endpoint.port, 5672);
        assert!(!endpoint.tls.enabled);
    }

    #[test]
    fn test_bad_port_rejected() {
        let mut params = args(json!([]));
        params["broker_port"] = json!("amqp");

        let err = ActionParams::from_args(&params)
            .unwrap()
            .broker_endpoint()
            .unwrap_err();
        assert!(matches!(err, ActionError::Domain(_)));
    }
}
