// Whisk invoker (reqwest)
// One pooled session per invoker; any transport failure rebuilds it
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use rabbitwhisk_core::domain::{InvocationEndpoint, InvocationResult};
use rabbitwhisk_core::port::{InvocationError, Invoker, InvokerFactory};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Non-blocking activation, no result wait
const INVOKE_QUERY: [(&str, &str); 2] = [("blocking", "false"), ("result", "false")];

/// Response body as read from the wire
enum ResponseBody {
    Complete(Vec<u8>),
    /// Reading stopped once this many bytes were seen
    TooLarge(u64),
}

/// HTTP client tuning
#[derive(Debug, Clone)]
pub struct WhiskSettings {
    pub request_timeout: Duration,
    /// Larger response bodies are discarded and reported as an error result
    pub max_response_bytes: usize,
}

impl Default for WhiskSettings {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

/// Invocation client posting to `{base}/namespaces/{ns}/actions/{action}`
pub struct WhiskInvoker {
    endpoint: Arc<InvocationEndpoint>,
    settings: WhiskSettings,
    session: RwLock<Client>,
    sessions_opened: AtomicU64,
}

impl WhiskInvoker {
    pub fn new(
        endpoint: Arc<InvocationEndpoint>,
        settings: WhiskSettings,
    ) -> Result<Self, InvocationError> {
        let session = open_session(&settings)?;
        Ok(Self {
            endpoint,
            settings,
            session: RwLock::new(session),
            sessions_opened: AtomicU64::new(1),
        })
    }

    /// Sessions replaced after a transport failure
    pub fn sessions_rebuilt(&self) -> u64 {
        self.sessions_opened.load(Ordering::SeqCst) - 1
    }

    async fn rebuild_session(&self) {
        match open_session(&self.settings) {
            Ok(session) => {
                *self.session.write().await = session;
                self.sessions_opened.fetch_add(1, Ordering::SeqCst);
                debug!("Invocation session rebuilt");
            }
            Err(e) => error!(error = %e, "Invocation session rebuild failed; keeping previous session"),
        }
    }

    async fn post(&self, payload_json: &str, action: &str) -> Result<ResponseBody, reqwest::Error> {
        let session = self.session.read().await.clone();
        let credentials = &self.endpoint.credentials;

        let mut response = session
            .post(self.endpoint.action_url(action))
            .query(&INVOKE_QUERY)
            .basic_auth(credentials.username(), Some(credentials.password()))
            .header(CONTENT_TYPE, "application/json")
            .body(payload_json.to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            debug!(action, status = %status, "Invocation endpoint returned non-success status");
        }
        self.read_body(&mut response).await
    }

    /// Stream the body, giving up as soon as it passes `max_response_bytes`
    async fn read_body(&self, response: &mut Response) -> Result<ResponseBody, reqwest::Error> {
        let limit = self.settings.max_response_bytes as u64;
        if let Some(declared) = response.content_length() {
            if declared > limit {
                return Ok(ResponseBody::TooLarge(declared));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let seen = (body.len() + chunk.len()) as u64;
            if seen > limit {
                return Ok(ResponseBody::TooLarge(seen));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(ResponseBody::Complete(body))
    }

    fn parse_body(&self, action: &str, body: &[u8]) -> InvocationResult {
        match serde_json::from_slice(body) {
            Ok(value) => InvocationResult::new(value),
            Err(e) => {
                warn!(action, error = %e, size = body.len(), "Invocation response is not JSON");
                InvocationResult::error(format!("invalid response body: {e}"))
            }
        }
    }
}

fn open_session(settings: &WhiskSettings) -> Result<Client, InvocationError> {
    Client::builder()
        .timeout(settings.request_timeout)
        .build()
        .map_err(|e| InvocationError::Session(format!("Failed to build HTTP client: {e}")))
}

#[async_trait]
impl Invoker for WhiskInvoker {
    async fn invoke(&self, payload_json: &str, action: &str) -> InvocationResult {
        match self.post(payload_json, action).await {
            Ok(ResponseBody::Complete(body)) => self.parse_body(action, &body),
            Ok(ResponseBody::TooLarge(size)) => {
                warn!(action, size, "Invocation response too large");
                InvocationResult::error(format!(
                    "response too large; {} > {} bytes",
                    size, self.settings.max_response_bytes
                ))
            }
            Err(e) => {
                warn!(action, error = %e, "Invocation transport failure");
                self.rebuild_session().await;
                InvocationResult::error(e.to_string())
            }
        }
    }
}

/// Builds a fresh `WhiskInvoker` from shared endpoint coordinates
pub struct WhiskInvokerFactory {
    endpoint: Arc<InvocationEndpoint>,
    settings: WhiskSettings,
}

impl WhiskInvokerFactory {
    pub fn new(endpoint: Arc<InvocationEndpoint>, settings: WhiskSettings) -> Self {
        Self { endpoint, settings }
    }
}

impl InvokerFactory for WhiskInvokerFactory {
    fn create(&self) -> Result<Arc<dyn Invoker>, InvocationError> {
        self.endpoint
            .validate()
            .map_err(|e| InvocationError::Config(e.to_string()))?;
        let invoker = WhiskInvoker::new(Arc::clone(&self.endpoint), self.settings.clone())?;
        Ok(Arc::new(invoker))
    }
}
