//! HTTP queue transport.
//!
//! Speaks a small REST contract, relative to the configured endpoint:
//!
//! | call | request | response |
//! |------|---------|----------|
//! | push | `POST /queues/{publish}/messages` `{"body"}` | `{"message_id"}` |
//! | poll | `GET /queues/{inbox}/messages?max=N&wait=S` | `{"messages":[{"body","receipt_handle"}]}` |
//! | ack | `DELETE /queues/{inbox}/messages/{receipt}` | empty |
//! | attributes | `GET /queues/{name}/attributes` | `{"approximate_messages","approximate_in_flight"}` |
//!
//! Requests carry `Authorization: Bearer <token>`. TLS certificates are
//! verified unless the operator explicitly opts out.

use super::{QueueDepth, QueueMessage, QueueTransport, TransportError};
use crate::credentials::Credentials;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Longest server error text kept in an error message.
const MAX_ERROR_TEXT: usize = 256;

/// TLS certificate verification mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    /// Verify the server certificate chain and host name.
    #[default]
    Strict,
    /// Accept any certificate. Only for lab setups behind intercepting proxies.
    InsecureSkipVerify,
}

/// Where and how an [`HttpQueue`] connects.
#[derive(Debug, Clone)]
pub struct HttpQueueConfig {
    /// Base URL of the queue service.
    pub endpoint: String,
    /// Destination messages are published to.
    pub publish: String,
    /// Queue this client reads.
    pub inbox: String,
    /// Certificate verification.
    pub tls: TlsMode,
    /// Timeout for requests that do not long-poll.
    pub request_timeout: Duration,
}

/// REST queue client.
#[derive(Debug, Clone)]
pub struct HttpQueue {
    client: Client,
    base: Url,
    publish: String,
    inbox: String,
    credentials: Credentials,
    request_timeout: Duration,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    body: &'a str,
}

#[derive(Deserialize)]
struct PushResponse {
    message_id: String,
}

#[derive(Deserialize)]
struct PollResponse {
    #[serde(default)]
    messages: Vec<PolledMessage>,
}

#[derive(Deserialize)]
struct PolledMessage {
    body: String,
    receipt_handle: String,
}

#[derive(Deserialize)]
struct AttributesResponse {
    approximate_messages: u64,
    #[serde(default)]
    approximate_in_flight: u64,
}

impl HttpQueue {
    /// Build the HTTP client. Does not touch the network.
    pub fn new(config: HttpQueueConfig, credentials: Credentials) -> Result<Self, TransportError> {
        let base = Url::parse(&config.endpoint)
            .map_err(|e| TransportError::Config(format!("endpoint {}: {e}", config.endpoint)))?;
        if base.cannot_be_a_base() {
            return Err(TransportError::Config(format!(
                "endpoint {} cannot be a base URL",
                config.endpoint
            )));
        }

        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout);
        if config.tls == TlsMode::InsecureSkipVerify {
            warn!(
                endpoint = %config.endpoint,
                "TLS certificate verification is DISABLED (tls.verify = \"insecure-skip-verify\")"
            );
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base,
            publish: config.publish,
            inbox: config.inbox,
            credentials,
            request_timeout: config.request_timeout,
        })
    }

    /// The queue this client reads.
    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    /// `{endpoint}/queues/{queue}/{tail...}` with every segment escaped.
    fn url(&self, queue: &str, tail: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("queues").push(queue).extend(tail);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.credentials.token())
    }

    async fn attributes(&self, queue: &str) -> Result<QueueDepth, TransportError> {
        let request = self.authorized(self.client.get(self.url(queue, &["attributes"])));
        let response = check(request.send().await?, queue).await?;
        let attributes: AttributesResponse = parse(response).await?;
        Ok(QueueDepth {
            available: attributes.approximate_messages,
            in_flight: attributes.approximate_in_flight,
        })
    }
}

#[async_trait]
impl QueueTransport for HttpQueue {
    async fn health_check(&self) -> Result<(), TransportError> {
        self.attributes(&self.inbox).await.map(|_| ())
    }

    async fn push(&self, body: &str) -> Result<String, TransportError> {
        let request = self
            .authorized(self.client.post(self.url(&self.publish, &["messages"])))
            .json(&PushRequest { body });
        let response = check(request.send().await?, &self.publish).await?;
        let pushed: PushResponse = parse(response).await?;
        debug!(queue = %self.publish, message_id = %pushed.message_id, "pushed");
        Ok(pushed.message_id)
    }

    async fn poll(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, TransportError> {
        let mut url = self.url(&self.inbox, &["messages"]);
        url.query_pairs_mut()
            .append_pair("max", &max_messages.max(1).to_string())
            .append_pair("wait", &wait.as_secs().to_string());

        let request = self
            .authorized(self.client.get(url))
            .timeout(self.request_timeout + wait);
        let response = check(request.send().await?, &self.inbox).await?;
        let polled: PollResponse = parse(response).await?;

        Ok(polled
            .messages
            .into_iter()
            .map(|m| QueueMessage {
                body: m.body,
                receipt: m.receipt_handle,
            })
            .collect())
    }

    async fn acknowledge(&self, receipt: &str) -> Result<(), TransportError> {
        let request =
            self.authorized(self.client.delete(self.url(&self.inbox, &["messages", receipt])));
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            // Receipt expired or message already deleted
            debug!(queue = %self.inbox, "acknowledged receipt was already gone");
            return Ok(());
        }
        check(response, &self.inbox).await?;
        Ok(())
    }

    async fn queue_depth(&self) -> Result<QueueDepth, TransportError> {
        self.attributes(&self.publish).await
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_decode() {
            TransportError::InvalidResponse(err.to_string())
        } else if err.is_builder() {
            TransportError::Config(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// Map a non-success status to a classified error.
pub(crate) fn classify_status(status: StatusCode, queue: &str, text: String) -> TransportError {
    let mut message = text;
    if message.len() > MAX_ERROR_TEXT {
        let mut cut = MAX_ERROR_TEXT;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Unauthorized(message),
        StatusCode::NOT_FOUND => TransportError::QueueNotFound(queue.to_string()),
        StatusCode::TOO_MANY_REQUESTS => TransportError::Throttled(message),
        s if s.is_server_error() => TransportError::Unavailable {
            status: s.as_u16(),
            message,
        },
        s => TransportError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

async fn check(response: Response, queue: &str) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(classify_status(status, queue, text))
}

async fn parse<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    response
        .json::<T>()
        .await
        .map_err(|e| TransportError::InvalidResponse(e.to_string()))
}
