//! Service Bus queue access over the HTTPS REST surface.
//!
//! Receive is a peek-lock `POST .../messages/head`; the lock address comes
//! back in `Location` and is used to complete (`DELETE`) or abandon (`PUT`)
//! the message, or renew (`POST`) the lock. The REST surface has no
//! dead-letter verb, so dead-lettering copies the message to the
//! dead-letter entity with the reason attached and then completes the
//! original. The original is completed even when the copy is refused, so a
//! message that can never succeed is not delivered again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, HeaderMap, HeaderValue, LOCATION};
use serde::Deserialize;

use crate::QueueError;
use crate::credential::SasCredential;
use crate::listener::{ListenerConfig, TransportType};
use crate::transport::{QueueTransport, ReceivedMessage, TransportFuture};

const SAS_PREFIX: &str = "SharedAccessSignature ";

/// Longest dead-letter description sent as a header value.
const MAX_HEADER_CHARS: usize = 1024;

/// Slack added to the server-side wait for the HTTP timeout.
const RECEIVE_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout of settle and renew calls. Receives set their own.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BrokerProperties {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    sequence_number: Option<i64>,
    #[serde(default)]
    delivery_count: u32,
}

/// [`QueueTransport`] for one Service Bus queue.
pub struct ServiceBusTransport {
    http: reqwest::Client,
    queue_url: String,
    dead_letter_url: String,
    credential: SasCredential,
    closed: AtomicBool,
}

/// URL of `entity` in `namespace`. An `sb://` namespace is addressed with the
/// transport's scheme; an `http(s)://` namespace keeps its own.
fn entity_url(namespace: &str, entity: &str, transport: TransportType) -> String {
    let ns = namespace.trim().trim_end_matches('/');
    let ns = ns.strip_prefix("sb://").unwrap_or(ns);
    if ns.contains("://") {
        format!("{ns}/{entity}")
    } else {
        format!("{}://{ns}/{entity}", transport.scheme())
    }
}

/// Makes a header-safe string: visible ASCII and spaces only, bounded length.
fn header_text(text: &str) -> String {
    text.chars()
        .take(MAX_HEADER_CHARS)
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect()
}

impl ServiceBusTransport {
    pub fn new(config: &ListenerConfig) -> Result<Self, QueueError> {
        let dead_letter_entity = config
            .dead_letter_queue
            .clone()
            .unwrap_or_else(|| format!("{}-deadletter", config.queue_name));

        let http = reqwest::Client::builder()
            .user_agent(concat!("cnc-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            queue_url: entity_url(&config.namespace, &config.queue_name, config.transport),
            dead_letter_url: entity_url(&config.namespace, &dead_letter_entity, config.transport),
            credential: SasCredential::new(&config.credential),
            closed: AtomicBool::new(false),
        })
    }

    fn auth_headers(&self) -> Result<HeaderMap, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let token = self.credential.current();
        let token = token.trim();
        let value = if token.starts_with(SAS_PREFIX) {
            token.to_string()
        } else {
            format!("{SAS_PREFIX}{token}")
        };
        let mut value = HeaderValue::from_str(&value).map_err(|_| QueueError::InvalidCredential)?;
        value.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, QueueError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(QueueError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn receive_inner(&self, max_wait: Duration) -> Result<Option<ReceivedMessage>, QueueError> {
        let resp = self
            .http
            .post(format!("{}/messages/head", self.queue_url))
            .query(&[("timeout", max_wait.as_secs().max(1))])
            .headers(self.auth_headers()?)
            .header(CONTENT_LENGTH, 0)
            .timeout(max_wait + RECEIVE_TIMEOUT_SLACK)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let resp = Self::check(resp).await?;

        let properties: BrokerProperties = match resp.headers().get("BrokerProperties") {
            Some(raw) => serde_json::from_slice(raw.as_bytes())?,
            None => BrokerProperties::default(),
        };
        let lock_uri = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(QueueError::MissingLockLocation)?;
        let body = resp.bytes().await?.to_vec();

        Ok(Some(ReceivedMessage {
            message_id: properties.message_id,
            sequence_number: properties.sequence_number,
            delivery_count: properties.delivery_count,
            body,
            lock_uri,
        }))
    }

    async fn complete_inner(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let resp = self
            .http
            .delete(&message.lock_uri)
            .headers(self.auth_headers()?)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn abandon_inner(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let resp = self
            .http
            .put(&message.lock_uri)
            .headers(self.auth_headers()?)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn renew_lock_inner(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let resp = self
            .http
            .post(&message.lock_uri)
            .headers(self.auth_headers()?)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn copy_to_dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), QueueError> {
        let properties = serde_json::json!({ "MessageId": message.message_id }).to_string();
        let resp = self
            .http
            .post(format!("{}/messages", self.dead_letter_url))
            .headers(self.auth_headers()?)
            .header("BrokerProperties", properties)
            .header("DeadLetterReason", header_text(reason))
            .header("DeadLetterErrorDescription", header_text(description))
            .body(message.body.clone())
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Copies then completes. A failed copy is returned after the original
    /// has been completed.
    async fn dead_letter_inner(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), QueueError> {
        let copied = self.copy_to_dead_letter(message, reason, description).await;
        self.complete_inner(message).await?;
        copied.map_err(|e| QueueError::DeadLetterCopy(Box::new(e)))
    }
}

impl QueueTransport for ServiceBusTransport {
    fn receive(&self, max_wait: Duration) -> TransportFuture<'_, Option<ReceivedMessage>> {
        Box::pin(self.receive_inner(max_wait))
    }

    fn complete<'a>(&'a self, message: &'a ReceivedMessage) -> TransportFuture<'a, ()> {
        Box::pin(self.complete_inner(message))
    }

    fn abandon<'a>(&'a self, message: &'a ReceivedMessage) -> TransportFuture<'a, ()> {
        Box::pin(self.abandon_inner(message))
    }

    fn dead_letter<'a>(
        &'a self,
        message: &'a ReceivedMessage,
        reason: &'a str,
        description: &'a str,
    ) -> TransportFuture<'a, ()> {
        Box::pin(self.dead_letter_inner(message, reason, description))
    }

    fn renew_lock<'a>(&'a self, message: &'a ReceivedMessage) -> TransportFuture<'a, ()> {
        Box::pin(self.renew_lock_inner(message))
    }

    fn update_credential(&self, credential: &str) {
        self.credential.update(credential);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
