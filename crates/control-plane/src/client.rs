//! HTTP implementation of [`ControlPlane`].
//!
//! Async client using `reqwest` with optional Bearer token authentication.
//! Transient failures are retried with capped exponential backoff.

use std::time::Duration;

use cnc_agent_protocol::{
    AgentConfig, Backoff, TransferStatusReport, UploadDestination, UploadDestinationsRequest,
};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::{ApiError, ApiFuture, ControlPlane};

/// Attempts per call, including the first one.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on one attempt, from connect to the end of the body.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Control-plane API client.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    retry: Backoff,
    max_attempts: u32,
    timeout: Duration,
}

impl ApiClient {
    /// Creates a client for `base_url`, sending `token` as a Bearer token
    /// when present.
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, ApiError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url).map_err(|_| ApiError::InvalidBaseUrl(base_url.clone()))?;

        let mut headers = HeaderMap::new();
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ApiError::InvalidToken)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("cnc-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url,
            retry: Backoff::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Overrides the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the retry policy.
    pub fn with_retry(mut self, retry: Backoff, max_attempts: u32) -> Self {
        self.retry = retry;
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sends the request built by `build`, retrying transient failures.
    ///
    /// `build` is called once per attempt since a sent request is consumed.
    async fn execute<F>(&self, operation: &'static str, build: F) -> Result<Vec<u8>, ApiError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let err = match build(&self.http).timeout(self.timeout).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    ApiError::Api { status, body }
                }
                Err(e) => ApiError::Http(e),
            };

            if attempt >= self.max_attempts || !err.is_transient() {
                return Err(err);
            }

            let delay = self.retry.delay_for_attempt(attempt);
            tracing::warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "control-plane call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, NON_ALPHANUMERIC).to_string()
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    Ok(serde_json::from_slice(body)?)
}

impl ControlPlane for ApiClient {
    fn get_queue_config<'a>(
        &'a self,
        agent_id: &'a str,
        agent_version: &'a str,
    ) -> ApiFuture<'a, AgentConfig> {
        Box::pin(async move {
            let url = self.url(&format!(
                "/api/cncfiletransfer/agents/{}/config",
                encode(agent_id)
            ));
            let body = self
                .execute("get_queue_config", |http| {
                    http.get(&url).query(&[("agentVersion", agent_version)])
                })
                .await?;
            let config: AgentConfig = decode(&body)?;
            tracing::debug!(
                queue = %config.queue_name,
                refresh_at = %config.configuration_refresh_time,
                "queue configuration fetched"
            );
            Ok(config)
        })
    }

    fn set_transfer_status<'a>(
        &'a self,
        transfer_id: Uuid,
        report: &'a TransferStatusReport,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let url = self.url(&format!(
                "/api/cncfiletransfer/transfers/{transfer_id}/status"
            ));
            self.execute("set_transfer_status", |http| http.post(&url).json(report))
                .await?;
            Ok(())
        })
    }

    fn create_upload_destinations<'a>(
        &'a self,
        machine_operation_id: &'a str,
        request: &'a UploadDestinationsRequest,
    ) -> ApiFuture<'a, Vec<UploadDestination>> {
        Box::pin(async move {
            let url = self.url(&format!(
                "/api/cncsetup/operations/{}/uploadprograms",
                encode(machine_operation_id)
            ));
            let body = self
                .execute("create_upload_destinations", |http| {
                    http.post(&url).json(request)
                })
                .await?;
            decode(&body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnc_agent_protocol::TransferStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    // -- Helpers --

    /// Reads one full HTTP request (headers plus `Content-Length` body).
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Starts a mock HTTP server that answers one connection per canned
    /// response, in order, and returns the raw requests it saw.
    async fn mock_server(
        responses: Vec<(u16, &str)>,
    ) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}");
        let responses: Vec<(u16, String)> =
            responses.into_iter().map(|(s, b)| (s, b.to_string())).collect();

        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                seen.push(read_request(&mut stream).await);
                let resp = format!(
                    "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
            seen
        });

        (url, handle)
    }

    fn client(url: &str, token: Option<&str>) -> ApiClient {
        ApiClient::new(url, token)
            .unwrap()
            .with_retry(Backoff::immediate(), 3)
    }

    const CONFIG_JSON: &str = r#"{"serviceBusNamespace":"plant.servicebus.windows.net","queueName":"cnc-01","sharedAccessSignature":"SharedAccessSignature sig=abc","configurationRefreshTime":"2026-03-01T12:00:00Z"}"#;

    // -- Tests --

    #[test]
    fn rejects_invalid_base_url() {
        assert!(matches!(
            ApiClient::new("not a url", None),
            Err(ApiError::InvalidBaseUrl(_))
        ));
    }

    #[tokio::test]
    async fn get_queue_config_sends_agent_and_version() {
        let (url, handle) = mock_server(vec![(200, CONFIG_JSON)]).await;
        let api = client(&url, Some("tok123"));

        let config = api.get_queue_config("agent 7", "1.2.3").await.unwrap();
        assert_eq!(config.queue_name, "cnc-01");
        assert_eq!(config.service_bus_namespace, "plant.servicebus.windows.net");

        let requests = handle.await.unwrap();
        let request = &requests[0];
        assert!(
            request.starts_with(
                "GET /api/cncfiletransfer/agents/agent%207/config?agentVersion=1.2.3 "
            ),
            "unexpected request line: {request}"
        );
        assert!(request.to_lowercase().contains("authorization: bearer tok123"));
    }

    #[tokio::test]
    async fn set_transfer_status_posts_report() {
        let (url, handle) = mock_server(vec![(200, "")]).await;
        let api = client(&url, None);
        let id = Uuid::new_v4();
        let report = TransferStatusReport::success(vec!["O1.nc".into()]);

        api.set_transfer_status(id, &report).await.unwrap();

        let requests = handle.await.unwrap();
        let request = &requests[0];
        assert!(request.starts_with(&format!(
            "POST /api/cncfiletransfer/transfers/{id}/status "
        )));
        assert!(request.ends_with(r#"{"status":"Success","files":["O1.nc"]}"#));
        assert!(!request.to_lowercase().contains("authorization"));
    }

    #[tokio::test]
    async fn create_upload_destinations_parses_reply() {
        let (url, handle) = mock_server(vec![(
            200,
            r#"[{"filename":"O1.nc","url":"https://blob/o1"},{"filename":"O2.nc","url":"https://blob/o2"}]"#,
        )])
        .await;
        let api = client(&url, None);
        let request = UploadDestinationsRequest {
            filenames: vec!["O1.nc".into(), "O2.nc".into()],
        };

        let destinations = api
            .create_upload_destinations("op/9", &request)
            .await
            .unwrap();
        assert_eq!(destinations.len(), 2);
        assert_eq!(destinations[1].url, "https://blob/o2");

        let requests = handle.await.unwrap();
        assert!(requests[0].starts_with("POST /api/cncsetup/operations/op%2F9/uploadprograms "));
        assert!(requests[0].ends_with(r#"{"filenames":["O1.nc","O2.nc"]}"#));
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let (url, handle) = mock_server(vec![(503, "busy"), (200, CONFIG_JSON)]).await;
        let api = client(&url, None);

        let config = api.get_queue_config("a", "1").await.unwrap();
        assert_eq!(config.queue_name, "cnc-01");
        assert_eq!(handle.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (url, handle) = mock_server(vec![(500, "e1"), (500, "e2"), (500, "e3")]).await;
        let api = client(&url, None);

        let err = api.get_queue_config("a", "1").await.unwrap_err();
        match err {
            ApiError::Api { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "e3");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(handle.await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, handle) = mock_server(vec![(404, "no such agent")]).await;
        let api = client(&url, None);

        let report = TransferStatusReport {
            status: TransferStatus::Failed,
            files: vec![],
            status_message: None,
        };
        let err = api
            .set_transfer_status(Uuid::new_v4(), &report)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Api { status: 404, .. }));
        assert_eq!(handle.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stalled_server_times_out_each_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut stream, _)) = listener.accept().await {
                read_request(&mut stream).await;
                held.push(stream);
            }
        });
        let api = client(&url, None).with_timeout(Duration::from_millis(200));

        let err = tokio::time::timeout(Duration::from_secs(5), api.get_queue_config("a", "1"))
            .await
            .expect("call should give up on its own")
            .unwrap_err();

        assert!(matches!(&err, ApiError::Http(e) if e.is_timeout()));
        assert!(err.is_transient());
        server.abort();
    }

    #[tokio::test]
    async fn bad_json_is_reported() {
        let (url, handle) = mock_server(vec![(200, "{not json")]).await;
        let api = client(&url, None);

        let err = api.get_queue_config("a", "1").await.unwrap_err();
        assert!(matches!(err, ApiError::Json(_)));
        handle.abort();
    }
}
