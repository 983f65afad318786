//! Retry-wrapped JSON fetch layer.
//!
//! Every upstream call goes through [`HttpClient`]: exponential backoff with a
//! one second base delay, capped at ten seconds per wait, aborting once a
//! cumulative sixty seconds have elapsed. Retries fire on transport errors and
//! on non-2xx status codes. Responses come back as parsed [`serde_json::Value`].
//!
//! A minimal WebSocket primitive ([`ws_request_once`]) covers the one venue
//! that publishes live rates over a stream: open, send a single subscribe
//! frame, discard the first frame, return the second as JSON, close.

use std::time::{Duration, Instant};

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced by the fetch layer after the retry budget is exhausted.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status} from {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("websocket stream ended before a data frame arrived")]
    WebSocketClosed,
    #[error("invalid JSON payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Backoff parameters for the retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            budget: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_delay)
    }
}

/// JSON HTTP client shared by all exchange adapters.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self { client, policy })
    }

    /// GET the URL with query parameters and parse the body as JSON.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
    ) -> Result<Value, FetchError> {
        self.get_json_timeout(url, query, headers, DEFAULT_TIMEOUT)
            .await
    }

    /// GET with an explicit per-call timeout.
    pub async fn get_json_timeout(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Value, FetchError> {
        self.retry(url, || {
            let mut request = self.client.get(url).query(query).timeout(timeout);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            request
        })
        .await
    }

    /// POST a JSON body and parse the response as JSON.
    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        headers: &[(&str, &str)],
    ) -> Result<Value, FetchError> {
        self.post_json_timeout(url, body, headers, DEFAULT_TIMEOUT)
            .await
    }

    /// POST with an explicit per-call timeout.
    pub async fn post_json_timeout(
        &self,
        url: &str,
        body: &Value,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Value, FetchError> {
        self.retry(url, || {
            let mut request = self.client.post(url).json(body).timeout(timeout);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            request
        })
        .await
    }

    async fn retry(
        &self,
        url: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Value, FetchError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match Self::execute(build()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let delay = self.policy.delay_for(attempt);
                    if started.elapsed() + delay >= self.policy.budget {
                        warn!(url, attempts = attempt + 1, "retry budget exhausted: {err}");
                        return Err(err);
                    }
                    debug!(url, attempt, ?delay, "request failed, retrying: {err}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn execute(request: reqwest::RequestBuilder) -> Result<Value, FetchError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status,
                url: response.url().to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

/// Open a WebSocket, send one subscribe frame, discard the first text frame
/// and return the second parsed as JSON.
pub async fn ws_request_once(url: &str, subscribe: &Value) -> Result<Value, FetchError> {
    let (mut stream, _) = connect_async(url).await?;
    stream.send(Message::text(subscribe.to_string())).await?;

    // First text frame is the subscription acknowledgement.
    next_text_frame(&mut stream).await?;
    let payload = next_text_frame(&mut stream).await?;

    let _ = stream.close(None).await;
    Ok(serde_json::from_str(&payload)?)
}

async fn next_text_frame<S>(stream: &mut S) -> Result<String, FetchError>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => return Ok(text.to_string()),
            Message::Close(_) => return Err(FetchError::WebSocketClosed),
            // Pings are answered by tungstenite, everything else is skipped.
            _ => continue,
        }
    }
    Err(FetchError::WebSocketClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            budget: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn get_json_parses_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .and(query_param("symbol", "BTCUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let client = HttpClient::with_policy(fast_policy()).unwrap();
        let value = client
            .get_json(
                &format!("{}/markets", server.uri()),
                &[("symbol", "BTCUSDT".to_string())],
                &[],
            )
            .await
            .unwrap();

        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2, 3])))
            .mount(&server)
            .await;

        let client = HttpClient::with_policy(fast_policy()).unwrap();
        let value = client
            .get_json(&format!("{}/flaky", server.uri()), &[], &[])
            .await
            .unwrap();

        assert_eq!(value, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn gives_up_after_budget_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpClient::with_policy(fast_policy()).unwrap();
        let err = client
            .get_json(&format!("{}/down", server.uri()), &[], &[])
            .await
            .unwrap_err();

        match err {
            FetchError::Status { status, .. } => assert_eq!(status.as_u16(), 503),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn post_json_sends_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/info"))
            .and(body_json(json!({"type": "meta"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"universe": []})))
            .mount(&server)
            .await;

        let client = HttpClient::with_policy(fast_policy()).unwrap();
        let value = client
            .post_json(&format!("{}/info", server.uri()), &json!({"type": "meta"}), &[])
            .await
            .unwrap();

        assert_eq!(value["universe"], json!([]));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(6), Duration::from_secs(10));
        assert_eq!(policy.delay_for(30), Duration::from_secs(10));
    }
}
