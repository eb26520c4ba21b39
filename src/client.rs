//! Client side of the `/api/chat` protocol.

use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::observability::{CLIENT_REQUEST_ERRORS, CLIENT_REQUESTS};
use crate::sse::{
    DeltaStream, Framing, process_stream, with_idle_timeout, with_response_timeout,
};
use crate::types::{ChatRequest, ErrorBody, Message, MessageContent};

/// Where `chatlite-server` listens by default.
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000/";

/// Longest silence tolerated on an open stream before it is abandoned.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can turn a chat request into a stream of deltas.
///
/// The conversation store talks to the network only through this trait.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    /// Issues one request and returns the reply stream.
    ///
    /// Cancelling `cancel` before the response arrives aborts the request with an abort
    /// error. After that, dropping the returned stream aborts the request.
    async fn open(&self, request: ChatRequest, cancel: CancellationToken) -> Result<DeltaStream>;
}

/// HTTP client for a `chatlite-server` (or any server speaking the same protocol).
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: ReqwestClient,
    base_url: Url,
    framing: Framing,
    idle_timeout: Duration,
}

impl ChatClient {
    /// Creates a client for the server at `base_url` using SSE framing.
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_options(base_url, Framing::Sse, DEFAULT_IDLE_TIMEOUT)
    }

    /// Creates a client with custom settings.
    pub fn with_options(base_url: &str, framing: Framing, idle_timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = ReqwestClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;

        Ok(Self {
            client,
            base_url,
            framing,
            idle_timeout,
        })
    }

    /// The server this client talks to.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The framing this client expects from the server.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Builds the body of one send.
    ///
    /// The history is copied; the caller's slice is never modified.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the persona prompt is empty.
    pub fn build_request(
        persona_prompt: &str,
        history: &[Message],
        input: impl Into<MessageContent>,
    ) -> Result<ChatRequest> {
        if persona_prompt.trim().is_empty() {
            return Err(Error::validation(
                "the selected persona has no system prompt",
                Some("prompt".to_string()),
            ));
        }
        Ok(ChatRequest::new(persona_prompt, history.to_vec(), input))
    }

    fn default_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(self.framing.content_type()),
        );
        headers
    }

    /// Converts a non-success response into an error carrying the server's message.
    async fn process_error_response(response: Response) -> Error {
        let status_code = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.parse::<u64>().ok());

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read error response: {e}"),
                    Some(Box::new(e)),
                );
            }
        };
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|body| body.error)
            .unwrap_or(body);

        match status_code {
            400 => Error::bad_request(message, None),
            401 => Error::authentication(message),
            403 => Error::permission(message),
            404 => Error::not_found(message, None, None),
            429 => Error::rate_limit(message, retry_after),
            500 => Error::internal_server(message),
            502..=504 => Error::service_unavailable(message, retry_after),
            _ => Error::api(status_code, None, message),
        }
    }

    /// Sends a request and returns the reply as a stream of deltas.
    pub async fn stream(&self, request: &ChatRequest) -> Result<DeltaStream> {
        CLIENT_REQUESTS.click();
        let url = self.base_url.join("api/chat")?;
        tracing::debug!(%url, history = request.messages.len(), "sending chat request");

        let send = self
            .client
            .post(url)
            .headers(self.default_headers())
            .json(request)
            .send();
        let response = with_response_timeout(send, self.idle_timeout)
            .await
            .inspect_err(|_| CLIENT_REQUEST_ERRORS.click())?;

        if !response.status().is_success() {
            CLIENT_REQUEST_ERRORS.click();
            return Err(Self::process_error_response(response).await);
        }

        let events = process_stream(response.bytes_stream(), self.framing);
        Ok(with_idle_timeout(events, self.idle_timeout))
    }
}

#[async_trait::async_trait]
impl ChatTransport for ChatClient {
    async fn open(&self, request: ChatRequest, cancel: CancellationToken) -> Result<DeltaStream> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::abort("request cancelled before the reply started")),
            result = self.stream(&request) => result,
        }
    }
}
