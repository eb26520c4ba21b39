//! The `/api/chat` proxy.
//!
//! Each request resolves the upstream provider afresh, so a server started without credentials
//! keeps running and answers with a JSON error until the environment is fixed.

use std::sync::Arc;
use std::time::Duration;

use arrrg_derive::CommandLine;
use axum::body::Body;
use axum::extract::Extension;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::client::DEFAULT_IDLE_TIMEOUT;
use crate::error::{Error, Result};
use crate::observability::{PROXY_ERRORS, PROXY_REQUESTS};
use crate::provider::{Provider, ProviderConfig};
use crate::sse::{DONE_SENTINEL, DeltaStream, Framing, StreamEvent};
use crate::types::{ChatRequest, ChunkError, CompletionChunk, ErrorBody};

/// Address `chatlite-server` binds when `--bind` is not given.
pub const DEFAULT_BIND: &str = "127.0.0.1:3000";

/// Command-line arguments for chatlite-server.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ServerArgs {
    /// Address to listen on.
    #[arrrg(optional, "Address to listen on (default: 127.0.0.1:3000)", "ADDR")]
    pub bind: Option<String>,

    /// Public framing of `/api/chat` replies.
    #[arrrg(optional, "Reply framing: sse or raw (default: sse)", "FRAMING")]
    pub framing: Option<String>,

    /// Idle timeout for upstream reads, in seconds.
    #[arrrg(optional, "Seconds of upstream silence before giving up (default: 90)", "SECS")]
    pub idle_timeout: Option<u64>,

    /// Sampling temperature forwarded upstream.
    #[arrrg(optional, "Sampling temperature sent to the provider", "TEMP")]
    pub temperature: Option<String>,

    /// Cap on generated tokens forwarded upstream.
    #[arrrg(optional, "Max tokens per reply sent to the provider", "TOKENS")]
    pub max_tokens: Option<u32>,
}

/// Resolved settings of the proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind: String,

    /// Public framing of replies.
    pub framing: Framing,

    /// Bound on every upstream read.
    pub idle_timeout: Duration,

    /// Optional sampling temperature.
    pub temperature: Option<f32>,

    /// Optional cap on generated tokens.
    pub max_tokens: Option<u32>,
}

impl ServerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            framing: Framing::Sse,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Sets the listen address.
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    /// Sets the public framing.
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Sets the upstream idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = Error;

    fn try_from(args: ServerArgs) -> Result<Self> {
        let defaults = ServerConfig::new();
        let temperature = match args.temperature {
            Some(temperature) => Some(parse_temperature(&temperature)?),
            None => None,
        };
        if args.idle_timeout == Some(0) {
            return Err(Error::validation(
                "idle timeout must be at least one second",
                Some("idle-timeout".to_string()),
            ));
        }
        Ok(ServerConfig {
            bind: args.bind.unwrap_or(defaults.bind),
            framing: match args.framing {
                Some(framing) => framing.parse()?,
                None => defaults.framing,
            },
            idle_timeout: args
                .idle_timeout
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            temperature,
            max_tokens: args.max_tokens,
        })
    }
}

fn parse_temperature(value: &str) -> Result<f32> {
    value
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|t| (0.0..=2.0).contains(t))
        .ok_or_else(|| {
            Error::validation(
                format!("temperature must be a number between 0 and 2, got {value:?}"),
                Some("temperature".to_string()),
            )
        })
}

/// Where the proxy gets its upstream settings.
#[derive(Debug, Clone)]
pub enum ProviderSource {
    /// Read the process environment on every request.
    Env,

    /// Use a fixed configuration.
    Fixed(ProviderConfig),
}

impl ProviderSource {
    fn resolve(&self) -> Result<ProviderConfig> {
        match self {
            ProviderSource::Env => ProviderConfig::from_env(),
            ProviderSource::Fixed(config) => Ok(config.clone()),
        }
    }
}

/// Shared state of the proxy handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    http: reqwest::Client,
    source: ProviderSource,
    config: ServerConfig,
}

impl AppState {
    /// Creates the state with a fresh upstream HTTP client.
    pub fn new(source: ProviderSource, config: ServerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            source,
            config,
        }
    }
}

/// Builds the router serving `/api/chat` and `/health`.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .layer(cors)
        .layer(Extension(state))
}

/// An error reported to the caller as `{ "success": false, "error": ... }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        PROXY_ERRORS.click();
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %err, status = status.as_u16(), "chat request failed");
        } else {
            tracing::warn!(error = %err, status = status.as_u16(), "chat request failed");
        }
        Self {
            status,
            message: err.message().to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        PROXY_ERRORS.click();
        tracing::warn!(error = %rejection.body_text(), "malformed chat request");
        Self {
            status: StatusCode::BAD_REQUEST,
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody::new(self.message))).into_response()
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn chat(
    Extension(state): Extension<Arc<AppState>>,
    body: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> std::result::Result<Response, ApiError> {
    PROXY_REQUESTS.click();
    let Json(request) = body?;

    let config = state
        .source
        .resolve()?
        .with_temperature(state.config.temperature)
        .with_max_tokens(state.config.max_tokens);

    if request.prompt.trim().is_empty() {
        return Err(Error::validation("prompt must not be empty", Some("prompt".to_string())).into());
    }

    let provider = Provider::new(state.http.clone(), config, state.config.idle_timeout);
    let events = provider.stream_chat(&request.to_messages()).await?;

    let framing = state.config.framing;
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static(framing.content_type()),
        )
        .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .body(Body::from_stream(encode_events(events, framing)))
        .map_err(|e| Error::internal_server(format!("failed to build response: {e}")))?;
    Ok(response)
}

/// Re-encodes parsed upstream events in the public framing.
///
/// In SSE framing a mid-stream failure becomes a final frame carrying an `error` object and the
/// `[DONE]` sentinel is withheld. In raw framing there is no way to signal failure in-band, so
/// the body is aborted instead. The abort always comes after the response head has gone out, so
/// the client sees a broken body rather than a failed request.
fn encode_events(
    events: DeltaStream,
    framing: Framing,
) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
    stream::unfold(Some(events), move |events| async move {
        let mut events = events?;
        match events.next().await {
            Some(Ok(StreamEvent::Delta(text))) => {
                let frame = match framing {
                    Framing::Sse => sse_frame(&CompletionChunk::text(text)),
                    Framing::RawText => Ok(Bytes::from(text)),
                };
                Some((frame, Some(events)))
            }
            Some(Ok(StreamEvent::Done)) => match framing {
                Framing::Sse => Some((
                    Ok(Bytes::from(format!("data: {DONE_SENTINEL}\n\n"))),
                    None,
                )),
                Framing::RawText => None,
            },
            Some(Err(err)) => {
                PROXY_ERRORS.click();
                tracing::warn!(error = %err, "upstream stream failed");
                match framing {
                    Framing::Sse => {
                        let chunk = CompletionChunk {
                            choices: Vec::new(),
                            error: Some(ChunkError {
                                message: Some(err.message().to_string()),
                                error_type: None,
                            }),
                        };
                        Some((sse_frame(&chunk), None))
                    }
                    Framing::RawText => {
                        flush_before_abort().await;
                        Some((Err(err), None))
                    }
                }
            }
            None => match framing {
                Framing::Sse => None,
                Framing::RawText => {
                    flush_before_abort().await;
                    Some((
                        Err(Error::streaming(
                            "upstream ended before the reply was complete",
                            None,
                        )),
                        None,
                    ))
                }
            },
        }
    })
}

/// Returns `Pending` once so the connection flushes the head and any buffered text before the
/// body fails. An error from the first poll of a body would otherwise drop the head with it.
async fn flush_before_abort() {
    tokio::task::yield_now().await;
}

fn sse_frame(chunk: &CompletionChunk) -> Result<Bytes> {
    let json = serde_json::to_string(chunk)?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::StreamParser;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn events(items: Vec<Result<StreamEvent>>) -> DeltaStream {
        Box::pin(stream::iter(items))
    }

    async fn collect(stream: impl Stream<Item = Result<Bytes>>) -> (Vec<u8>, Option<Error>) {
        let mut out = Vec::new();
        let mut stream = Box::pin(stream);
        while let Some(item) = stream.next().await {
            match item {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(err) => return (out, Some(err)),
            }
        }
        (out, None)
    }

    fn unconfigured() -> Arc<AppState> {
        Arc::new(AppState::new(
            ProviderSource::Fixed(
                ProviderConfig::openai("sk-test", "http://127.0.0.1:9", "gpt-test").unwrap(),
            ),
            ServerConfig::new(),
        ))
    }

    #[tokio::test]
    async fn sse_encoding_round_trips_through_parser() {
        let input = events(vec![
            Ok(StreamEvent::Delta("Hel".into())),
            Ok(StreamEvent::Delta("lo €".into())),
            Ok(StreamEvent::Done),
        ]);
        let (bytes, err) = collect(encode_events(input, Framing::Sse)).await;
        assert!(err.is_none());
        assert!(bytes.ends_with(b"data: [DONE]\n\n"));

        let mut parser = StreamParser::new(Framing::Sse);
        let parsed = parser.feed(&bytes).unwrap();
        assert_eq!(
            parsed,
            vec![
                StreamEvent::Delta("Hel".into()),
                StreamEvent::Delta("lo €".into()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn sse_failure_becomes_error_frame_without_done() {
        let input = events(vec![
            Ok(StreamEvent::Delta("partial".into())),
            Err(Error::timeout("no data received from the stream", None)),
        ]);
        let (bytes, err) = collect(encode_events(input, Framing::Sse)).await;
        assert!(err.is_none());
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains(DONE_SENTINEL));

        let mut parser = StreamParser::new(Framing::Sse);
        let err = parser.feed(text.as_bytes()).unwrap_err();
        assert!(err.is_streaming());
        assert!(err.to_string().contains("no data received"));
    }

    #[tokio::test]
    async fn raw_encoding_passes_text_and_aborts_on_truncation() {
        let input = events(vec![
            Ok(StreamEvent::Delta("one ".into())),
            Ok(StreamEvent::Delta("two".into())),
            Ok(StreamEvent::Done),
        ]);
        let (bytes, err) = collect(encode_events(input, Framing::RawText)).await;
        assert_eq!(bytes, b"one two");
        assert!(err.is_none());

        let input = events(vec![Ok(StreamEvent::Delta("one ".into()))]);
        let (bytes, err) = collect(encode_events(input, Framing::RawText)).await;
        assert_eq!(bytes, b"one ");
        assert!(err.unwrap().is_streaming());
    }

    #[tokio::test]
    async fn raw_abort_yields_to_the_connection_first() {
        let mut body = tokio_test::task::spawn(encode_events(events(Vec::new()), Framing::RawText));
        assert!(body.poll_next().is_pending());
        match body.poll_next() {
            std::task::Poll::Ready(Some(Err(err))) => assert!(err.is_streaming()),
            other => panic!("expected the body to abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = router(unconfigured())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn empty_prompt_is_bad_request() {
        let request = Request::post("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"prompt":"  ","messages":[],"input":"hi"}"#))
            .unwrap();
        let response = router(unconfigured()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert!(!body.success);
        assert!(body.error.contains("prompt"));
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request_json() {
        let request = Request::post("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = router(unconfigured()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert!(!body.success);
    }

    #[tokio::test]
    async fn configuration_error_is_server_error_json() {
        let err = Error::configuration(
            "OPENAI_API_KEY is not set",
            Some("OPENAI_API_KEY".to_string()),
        );
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert!(!body.success);
        assert!(body.error.contains("OPENAI_API_KEY"));
    }

    #[tokio::test]
    async fn upstream_status_is_passed_through() {
        let response = ApiError::from(Error::rate_limit("slow down", Some(3))).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn args_resolve_to_config() {
        let config = ServerConfig::try_from(ServerArgs::default()).unwrap();
        assert_eq!(config, ServerConfig::new());

        let config = ServerConfig::try_from(ServerArgs {
            bind: Some("0.0.0.0:8080".to_string()),
            framing: Some("raw".to_string()),
            idle_timeout: Some(5),
            temperature: Some("0.5".to_string()),
            max_tokens: Some(100),
        })
        .unwrap();
        assert_eq!(config.temperature, Some(0.5));
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert_eq!(config.framing, Framing::RawText);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.max_tokens, Some(100));

        let err = ServerConfig::try_from(ServerArgs {
            framing: Some("xml".to_string()),
            ..ServerArgs::default()
        })
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn args_reject_bad_temperature() {
        for bad in ["warm", "-1", "7.5"] {
            let err = ServerConfig::try_from(ServerArgs {
                temperature: Some(bad.to_string()),
                ..ServerArgs::default()
            })
            .unwrap_err();
            assert!(err.is_validation(), "{bad} should be rejected");
        }

        let err = ServerConfig::try_from(ServerArgs {
            idle_timeout: Some(0),
            ..ServerArgs::default()
        })
        .unwrap_err();
        assert!(err.is_validation());
    }
}
