//! Upstream LLM provider selection and streaming completion requests.
//!
//! The provider is chosen from the environment: if any Azure variable is present the Azure
//! OpenAI endpoint and `api-key` auth are used, otherwise a generic OpenAI-compatible endpoint
//! with bearer auth. Missing credentials are a configuration error; there is no built-in key.

use std::fmt;
use std::time::{Duration, Instant};

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response};
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};
use crate::observability::PROXY_UPSTREAM_TTFB;
use crate::sse::{
    DeltaStream, Framing, process_stream, with_idle_timeout, with_response_timeout,
};
use crate::types::{CompletionMessage, CompletionRequest, Message};

/// Base URL used when `OPENAI_API_BASE_URL` is not set.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Model used when `OPENAI_MODEL` is not set.
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";

/// API version used when `AZURE_OPENAI_API_VERSION` is not set.
pub const DEFAULT_AZURE_API_VERSION: &str = "2023-05-15";

const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
const OPENAI_API_BASE_URL: &str = "OPENAI_API_BASE_URL";
const OPENAI_MODEL: &str = "OPENAI_MODEL";
const AZURE_OPENAI_API_BASE_URL: &str = "AZURE_OPENAI_API_BASE_URL";
const AZURE_OPENAI_API_KEY: &str = "AZURE_OPENAI_API_KEY";
const AZURE_OPENAI_DEPLOYMENT: &str = "AZURE_OPENAI_DEPLOYMENT";
const AZURE_OPENAI_API_VERSION: &str = "AZURE_OPENAI_API_VERSION";

/// Which wire dialect the upstream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// api.openai.com or a compatible server; bearer auth, model in the body.
    OpenAi,

    /// Azure OpenAI; `api-key` header, deployment in the path.
    Azure,
}

/// Resolved upstream settings.
#[derive(Clone, PartialEq)]
pub struct ProviderConfig {
    kind: ProviderKind,
    base_url: Url,
    api_key: String,
    model: String,
    api_version: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl ProviderConfig {
    /// Creates an OpenAI-compatible configuration.
    pub fn openai(
        api_key: impl Into<String>,
        base_url: &str,
        model: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            kind: ProviderKind::OpenAi,
            base_url: parse_base_url(base_url, OPENAI_API_BASE_URL)?,
            api_key: api_key.into(),
            model: model.into(),
            api_version: None,
            temperature: None,
            max_tokens: None,
        })
    }

    /// Creates an Azure OpenAI configuration.
    pub fn azure(
        api_key: impl Into<String>,
        base_url: &str,
        deployment: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            kind: ProviderKind::Azure,
            base_url: parse_base_url(base_url, AZURE_OPENAI_API_BASE_URL)?,
            api_key: api_key.into(),
            model: deployment.into(),
            api_version: Some(api_version.into()),
            temperature: None,
            max_tokens: None,
        })
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, treating empty values as unset.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first required variable that is missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let require = |key: &str| {
            get(key).ok_or_else(|| {
                Error::configuration(
                    format!("{key} environment variable is not set"),
                    Some(key.to_string()),
                )
            })
        };

        let azure_selected = [
            AZURE_OPENAI_API_BASE_URL,
            AZURE_OPENAI_API_KEY,
            AZURE_OPENAI_DEPLOYMENT,
        ]
        .iter()
        .any(|key| get(key).is_some());

        if azure_selected {
            let base_url = require(AZURE_OPENAI_API_BASE_URL)?;
            let api_key = require(AZURE_OPENAI_API_KEY)?;
            let deployment = require(AZURE_OPENAI_DEPLOYMENT)?;
            let api_version = get(AZURE_OPENAI_API_VERSION)
                .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string());
            Self::azure(api_key, &base_url, deployment, api_version)
        } else {
            let api_key = require(OPENAI_API_KEY)?;
            let base_url =
                get(OPENAI_API_BASE_URL).unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
            let model = get(OPENAI_MODEL).unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
            Self::openai(api_key, &base_url, model)
        }
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the cap on generated tokens.
    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// The selected dialect.
    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// The model name, or the deployment name for Azure.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The streaming chat-completions URL.
    pub fn endpoint(&self) -> Result<Url> {
        match self.kind {
            ProviderKind::OpenAi => Ok(self.base_url.join("v1/chat/completions")?),
            ProviderKind::Azure => {
                let mut url = self
                    .base_url
                    .join(&format!("openai/deployments/{}/chat/completions", self.model))?;
                if let Some(api_version) = &self.api_version {
                    url.query_pairs_mut()
                        .append_pair("api-version", api_version);
                }
                Ok(url)
            }
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        let invalid_key = |_| {
            Error::configuration(
                "API key contains characters not allowed in a header",
                None,
            )
        };
        match self.kind {
            ProviderKind::OpenAi => {
                let value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                    .map_err(invalid_key)?;
                headers.insert(header::AUTHORIZATION, value);
            }
            ProviderKind::Azure => {
                let value = HeaderValue::from_str(&self.api_key).map_err(invalid_key)?;
                headers.insert("api-key", value);
            }
        }
        Ok(headers)
    }

    fn completion_request(&self, messages: &[Message]) -> CompletionRequest {
        CompletionRequest {
            model: match self.kind {
                ProviderKind::OpenAi => Some(self.model.clone()),
                ProviderKind::Azure => None,
            },
            messages: messages.iter().map(CompletionMessage::from).collect(),
            stream: true,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("api_version", &self.api_version)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

fn parse_base_url(base_url: &str, key: &str) -> Result<Url> {
    let trimmed = base_url.trim().trim_end_matches('/');
    Url::parse(&format!("{trimmed}/")).map_err(|err| {
        Error::configuration(
            format!("{key} is not a valid URL: {err}"),
            Some(key.to_string()),
        )
    })
}

/// A configured upstream ready to issue streaming completions.
#[derive(Debug, Clone)]
pub struct Provider {
    client: ReqwestClient,
    config: ProviderConfig,
    idle_timeout: Duration,
}

impl Provider {
    /// Creates a provider that sends through `client`.
    pub fn new(client: ReqwestClient, config: ProviderConfig, idle_timeout: Duration) -> Self {
        Self {
            client,
            config,
            idle_timeout,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Process upstream error responses and convert to our Error type.
    async fn process_error_response(response: Response) -> Error {
        let status_code = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.parse::<u64>().ok());

        #[derive(Deserialize)]
        struct ErrorResponse {
            error: Option<ErrorDetail>,
        }

        #[derive(Deserialize)]
        struct ErrorDetail {
            #[serde(rename = "type")]
            error_type: Option<String>,
            message: Option<String>,
            param: Option<String>,
        }

        let error_body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read upstream error response: {e}"),
                    Some(Box::new(e)),
                );
            }
        };

        let detail = serde_json::from_str::<ErrorResponse>(&error_body)
            .ok()
            .and_then(|e| e.error);
        let error_type = detail.as_ref().and_then(|e| e.error_type.clone());
        let error_param = detail.as_ref().and_then(|e| e.param.clone());
        let error_message = detail
            .and_then(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| {
                if error_body.trim().is_empty() {
                    format!("upstream returned HTTP {status_code}")
                } else {
                    error_body.clone()
                }
            });

        match status_code {
            400 => Error::bad_request(error_message, error_param),
            401 => Error::authentication(error_message),
            403 => Error::permission(error_message),
            404 => Error::not_found(error_message, None, None),
            429 => Error::rate_limit(error_message, retry_after),
            500 => Error::internal_server(error_message),
            502..=504 => Error::service_unavailable(error_message, retry_after),
            _ => Error::api(status_code, error_type, error_message),
        }
    }

    /// Starts a streaming completion for `messages` and returns its deltas.
    pub async fn stream_chat(&self, messages: &[Message]) -> Result<DeltaStream> {
        let url = self.config.endpoint()?;
        let body = self.config.completion_request(messages);
        tracing::info!(
            provider = ?self.config.kind,
            model = %self.config.model,
            messages = messages.len(),
            "starting upstream completion"
        );

        let start = Instant::now();
        let send = self
            .client
            .post(url)
            .headers(self.config.headers()?)
            .json(&body)
            .send();
        let response = with_response_timeout(send, self.idle_timeout).await?;
        PROXY_UPSTREAM_TTFB.add(start.elapsed().as_secs_f64());

        if !response.status().is_success() {
            let err = Self::process_error_response(response).await;
            tracing::warn!(error = %err, "upstream rejected completion");
            return Err(err);
        }

        let events = process_stream(response.bytes_stream(), Framing::Sse);
        Ok(with_idle_timeout(events, self.idle_timeout))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn openai_defaults() {
        let config = ProviderConfig::from_lookup(lookup(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.kind(), ProviderKind::OpenAi);
        assert_eq!(config.model(), DEFAULT_OPENAI_MODEL);
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn openai_custom_base_url_and_model() {
        let config = ProviderConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_API_BASE_URL", "http://localhost:8080/proxy/"),
            ("OPENAI_MODEL", "gpt-4o-mini"),
        ]))
        .unwrap();
        assert_eq!(config.model(), "gpt-4o-mini");
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "http://localhost:8080/proxy/v1/chat/completions"
        );
    }

    #[test]
    fn missing_key_is_configuration_error() {
        let err = ProviderConfig::from_lookup(lookup(&[("OPENAI_MODEL", "gpt-4")])).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("OPENAI_API_KEY"));

        let err = ProviderConfig::from_lookup(lookup(&[("OPENAI_API_KEY", "  ")])).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn azure_selected_by_any_azure_variable() {
        let config = ProviderConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-ignored"),
            ("AZURE_OPENAI_API_BASE_URL", "https://example.openai.azure.com"),
            ("AZURE_OPENAI_API_KEY", "azure-key"),
            ("AZURE_OPENAI_DEPLOYMENT", "gpt35"),
        ]))
        .unwrap();
        assert_eq!(config.kind(), ProviderKind::Azure);
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "https://example.openai.azure.com/openai/deployments/gpt35/chat/completions?api-version=2023-05-15"
        );
        let headers = config.headers().unwrap();
        assert_eq!(headers.get("api-key").unwrap(), "azure-key");
        assert!(headers.get(header::AUTHORIZATION).is_none());
        assert!(config.completion_request(&[]).model.is_none());
    }

    #[test]
    fn partial_azure_configuration_is_an_error() {
        let err = ProviderConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("AZURE_OPENAI_API_KEY", "azure-key"),
        ]))
        .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("AZURE_OPENAI_API_BASE_URL"));
    }

    #[test]
    fn invalid_base_url_is_configuration_error() {
        let err = ProviderConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_API_BASE_URL", "not a url"),
        ]))
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn bearer_auth_and_redacted_debug() {
        let config =
            ProviderConfig::openai("sk-secret", DEFAULT_OPENAI_BASE_URL, "gpt-4").unwrap();
        let headers = config.headers().unwrap();
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer sk-secret");
        assert!(!format!("{config:?}").contains("sk-secret"));
    }

    #[test]
    fn completion_request_carries_full_history() {
        let config = ProviderConfig::openai("sk", DEFAULT_OPENAI_BASE_URL, "gpt-4")
            .unwrap()
            .with_temperature(Some(0.7))
            .with_max_tokens(Some(256));
        let messages = vec![Message::system("sys"), Message::user("hi")];
        let request = config.completion_request(&messages);
        assert_eq!(request.model.as_deref(), Some("gpt-4"));
        assert_eq!(request.messages.len(), 2);
        assert!(request.stream);
        assert_eq!(request.temperature, Some(0.7));
        assert_eq!(request.max_tokens, Some(256));
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let config = ProviderConfig::openai("sk", &format!("http://{addr}"), "gpt-4").unwrap();
        let provider = Provider::new(ReqwestClient::new(), config, Duration::from_millis(200));
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            provider.stream_chat(&[Message::user("hi")]),
        )
        .await
        .expect("the upstream request must give up on its own");
        let err = result.err().unwrap();
        assert!(err.is_timeout(), "{err}");
        accepted.abort();
    }
}
