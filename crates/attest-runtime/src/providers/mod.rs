//! Answer provider abstractions for attest-runtime.
//!
//! A provider exposes exactly one capability: `complete(prompt) -> text`.
//! This module defines the [`LlmProvider`] trait, the per-request
//! [`ProviderConfig`] parsed from JSON payloads, and [`ProviderHandle`],
//! which bounds every call by its timeout and normalises failures into a
//! [`ProviderResponse`].
//!
//! ## Security
//!
//! Credentials live in [`ApiCredential`] and only inside [`ProviderConfig`].
//! Diagnostics pass through [`secrets::redact`] before they are logged or
//! returned.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use attest_core::schema::{self, PayloadSchema};
use attest_core::{
    count_tokens, EngineError, EngineResult, ProviderDescriptor, ProviderKind, ProviderResponse,
    ResponseStatus,
};

mod anthropic;
mod custom;
mod echo;
mod factory;
mod ollama;
mod openai;
pub mod secrets;

pub use anthropic::{AnthropicProvider, AnthropicProviderFactory};
pub use custom::{CustomProvider, CustomProviderFactory};
pub use echo::{EchoProvider, EchoProviderFactory};
pub use factory::{ProviderFactory, ProviderRegistry};
pub use ollama::{OllamaProvider, OllamaProviderFactory};
pub use openai::{OpenAiProvider, OpenAiProviderFactory};
pub use secrets::{redact, ApiCredential, CredentialSource};

/// Environment variable holding the OpenAI API key.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Environment variable holding the Anthropic API key.
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Errors from providers.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Response parse error: {0}")]
    ParseError(String),

    #[error("Authentication failed (HTTP {status})")]
    AuthError { status: u16 },

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Response status this failure is reported as.
    pub fn status(&self) -> ResponseStatus {
        match self {
            ProviderError::Timeout(_) => ResponseStatus::Timeout,
            ProviderError::AuthError { .. } | ProviderError::MissingCredential(_) => {
                ResponseStatus::AuthError
            }
            ProviderError::ParseError(_) => ResponseStatus::MalformedResponse,
            ProviderError::HttpError(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::ApiError { .. }
            | ProviderError::NotConfigured(_) => ResponseStatus::TransportError,
        }
    }
}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        let code = match e.status() {
            ResponseStatus::AuthError => attest_core::ErrorCode::ProviderAuth,
            _ => attest_core::ErrorCode::ProviderTransport,
        };
        EngineError::new(code, e.to_string())
    }
}

/// Everything needed to call one provider for one request.
#[derive(Clone)]
pub struct ProviderConfig {
    pub descriptor: ProviderDescriptor,
    pub credential: Option<ApiCredential>,
    /// Upper bound on one `complete` call.
    pub timeout: Duration,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("descriptor", &self.descriptor)
            .field("credential", &self.credential)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ProviderConfig {
    /// Config for a provider with no credential and the given timeout.
    pub fn new(kind: ProviderKind, timeout: Duration) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                name: ProviderDescriptor::default_name(kind, None),
                kind,
                base_url: None,
                model: None,
            },
            credential: None,
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn kind(&self) -> ProviderKind {
        self.descriptor.kind
    }

    /// Payload base address, else the kind's default.
    pub fn base_url(&self) -> Option<&str> {
        self.descriptor
            .base_url
            .as_deref()
            .or_else(|| self.descriptor.kind.default_base_url())
            .map(|url| url.trim_end_matches('/'))
    }

    /// Build from one schema-checked provider payload entry.
    pub fn from_entry(entry: &JsonValue, default_timeout: Duration) -> EngineResult<Self> {
        let kind: ProviderKind = serde_json::from_value(entry["type"].clone())?;
        let model = entry["model"]
            .as_str()
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        let name = entry["name"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| ProviderDescriptor::default_name(kind, model.as_deref()));
        let base_url = entry["base_url"].as_str().map(str::to_string);

        if kind == ProviderKind::Custom && base_url.is_none() {
            return Err(EngineError::malformed(format!(
                "custom provider '{}' requires base_url",
                name
            )));
        }

        let timeout = entry["timeout_ms"]
            .as_u64()
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);

        let credential = match kind {
            ProviderKind::OpenAi => ApiCredential::from_config_or_env(
                entry,
                "api_key",
                OPENAI_API_KEY_ENV,
                "OpenAI API key",
            ),
            ProviderKind::Anthropic => ApiCredential::from_config_or_env(
                entry,
                "api_key",
                ANTHROPIC_API_KEY_ENV,
                "Anthropic API key",
            ),
            _ => entry["api_key"]
                .as_str()
                .map(|key| ApiCredential::new(key, CredentialSource::Config, "provider API key")),
        };

        Ok(Self {
            descriptor: ProviderDescriptor {
                name,
                kind,
                base_url,
                model,
            },
            credential,
            timeout,
        })
    }
}

/// Parse a provider payload: a JSON array of entries, or a single entry.
///
/// Rejects schema violations and duplicate names with `ERR_MALFORMED_INPUT`.
pub fn parse_providers(json: &str, default_timeout: Duration) -> EngineResult<Vec<ProviderConfig>> {
    let value: JsonValue = serde_json::from_str(json)?;
    parse_provider_value(value, default_timeout)
}

pub fn parse_provider_value(
    value: JsonValue,
    default_timeout: Duration,
) -> EngineResult<Vec<ProviderConfig>> {
    let value = match value {
        JsonValue::Object(_) => JsonValue::Array(vec![value]),
        other => other,
    };
    schema::check(PayloadSchema::Providers, &value)?;

    let entries = value.as_array().cloned().unwrap_or_default();
    let mut seen = BTreeSet::new();
    let mut configs = Vec::with_capacity(entries.len());
    for entry in &entries {
        let config = ProviderConfig::from_entry(entry, default_timeout)?;
        if !seen.insert(config.name().to_string()) {
            return Err(EngineError::malformed(format!(
                "duplicate provider name '{}'",
                config.name()
            )));
        }
        configs.push(config);
    }
    Ok(configs)
}

/// Provider abstraction allows swapping answer backends.
///
/// This is the only place where provider calls are made. Implementations
/// hold their configuration and a shared HTTP client; they keep no
/// per-call state.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Produce a completion for `prompt`.
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError>;

    /// Check if provider is usable without making a call.
    async fn health_check(&self) -> bool;

    /// Get provider name for logs and metrics.
    fn name(&self) -> &str;

    /// Estimate tokens for a prompt.
    fn estimate_tokens(&self, text: &str) -> u32 {
        count_tokens(text) as u32
    }
}

/// A configured provider ready to be invoked.
#[derive(Clone)]
pub struct ProviderHandle {
    config: Arc<ProviderConfig>,
    provider: Arc<dyn LlmProvider>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("config", &self.config)
            .finish()
    }
}

impl ProviderHandle {
    pub fn new(config: ProviderConfig, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            config: Arc::new(config),
            provider,
        }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }

    /// Call the provider once, bounded by its timeout.
    ///
    /// Never fails: every outcome becomes a [`ProviderResponse`] with a
    /// redacted diagnostic.
    pub async fn invoke(&self, prompt: &str) -> ProviderResponse {
        let started = Instant::now();
        let timeout = self.config.timeout;
        let outcome = match tokio::time::timeout(timeout, self.provider.complete(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(text) => {
                tracing::debug!(provider = %self.name(), latency_ms, "Provider call succeeded");
                ProviderResponse::ok(self.name(), text, latency_ms)
            }
            Err(e) => self.failure(e, latency_ms),
        }
    }

    /// Response for a failure that happened outside `complete`.
    pub fn failure(&self, error: ProviderError, latency_ms: u64) -> ProviderResponse {
        let status = error.status();
        let message = redact(&error.to_string(), self.config.credential.as_ref());
        tracing::warn!(
            provider = %self.name(),
            status = status.as_str(),
            error = %message,
            "Provider call failed"
        );
        ProviderResponse::failed(self.name(), status, message, latency_ms)
    }
}

/// Response for a provider that could not even be constructed.
pub fn construction_failure(config: &ProviderConfig, error: ProviderError) -> ProviderResponse {
    let status = error.status();
    let message = redact(&error.to_string(), config.credential.as_ref());
    tracing::warn!(provider = %config.name(), error = %message, "Provider unavailable");
    ProviderResponse::failed(config.name(), status, message, 0)
}

/// Require a non-empty credential for hosted providers.
pub(crate) fn require_credential<'a>(
    credential: Option<&'a ApiCredential>,
    label: &str,
) -> Result<&'a ApiCredential, ProviderError> {
    credential.filter(|c| !c.is_empty()).ok_or_else(|| {
        ProviderError::MissingCredential(format!("{} credential is not configured", label))
    })
}

/// Send a JSON request and decode a JSON body, mapping HTTP failures.
pub(crate) async fn send_json(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<JsonValue, ProviderError> {
    let response = request.timeout(timeout).send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout(timeout)
        } else {
            ProviderError::HttpError(e.without_url().to_string())
        }
    })?;

    let status = response.status();

    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ProviderError::RateLimited { retry_after });
    }

    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(ProviderError::AuthError {
            status: status.as_u16(),
        });
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::ApiError {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        });
    }

    response.json::<JsonValue>().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout(timeout)
        } else {
            ProviderError::ParseError(e.without_url().to_string())
        }
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// Serve one canned HTTP response and hand back the raw request text.
    pub(crate) async fn serve_once(status: u16, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = body.to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = format!(
                "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            request
        });
        (format!("http://{}", addr), handle)
    }

    /// Accept one connection and never answer.
    pub(crate) async fn serve_silent() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut socket).await;
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });
        format!("http://{}", addr)
    }

    /// Address with nothing listening on it.
    pub(crate) async fn closed_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_core::ErrorCode;

    const TIMEOUT: Duration = Duration::from_secs(15);

    struct SlowProvider;

    #[async_trait]
    impl LlmProvider for SlowProvider {
        async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".to_string())
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    struct LeakyProvider;

    #[async_trait]
    impl LlmProvider for LeakyProvider {
        async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
            Err(ProviderError::ApiError {
                status: 400,
                message: "bad key sk-leaky-secret".to_string(),
            })
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "leaky"
        }
    }

    #[test]
    fn test_parse_single_object_and_defaults() {
        let configs = parse_providers(r#"{"type": "echo"}"#, TIMEOUT).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name(), "echo");
        assert_eq!(configs[0].timeout, TIMEOUT);
        assert!(configs[0].credential.is_none());
    }

    #[test]
    fn test_parse_names_and_timeouts() {
        let configs = parse_providers(
            r#"[
                {"type": "ollama", "model": "llama3"},
                {"type": "custom", "name": "mine", "base_url": "http://localhost:9000/gen", "timeout_ms": 250},
                {"type": "local-endpoint", "name": "alias"}
            ]"#,
            TIMEOUT,
        )
        .unwrap();
        assert_eq!(configs[0].name(), "ollama:llama3");
        assert_eq!(configs[0].base_url(), Some("http://localhost:11434"));
        assert_eq!(configs[1].timeout, Duration::from_millis(250));
        assert_eq!(configs[2].kind(), ProviderKind::Ollama);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = parse_providers(
            r#"[{"type": "echo", "name": "x"}, {"type": "ollama", "name": "x"}]"#,
            TIMEOUT,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedInput);
        assert!(err.message.contains("duplicate"));
    }

    #[test]
    fn test_default_names_can_collide() {
        let err = parse_providers(r#"[{"type": "echo"}, {"type": "echo"}]"#, TIMEOUT).unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedInput);
    }

    #[test]
    fn test_custom_requires_base_url() {
        let err = parse_providers(r#"[{"type": "custom"}]"#, TIMEOUT).unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedInput);
    }

    #[test]
    fn test_empty_and_unknown_payloads_rejected() {
        assert!(parse_providers("[]", TIMEOUT).is_err());
        assert!(parse_providers(r#"[{"type": "telepathy"}]"#, TIMEOUT).is_err());
        assert!(parse_providers("not json", TIMEOUT).is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ProviderError::Timeout(TIMEOUT).status(),
            ResponseStatus::Timeout
        );
        assert_eq!(
            ProviderError::AuthError { status: 401 }.status(),
            ResponseStatus::AuthError
        );
        assert_eq!(
            ProviderError::MissingCredential("x".into()).status(),
            ResponseStatus::AuthError
        );
        assert_eq!(
            ProviderError::ParseError("x".into()).status(),
            ResponseStatus::MalformedResponse
        );
        assert_eq!(
            ProviderError::RateLimited { retry_after: None }.status(),
            ResponseStatus::TransportError
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_times_out() {
        let mut config = ProviderConfig::new(ProviderKind::Custom, Duration::from_millis(50));
        config.descriptor.name = "slow".to_string();
        let handle = ProviderHandle::new(config, Arc::new(SlowProvider));

        let response = handle.invoke("hi").await;
        assert_eq!(response.status, ResponseStatus::Timeout);
        assert_eq!(response.provider, "slow");
        assert!(response.output.is_empty());
    }

    // ==================== SECURITY TESTS ====================

    #[tokio::test]
    async fn test_invoke_redacts_credential_from_error() {
        let mut config = ProviderConfig::new(ProviderKind::Custom, TIMEOUT);
        config.credential = Some(ApiCredential::new(
            "sk-leaky-secret",
            CredentialSource::Config,
            "key",
        ));
        let handle = ProviderHandle::new(config, Arc::new(LeakyProvider));

        let response = handle.invoke("hi").await;
        assert_eq!(response.status, ResponseStatus::TransportError);
        let error = response.error.unwrap();
        assert!(!error.contains("sk-leaky-secret"));
        assert!(error.contains(secrets::REDACTED));
    }

    #[test]
    fn test_provider_config_debug_hides_key() {
        let configs = parse_providers(
            r#"[{"type": "openai", "api_key": "sk-debug-secret"}]"#,
            TIMEOUT,
        )
        .unwrap();
        let debug = format!("{:?}", configs[0]);
        assert!(!debug.contains("sk-debug-secret"));
        assert_eq!(configs[0].credential.as_ref().unwrap().expose(), "sk-debug-secret");
    }
}
