//! HTTP client for OpenAI-compatible completion APIs.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{CompletionError, CompletionRequest, CompletionService};

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Which API shape to call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    /// `POST {base}/completions` with a `prompt`.
    #[default]
    Completions,
    /// `POST {base}/chat/completions` with the prompt as one user message.
    Chat,
}

impl Endpoint {
    fn path(self) -> &'static str {
        match self {
            Self::Completions => "completions",
            Self::Chat => "chat/completions",
        }
    }
}

/// Connection settings for [`OpenAiCompletionClient`].
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API root, without a trailing slash.
    pub base_url: String,
    /// Which request shape to use.
    pub endpoint: Endpoint,
    /// Whole-request timeout enforced by the HTTP client.
    pub request_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoint: Endpoint::Completions,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// [`CompletionService`] over the OpenAI HTTP API.
///
/// The API key is held here and nowhere else; `Debug` output omits it.
pub struct OpenAiCompletionClient {
    http: reqwest::Client,
    api_key: String,
    config: OpenAiConfig,
}

impl fmt::Debug for OpenAiCompletionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCompletionClient")
            .field("base_url", &self.config.base_url)
            .field("endpoint", &self.config.endpoint)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl OpenAiCompletionClient {
    /// A client for the public API with default settings.
    pub fn new(api_key: impl Into<String>) -> Result<Self, CompletionError> {
        Self::with_config(api_key, OpenAiConfig::default())
    }

    /// A client with explicit connection settings.
    pub fn with_config(
        api_key: impl Into<String>,
        config: OpenAiConfig,
    ) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CompletionError::Internal(anyhow::anyhow!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            config: OpenAiConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    /// The settings this client was built with.
    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn url(&self) -> String {
        format!("{}/{}", self.config.base_url, self.config.endpoint.path())
    }

    fn map_transport(&self, e: reqwest::Error) -> CompletionError {
        if e.is_timeout() {
            CompletionError::Timeout {
                timeout_ms: self.config.request_timeout.as_millis() as u64,
            }
        } else {
            CompletionError::Network(e.to_string())
        }
    }
}

/// The JSON body sent for `request` on `endpoint`.
pub fn request_body(endpoint: Endpoint, request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "n": request.candidate_count,
        "temperature": request.temperature,
        "stop": request.stop,
    });
    match endpoint {
        Endpoint::Completions => body["prompt"] = json!(request.prompt),
        Endpoint::Chat => {
            body["messages"] = json!([{ "role": "user", "content": request.prompt }]);
        }
    }
    body
}

#[derive(Deserialize)]
struct ResponseBody {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Extract candidate texts from a successful response body.
pub fn parse_response(endpoint: Endpoint, body: &str) -> Result<Vec<String>, CompletionError> {
    let parsed: ResponseBody = serde_json::from_str(body)
        .map_err(|e| CompletionError::MalformedResponse(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .enumerate()
        .map(|(i, choice)| {
            let text = match endpoint {
                Endpoint::Completions => choice.text,
                Endpoint::Chat => choice.message.and_then(|m| m.content),
            };
            text.ok_or_else(|| {
                CompletionError::MalformedResponse(format!("choice {i} has no text"))
            })
        })
        .collect()
}

/// The most useful message in an error response: `error.message` when the
/// body is the usual JSON envelope, otherwise the raw body.
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait::async_trait]
impl CompletionService for OpenAiCompletionClient {
    #[tracing::instrument(skip(self, request), fields(model = %request.model, prompt_len = request.prompt.len()))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Vec<String>, CompletionError> {
        let body = request_body(self.config.endpoint, request);
        let resp = self
            .http
            .post(self.url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.map_transport(e))?;
        if !status.is_success() {
            let message = error_message(&text);
            warn!(status = status.as_u16(), %message, "completion request failed");
            return Err(CompletionError::from_status(status.as_u16(), message));
        }

        let candidates = parse_response(self.config.endpoint, &text)?;
        debug!(candidates = candidates.len(), "completion received");
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_body_carries_prompt() {
        let req = CompletionRequest::new("m", "find users");
        let body = request_body(Endpoint::Completions, &req);
        assert_eq!(body["prompt"], "find users");
        assert_eq!(body["n"], 1);
        assert_eq!(body["max_tokens"], 500);
        assert_eq!(body["temperature"], 0.0);
        assert!(body["stop"].is_null());
        assert!(body.get("messages").is_none());
    }

    #[test]
    fn chat_body_wraps_prompt_in_a_message() {
        let req = CompletionRequest::new("m", "find users");
        let body = request_body(Endpoint::Chat, &req);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "find users");
        assert!(body.get("prompt").is_none());
    }

    #[test]
    fn parses_completion_choices() {
        let body = r#"{"choices":[{"text":"  return 1;\n","index":0}]}"#;
        assert_eq!(
            parse_response(Endpoint::Completions, body).unwrap(),
            vec!["  return 1;\n".to_string()]
        );
    }

    #[test]
    fn parses_chat_choices() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"return 2;"}}]}"#;
        assert_eq!(
            parse_response(Endpoint::Chat, body).unwrap(),
            vec!["return 2;".to_string()]
        );
    }

    #[test]
    fn empty_choices_are_not_an_error_here() {
        assert!(parse_response(Endpoint::Completions, r#"{"choices":[]}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn malformed_bodies() {
        for body in ["not json", r#"{"data":[]}"#, r#"{"choices":[{"index":0}]}"#] {
            let err = parse_response(Endpoint::Completions, body).unwrap_err();
            assert_eq!(err.code(), "MALFORMED_RESPONSE", "{body}");
        }
    }

    #[test]
    fn error_message_prefers_envelope() {
        assert_eq!(
            error_message(r#"{"error":{"message":"Incorrect API key","type":"invalid_request_error"}}"#),
            "Incorrect API key"
        );
        assert_eq!(error_message(" bad gateway \n"), "bad gateway");
    }

    #[test]
    fn debug_hides_the_key() {
        let client = OpenAiCompletionClient::new("sk-secret").unwrap();
        let shown = format!("{client:?}");
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("<redacted>"));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = OpenAiCompletionClient::with_config(
            "k",
            OpenAiConfig {
                base_url: "http://localhost:9/v1/".into(),
                endpoint: Endpoint::Chat,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(client.url(), "http://localhost:9/v1/chat/completions");
    }
}
