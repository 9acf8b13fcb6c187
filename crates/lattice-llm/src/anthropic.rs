use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use lattice_core::config::AppConfig;
use lattice_core::error::{LatticeError, Result};
use lattice_core::llm::{LanguageModel, Prompt, ResponseFormat};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

const JSON_INSTRUCTION: &str =
    "Output ONLY a single valid JSON object. No markdown fences, no commentary.";

// ── Anthropic Messages API request/response types ──────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

/// `LanguageModel` backed by the Anthropic Messages API. One instance per
/// call site, each with its own model name.
pub struct AnthropicModel {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    api_url: String,
}

impl AnthropicModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(CLIENT_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            api_url: ANTHROPIC_API_URL.to_string(),
        })
    }

    pub fn from_config(config: &AppConfig, model: &str) -> Result<Self> {
        if config.anthropic_api_key.is_empty() {
            return Err(LatticeError::Config("ANTHROPIC_API_KEY is not set".into()));
        }
        Self::new(config.anthropic_api_key.clone(), model)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Point at a compatible endpoint instead of the public API.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn system_prompt(prompt: &Prompt, format: ResponseFormat) -> Option<String> {
        match (format, &prompt.system) {
            (ResponseFormat::Text, system) => system.clone(),
            (ResponseFormat::Json, Some(system)) => Some(format!("{system}\n\n{JSON_INSTRUCTION}")),
            (ResponseFormat::Json, None) => Some(JSON_INSTRUCTION.to_string()),
        }
    }
}

/// Rate limits, overload and server errors are worth retrying.
fn classify_status(status: StatusCode, body: String) -> LatticeError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() || status.as_u16() == 529 {
        LatticeError::ModelUnavailable(format!("Anthropic API returned {status}: {body}"))
    } else {
        LatticeError::Model(format!("Anthropic API returned {status}: {body}"))
    }
}

fn classify_send_error(e: reqwest::Error) -> LatticeError {
    if e.is_timeout() {
        LatticeError::Timeout(CLIENT_TIMEOUT)
    } else if e.is_connect() {
        LatticeError::ModelUnavailable(format!("HTTP request to Anthropic failed: {e}"))
    } else {
        LatticeError::Http(e)
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt, format: ResponseFormat) -> Result<String> {
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: Self::system_prompt(prompt, format),
            messages: vec![Message {
                role: "user",
                content: &prompt.user,
            }],
        };

        debug!(
            model = %self.model,
            prompt_len = prompt.user.len(),
            format = ?format,
            "Sending request to Anthropic API"
        );

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".into());
            return Err(classify_status(status, body));
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LatticeError::Model(format!("failed to parse Anthropic response: {e}")))?;

        let text = api_response
            .content
            .into_iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(LatticeError::Model("Anthropic returned an empty response".into()));
        }

        debug!(
            model = %self.model,
            stop_reason = ?api_response.stop_reason,
            response_len = text.len(),
            "Received Anthropic API response"
        );

        Ok(text)
    }
}
