//! Language model providers for answer generation.
//!
//! | Provider | Endpoint | Key |
//! |----------|----------|-----|
//! | `extractive` | none, quotes the top passages | none |
//! | `openai` | `POST {openai_base_url}/chat/completions` | `OPENAI_API_KEY` |
//! | `gemini` | `POST {gemini_base_url}/models/{model}:generateContent` | `GEMINI_API_KEY` or `GOOGLE_API_KEY` |
//! | `ollama` | `POST {ollama_url}/api/chat` | none |
//!
//! [`resolve_model`] picks the provider for a per-question model name:
//! `gemini-*` goes to Gemini, `gpt-*` and `o1`/`o3`/`o4`-style names go to
//! OpenAI, `extractive` is offline, and anything else uses the configured
//! provider.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use knowbase_core::models::ContextPassage;
use knowbase_core::prompt::{ChatMessage, MessageRole};

use crate::config::LlmConfig;
use crate::http::{self, HttpError};

/// Passages quoted by the extractive provider.
const EXTRACTIVE_PASSAGES: usize = 3;
const EXTRACTIVE_CHARS: usize = 600;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("{0} is not set")]
    MissingApiKey(&'static str),

    #[error("unknown model '{model}'. Available: {available}")]
    UnknownModel { model: String, available: String },

    #[error("{provider} rate limited the request")]
    RateLimited { provider: &'static str },

    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} request failed: {message}")]
    Transport {
        provider: &'static str,
        message: String,
    },

    #[error("empty response from {provider}")]
    EmptyResponse { provider: &'static str },
}

impl LlmError {
    fn from_http(provider: &'static str, err: HttpError) -> Self {
        match err {
            HttpError::Status { status: 429, .. } => LlmError::RateLimited { provider },
            HttpError::Status { status, body, .. } => LlmError::Http {
                provider,
                status,
                body,
            },
            HttpError::Transport { source, .. } => LlmError::Transport {
                provider,
                message: source.to_string(),
            },
        }
    }
}

/// One answer-generation call.
pub struct Completion<'a> {
    pub messages: &'a [ChatMessage],
    /// The passages already rendered into `messages`.
    pub passages: &'a [ContextPassage],
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: &Completion<'_>) -> Result<String, LlmError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Extractive,
    OpenAi,
    Gemini,
    Ollama,
}

impl ProviderKind {
    fn from_config(name: &str) -> Self {
        match name {
            "openai" => ProviderKind::OpenAi,
            "gemini" => ProviderKind::Gemini,
            "ollama" => ProviderKind::Ollama,
            _ => ProviderKind::Extractive,
        }
    }
}

/// Which provider serves `model`.
pub fn provider_for(model: &str, config: &LlmConfig) -> ProviderKind {
    let is_openai_reasoning = model.len() >= 2
        && model.starts_with('o')
        && model[1..].starts_with(|c: char| c.is_ascii_digit());

    if model == "extractive" {
        ProviderKind::Extractive
    } else if model.starts_with("gemini-") {
        ProviderKind::Gemini
    } else if model.starts_with("gpt-") || is_openai_reasoning {
        ProviderKind::OpenAi
    } else {
        match ProviderKind::from_config(&config.provider) {
            // A named model needs a real backend; local names go to Ollama.
            ProviderKind::Extractive => ProviderKind::Ollama,
            kind => kind,
        }
    }
}

/// Build the model for a question. `requested` must be one of
/// [`LlmConfig::available_models`].
pub fn resolve_model(
    config: &LlmConfig,
    requested: Option<&str>,
) -> Result<Box<dyn LanguageModel>, LlmError> {
    let available = config.available_models();
    let model = match requested.map(str::trim).filter(|m| !m.is_empty()) {
        Some(m) if !available.iter().any(|a| a == m) => {
            return Err(LlmError::UnknownModel {
                model: m.to_string(),
                available: available.join(", "),
            })
        }
        Some(m) => m.to_string(),
        None => config.default_model().to_string(),
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| LlmError::Transport {
            provider: "http",
            message: e.to_string(),
        })?;

    let settings = Settings {
        model: model.clone(),
        temperature: config.temperature,
        max_output_tokens: config.max_output_tokens,
        max_retries: config.max_retries,
        client,
    };

    Ok(match provider_for(&model, config) {
        ProviderKind::Extractive => Box::new(Extractive { name: model }),
        ProviderKind::OpenAi => Box::new(OpenAiChat {
            api_key: env_key(&["OPENAI_API_KEY"])?,
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            settings,
        }),
        ProviderKind::Gemini => Box::new(Gemini {
            api_key: env_key(&["GEMINI_API_KEY", "GOOGLE_API_KEY"])?,
            base_url: config.gemini_base_url.trim_end_matches('/').to_string(),
            settings,
        }),
        ProviderKind::Ollama => Box::new(OllamaChat {
            url: config.ollama_url.trim_end_matches('/').to_string(),
            settings,
        }),
    })
}

fn env_key(names: &[&'static str]) -> Result<String, LlmError> {
    names
        .iter()
        .find_map(|n| std::env::var(n).ok().filter(|v| !v.trim().is_empty()))
        .ok_or(LlmError::MissingApiKey(names[0]))
}

struct Settings {
    model: String,
    temperature: f32,
    max_output_tokens: u32,
    max_retries: u32,
    client: reqwest::Client,
}

/// Offline answers made of the best passages, quoted with citations.
pub struct Extractive {
    name: String,
}

impl Extractive {
    pub fn new() -> Self {
        Self {
            name: "extractive".to_string(),
        }
    }
}

impl Default for Extractive {
    fn default() -> Self {
        Self::new()
    }
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXTRACTIVE_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(EXTRACTIVE_CHARS).collect();
    match cut.rfind(' ') {
        Some(i) => format!("{}...", &cut[..i]),
        None => format!("{}...", cut),
    }
}

#[async_trait]
impl LanguageModel for Extractive {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &Completion<'_>) -> Result<String, LlmError> {
        if request.passages.is_empty() {
            return Err(LlmError::EmptyResponse {
                provider: "extractive",
            });
        }
        let mut out = String::from("From your documents:\n");
        for (i, p) in request.passages.iter().take(EXTRACTIVE_PASSAGES).enumerate() {
            out.push_str(&format!("\n[{}] {}: {}\n", i + 1, p.label(), excerpt(&p.text)));
        }
        Ok(out.trim_end().to_string())
    }
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn non_empty(text: Option<&str>, provider: &'static str) -> Result<String, LlmError> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or(LlmError::EmptyResponse { provider })
}

pub struct OpenAiChat {
    api_key: String,
    base_url: String,
    settings: Settings,
}

#[async_trait]
impl LanguageModel for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, request: &Completion<'_>) -> Result<String, LlmError> {
        let messages: Vec<_> = request
            .messages
            .iter()
            .map(|m| json!({ "role": role_name(m.role), "content": m.content }))
            .collect();
        let body = json!({
            "model": self.settings.model,
            "messages": messages,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_output_tokens,
        });
        let endpoint = format!("{}/chat/completions", self.base_url);

        let json = http::send_json("OpenAI", self.settings.max_retries, || {
            self.settings
                .client
                .post(&endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await
        .map_err(|e| LlmError::from_http("OpenAI", e))?;

        parse_openai(&json)
    }
}

fn parse_openai(json: &serde_json::Value) -> Result<String, LlmError> {
    non_empty(
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str()),
        "OpenAI",
    )
}

pub struct Gemini {
    api_key: String,
    base_url: String,
    settings: Settings,
}

/// Gemini takes the system prompt separately and calls the assistant `model`.
fn gemini_body(messages: &[ChatMessage], temperature: f32, max_tokens: u32) -> serde_json::Value {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect();
    let contents: Vec<_> = messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|m| {
            let role = if m.role == MessageRole::Assistant {
                "model"
            } else {
                "user"
            };
            json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect();

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": temperature,
            "maxOutputTokens": max_tokens,
        },
    });
    if !system.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
    }
    body
}

fn parse_gemini(json: &serde_json::Value) -> Result<String, LlmError> {
    let text = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        });
    non_empty(text.as_deref(), "Gemini")
}

#[async_trait]
impl LanguageModel for Gemini {
    fn model_name(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, request: &Completion<'_>) -> Result<String, LlmError> {
        let body = gemini_body(
            request.messages,
            self.settings.temperature,
            self.settings.max_output_tokens,
        );
        let endpoint = format!(
            "{}/models/{}:generateContent",
            self.base_url, self.settings.model
        );

        let json = http::send_json("Gemini", self.settings.max_retries, || {
            self.settings
                .client
                .post(&endpoint)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
        })
        .await
        .map_err(|e| LlmError::from_http("Gemini", e))?;

        parse_gemini(&json)
    }
}

pub struct OllamaChat {
    url: String,
    settings: Settings,
}

#[async_trait]
impl LanguageModel for OllamaChat {
    fn model_name(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, request: &Completion<'_>) -> Result<String, LlmError> {
        let messages: Vec<_> = request
            .messages
            .iter()
            .map(|m| json!({ "role": role_name(m.role), "content": m.content }))
            .collect();
        let body = json!({
            "model": self.settings.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": self.settings.temperature,
                "num_predict": self.settings.max_output_tokens,
            },
        });
        let endpoint = format!("{}/api/chat", self.url);

        let json = http::send_json("Ollama", self.settings.max_retries, || {
            self.settings.client.post(&endpoint).json(&body)
        })
        .await
        .map_err(|e| LlmError::from_http("Ollama", e))?;

        non_empty(
            json.pointer("/message/content").and_then(|c| c.as_str()),
            "Ollama",
        )
    }
}
