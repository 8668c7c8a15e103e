//! Model provider gateway: one trait, one HTTP implementation.
//!
//! The orchestrator only sees [`Gateway`]; transport differences between the
//! local runtime and remote APIs stay behind it. Typed failures are reported
//! as [`ProviderError`] inside `anyhow::Error` so callers can downcast.

use std::collections::BTreeMap;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::core::types::{ProviderError, ProviderId};
use crate::io::config::PatchloopConfig;

const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const XAI_BASE_URL: &str = "https://api.x.ai/v1";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Delay after asking the local runtime to unload before the next call.
const LOCAL_RESET_SETTLE: Duration = Duration::from_millis(800);

/// One generation call, provider-agnostic.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: Option<String>,
    /// Override the configured model for this call (e.g. the small local
    /// expansion model). `None` uses the provider's configured model.
    pub model: Option<String>,
}

/// Text generation boundary.
pub trait Gateway {
    fn generate(&self, provider: ProviderId, request: &GenerateRequest) -> Result<String>;
}

/// Environment variable holding a remote provider's API key.
pub fn credential_env(provider: ProviderId) -> Option<&'static str> {
    match provider {
        ProviderId::Ollama => None,
        ProviderId::Xai => Some("XAI_API_KEY"),
        ProviderId::OpenAi => Some("OPENAI_API_KEY"),
        ProviderId::Anthropic => Some("ANTHROPIC_API_KEY"),
    }
}

/// API key lookup: config `[credentials]` first, then the environment.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    overrides: BTreeMap<String, String>,
}

impl Credentials {
    pub fn from_config(cfg: &PatchloopConfig) -> Self {
        Self {
            overrides: cfg.credentials.clone(),
        }
    }

    pub fn key_for(&self, provider: ProviderId) -> Option<String> {
        if let Some(key) = self.overrides.get(provider.as_str()) {
            if !key.trim().is_empty() {
                return Some(key.clone());
            }
        }
        let var = credential_env(provider)?;
        std::env::var(var).ok().filter(|k| !k.trim().is_empty())
    }

    pub fn has_key(&self, provider: ProviderId) -> bool {
        self.key_for(provider).is_some()
    }
}

/// Blocking HTTP gateway over the local runtime and the remote chat APIs.
pub struct HttpGateway {
    client: reqwest::blocking::Client,
    credentials: Credentials,
    models: BTreeMap<ProviderId, String>,
}

impl HttpGateway {
    pub fn new(cfg: &PatchloopConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.provider_timeout_secs))
            .build()
            .context("build http client")?;
        let models = [
            ProviderId::Ollama,
            ProviderId::Xai,
            ProviderId::OpenAi,
            ProviderId::Anthropic,
        ]
        .into_iter()
        .map(|id| (id, cfg.model_for(id).to_string()))
        .collect();
        Ok(Self {
            client,
            credentials: Credentials::from_config(cfg),
            models,
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn model<'a>(&'a self, provider: ProviderId, request: &'a GenerateRequest) -> &'a str {
        match &request.model {
            Some(model) => model,
            None => &self.models[&provider],
        }
    }

    fn key_or_unavailable(&self, provider: ProviderId) -> Result<String> {
        self.credentials.key_for(provider).ok_or_else(|| {
            anyhow::Error::new(ProviderError::Unavailable {
                provider,
                message: format!(
                    "no API key (set {} or [credentials].{})",
                    credential_env(provider).unwrap_or("-"),
                    provider
                ),
            })
        })
    }

    fn generate_ollama(&self, request: &GenerateRequest) -> Result<String> {
        let provider = ProviderId::Ollama;
        reset_local_runtime(self.model(provider, request));
        let body = json!({
            "model": self.model(provider, request),
            "messages": chat_messages(request),
            "stream": false,
        });
        let response = self
            .client
            .post(format!("{OLLAMA_BASE_URL}/api/chat"))
            .json(&body)
            .send()
            .map_err(|e| connect_error(provider, e))?;
        let response = check_status(provider, response)?;
        let parsed: OllamaChatResponse = response
            .json()
            .with_context(|| format!("parse {provider} response"))?;
        non_empty(provider, parsed.message.content)
    }

    fn generate_openai_compatible(
        &self,
        provider: ProviderId,
        base_url: &str,
        request: &GenerateRequest,
    ) -> Result<String> {
        let key = self.key_or_unavailable(provider)?;
        let body = json!({
            "model": self.model(provider, request),
            "messages": chat_messages(request),
        });
        let response = self
            .client
            .post(format!("{base_url}/chat/completions"))
            .bearer_auth(key)
            .json(&body)
            .send()
            .map_err(|e| connect_error(provider, e))?;
        let response = check_status(provider, response)?;
        let parsed: ChatCompletionsResponse = response
            .json()
            .with_context(|| format!("parse {provider} response"))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        non_empty(provider, content)
    }

    fn generate_anthropic(&self, request: &GenerateRequest) -> Result<String> {
        let provider = ProviderId::Anthropic;
        let key = self.key_or_unavailable(provider)?;
        let mut body = json!({
            "model": self.model(provider, request),
            "max_tokens": 8192,
            "messages": [{"role": "user", "content": request.prompt}],
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        let response = self
            .client
            .post(format!("{ANTHROPIC_BASE_URL}/v1/messages"))
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .map_err(|e| connect_error(provider, e))?;
        let response = check_status(provider, response)?;
        let parsed: AnthropicResponse = response
            .json()
            .with_context(|| format!("parse {provider} response"))?;
        let content = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        non_empty(provider, content)
    }
}

impl Gateway for HttpGateway {
    #[instrument(skip_all, fields(provider = %provider))]
    fn generate(&self, provider: ProviderId, request: &GenerateRequest) -> Result<String> {
        debug!(prompt_bytes = request.prompt.len(), "provider call");
        match provider {
            ProviderId::Ollama => self.generate_ollama(request),
            ProviderId::Xai => self.generate_openai_compatible(provider, XAI_BASE_URL, request),
            ProviderId::OpenAi => {
                self.generate_openai_compatible(provider, OPENAI_BASE_URL, request)
            }
            ProviderId::Anthropic => self.generate_anthropic(request),
        }
    }
}

/// Call a provider with bounded retries and linear backoff.
///
/// Only provider-boundary failures are retried; anything else (e.g. a parse
/// failure) propagates immediately.
pub fn generate_with_retry<G: Gateway + ?Sized>(
    gateway: &G,
    provider: ProviderId,
    request: &GenerateRequest,
    retries: u32,
) -> Result<String> {
    let mut last_err = None;
    for attempt in 0..=retries {
        if attempt > 0 {
            thread::sleep(Duration::from_secs(attempt as u64));
        }
        match gateway.generate(provider, request) {
            Ok(text) => return Ok(text),
            Err(err) => {
                if err.downcast_ref::<ProviderError>().is_none() {
                    return Err(err);
                }
                warn!(attempt, err = %err, "provider call failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        anyhow::Error::new(ProviderError::Unavailable {
            provider,
            message: "no attempts made".to_string(),
        })
    }))
}

/// Ask the local runtime to unload the model so the next call starts clean.
///
/// Best effort: a missing or failing `ollama` binary is only logged, the
/// generation call itself will surface any real unavailability.
pub fn reset_local_runtime(model: &str) {
    match Command::new("ollama").args(["stop", model]).output() {
        Ok(output) if output.status.success() => {
            thread::sleep(LOCAL_RESET_SETTLE);
        }
        Ok(output) => {
            debug!(code = ?output.status.code(), "ollama stop reported failure");
        }
        Err(err) => {
            debug!(err = %err, "ollama binary not reachable for reset");
        }
    }
}

fn chat_messages(request: &GenerateRequest) -> serde_json::Value {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": request.prompt}));
    json!(messages)
}

fn connect_error(provider: ProviderId, err: reqwest::Error) -> anyhow::Error {
    anyhow::Error::new(ProviderError::Unavailable {
        provider,
        message: err.to_string(),
    })
}

fn check_status(
    provider: ProviderId,
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let detail = body.chars().take(400).collect::<String>();
    Err(anyhow::Error::new(ProviderError::Remote {
        provider,
        message: format!("HTTP {status}: {detail}"),
    }))
}

fn non_empty(provider: ProviderId, text: String) -> Result<String> {
    if text.trim().is_empty() {
        return Err(anyhow::Error::new(ProviderError::EmptyResponse {
            provider,
        }));
    }
    Ok(text)
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}
