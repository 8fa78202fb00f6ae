//! Reasoning capability
//!
//! Agents only see the `Reasoner` trait: a prompt goes in, text comes out,
//! latency is unbounded and the call may fail. Callers bound every call with
//! their own timeout and fall back deterministically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use twenty_core::{GameError, Result};

/// Two-part chat prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Text completion backend
#[async_trait]
pub trait Reasoner: Send + Sync + 'static {
    /// Complete `prompt`, producing at most `max_tokens` tokens
    async fn complete(&self, prompt: &Prompt, max_tokens: u32) -> Result<String>;
}

/// Connection settings for an OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct ReasonerConfig {
    pub model: String,
    /// Base URL, e.g. `http://localhost:11434/v1`
    pub url: String,
    pub api_key: String,
    pub temperature: f32,
    /// Upper bound on one HTTP exchange
    pub request_timeout: Duration,
}

impl ReasonerConfig {
    /// Read `LLM_MODEL`, `LLM_URL` and `LLM_API_KEY` from the environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Missing or blank variables
    /// are a configuration error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    GameError::ConfigError(format!(
                        "{} is not set (required: LLM_MODEL, LLM_URL, LLM_API_KEY)",
                        key
                    ))
                })
        };

        Ok(Self {
            model: required("LLM_MODEL")?,
            url: required("LLM_URL")?,
            api_key: required("LLM_API_KEY")?,
            temperature: 1.0,
            request_timeout: Duration::from_secs(60),
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for OpenAI-compatible servers
#[derive(Debug, Clone)]
pub struct OpenAiCompatible {
    client: reqwest::Client,
    config: ReasonerConfig,
    endpoint: String,
}

impl OpenAiCompatible {
    pub fn new(config: ReasonerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GameError::ConfigError(format!("HTTP client: {}", e)))?;
        let endpoint = completions_url(&config.url);

        Ok(Self {
            client,
            config,
            endpoint,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn completions_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    }
}

#[async_trait]
impl Reasoner for OpenAiCompatible {
    async fn complete(&self, prompt: &Prompt, max_tokens: u32) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GameError::ReasoningError(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GameError::ReasoningError(format!("HTTP {}: {}", status, body)));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| GameError::ReasoningError(format!("invalid response: {}", e)))?;

        let text = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .ok_or_else(|| GameError::ReasoningError("response had no content".into()))?;

        debug!(model = %self.config.model, max_tokens, "Reasoner replied: {}", text);
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_config_requires_all_variables() {
        let env = vars(&[("LLM_MODEL", "llama3.2"), ("LLM_URL", "http://localhost:11434/v1")]);
        let err = ReasonerConfig::from_lookup(|k| env.get(k).cloned()).unwrap_err();
        assert!(matches!(err, GameError::ConfigError(ref m) if m.contains("LLM_API_KEY")));

        let env = vars(&[
            ("LLM_MODEL", "llama3.2"),
            ("LLM_URL", "http://localhost:11434/v1"),
            ("LLM_API_KEY", "ollama"),
        ]);
        let config = ReasonerConfig::from_lookup(|k| env.get(k).cloned()).unwrap();
        assert_eq!(config.model, "llama3.2");
        assert_eq!(config.temperature, 1.0);
    }

    #[test]
    fn test_blank_variable_is_missing() {
        let env = vars(&[("LLM_MODEL", " "), ("LLM_URL", "u"), ("LLM_API_KEY", "k")]);
        assert!(ReasonerConfig::from_lookup(|k| env.get(k).cloned()).is_err());
    }

    #[test]
    fn test_completions_url() {
        assert_eq!(
            completions_url("http://localhost:11434/v1/"),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(
            completions_url("https://example.openai.azure.com"),
            "https://example.openai.azure.com/v1/chat/completions"
        );
        assert_eq!(
            completions_url("http://h/v1/chat/completions"),
            "http://h/v1/chat/completions"
        );
    }
}
