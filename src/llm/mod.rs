//! LLM client module for interacting with external model providers.
//!
//! This module provides a trait-based abstraction over vendor APIs. Each
//! adapter formats its own request body and headers and maps the vendor's
//! response envelope onto the canonical [`ChatResponse`].
//!
//! [`ProviderSelector`] sits on top of the adapters and handles provider
//! choice, fail-over and retry.

mod anthropic;
mod error;
pub mod failover;
mod google;
mod openai;

pub use anthropic::AnthropicClient;
pub use error::{classify_http_status, LlmError, LlmErrorKind};
pub use failover::{
    ClientFactory, CompletionRequest, CompletionResult, FailoverConfig, FailoverError,
    FailureKind, HttpClientFactory, ProviderHealth, ProviderSelector,
};
pub use google::GoogleClient;
pub use openai::OpenAiClient;

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Supported vendor APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    OpenRouter,
}

impl ProviderKind {
    /// Default preference order.
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Google,
        ProviderKind::OpenRouter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::OpenRouter => "openrouter",
        }
    }

    /// Model used when the user has not picked one.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Anthropic => "claude-3-5-haiku-latest",
            Self::Google => "gemini-1.5-flash",
            Self::OpenRouter => "openai/gpt-4o-mini",
        }
    }

    fn key_prefix(&self) -> &'static str {
        match self {
            Self::OpenAi => "sk-",
            Self::Anthropic => "sk-ant-",
            Self::Google => "AIza",
            Self::OpenRouter => "sk-or-",
        }
    }

    fn min_key_len(&self) -> usize {
        match self {
            Self::Google => 39,
            _ => 20,
        }
    }

    /// Vendor-specific sanity check of an API key.
    ///
    /// A key that fails this check is treated as absent by the selector.
    pub fn is_valid_key(&self, key: &str) -> bool {
        let key = key.trim();
        if key.len() < self.min_key_len() || !key.starts_with(self.key_prefix()) {
            return false;
        }
        // An OpenAI key must not be an Anthropic or OpenRouter key in disguise.
        if *self == Self::OpenAi && (key.starts_with("sk-ant-") || key.starts_with("sk-or-")) {
            return false;
        }
        key_charset().is_match(key)
    }
}

fn key_charset() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-]+$").expect("static regex"))
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "google" | "gemini" => Ok(Self::Google),
            "openrouter" => Ok(Self::OpenRouter),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

/// Token usage information (if provided by the upstream provider).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
            total_tokens: Some(prompt_tokens.saturating_add(completion_tokens)),
        }
    }
}

/// Canonical response from a chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Optional parameters for chat completions.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Sampling temperature (0 = deterministic).
    pub temperature: Option<f64>,
    /// Maximum output tokens to generate.
    pub max_tokens: Option<u64>,
}

/// One adapter per vendor API.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request.
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError>;
}

/// Reject credentials that would produce a malformed header.
pub(crate) fn guard_api_key(api_key: &str) -> Result<String, LlmError> {
    let key = api_key.trim();
    if key.is_empty() {
        return Err(LlmError::invalid_credential("API key is empty"));
    }
    if reqwest::header::HeaderValue::from_str(key).is_err() {
        return Err(LlmError::invalid_credential(
            "API key contains characters not allowed in a header",
        ));
    }
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("claude".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert_eq!(" gemini ".parse::<ProviderKind>().unwrap(), ProviderKind::Google);
        assert!("mistral".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(ProviderKind::OpenAi.is_valid_key("sk-proj-abcdefghijklmnopqrstuv"));
        assert!(!ProviderKind::OpenAi.is_valid_key("sk-short"));
        assert!(!ProviderKind::OpenAi.is_valid_key("sk-ant-REDACTED"));
        assert!(ProviderKind::Anthropic.is_valid_key("sk-ant-REDACTED"));
        assert!(!ProviderKind::Anthropic.is_valid_key("sk-proj-abcdefghijklmnopqrstuv"));
        assert!(ProviderKind::Google.is_valid_key("AIzaSyD-abcdefghijklmnopqrstuvwxyz012345"));
        assert!(!ProviderKind::OpenRouter.is_valid_key("sk-or-v1 has spaces in it ok"));
    }

    #[test]
    fn test_guard_api_key() {
        assert!(guard_api_key("   ").is_err());
        assert!(guard_api_key("bad\nkey").is_err());
        assert_eq!(guard_api_key(" sk-abc ").unwrap(), "sk-abc");
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(10, 5);
        assert_eq!(usage.total_tokens, Some(15));
    }
}
