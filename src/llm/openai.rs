//! OpenAI-compatible chat completions client.
//!
//! Serves both OpenAI itself and OpenRouter, which speaks the same wire
//! format behind a different base URL and a pair of attribution headers.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{parse_retry_after, LlmError};
use super::{guard_api_key, ChatMessage, ChatOptions, ChatResponse, LlmClient, TokenUsage};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1";

/// OpenAI-compatible API client.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    /// Extra headers OpenRouter uses for app attribution.
    attribution: Option<(String, String)>,
}

impl OpenAiClient {
    /// Create a client for api.openai.com.
    pub fn new(client: Client, api_key: &str) -> Result<Self, LlmError> {
        Ok(Self {
            client,
            api_key: guard_api_key(api_key)?,
            base_url: OPENAI_API_URL.to_string(),
            attribution: None,
        })
    }

    /// Create a client for openrouter.ai.
    pub fn openrouter(client: Client, api_key: &str) -> Result<Self, LlmError> {
        Ok(Self {
            client,
            api_key: guard_api_key(api_key)?,
            base_url: OPENROUTER_API_URL.to_string(),
            attribution: Some((
                "https://github.com/agentflow".to_string(),
                "agentflow".to_string(),
            )),
        })
    }

    /// Override the base URL (used for compatible gateways).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn build_request(model: &str, messages: &[ChatMessage], options: &ChatOptions) -> OpenAiRequest {
        OpenAiRequest {
            model: model.to_string(),
            messages: messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        }
    }

    fn parse_response(body: &str, requested_model: &str) -> Result<ChatResponse, LlmError> {
        let parsed: OpenAiResponse = serde_json::from_str(body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;

        let content = choice
            .message
            .content
            .ok_or_else(|| LlmError::parse_error("Choice has no text content".to_string()))?;

        Ok(ChatResponse {
            content,
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            model: parsed.model.unwrap_or_else(|| requested_model.to_string()),
            finish_reason: choice.finish_reason,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let request = Self::build_request(model, messages, options);

        tracing::debug!(url = %self.base_url, model = %model, "Sending chat completion request");

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if let Some((referer, title)) = &self.attribution {
            builder = builder.header("HTTP-Referer", referer).header("X-Title", title);
        }

        let response = builder.json(&request).send().await?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &body, retry_after));
        }

        Self::parse_response(&body, model)
    }
}

/// Chat completions request body.
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

/// Usage block; some compatible gateways omit individual fields.
#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let messages = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let options = ChatOptions {
            temperature: Some(0.2),
            max_tokens: None,
        };
        let body = serde_json::to_value(OpenAiClient::build_request("gpt-4o", &messages, &options))
            .unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["temperature"], 0.2);
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_parse_response_with_and_without_usage() {
        let body = r#"{"model":"gpt-4o-2024","choices":[{"message":{"content":"hello"},"finish_reason":"stop"}],
            "usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#;
        let resp = OpenAiClient::parse_response(body, "gpt-4o").unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.model, "gpt-4o-2024");
        assert_eq!(resp.usage.unwrap().total_tokens, Some(5));

        let body = r#"{"choices":[{"message":{"content":"x"},"finish_reason":null}]}"#;
        let resp = OpenAiClient::parse_response(body, "gpt-4o").unwrap();
        assert_eq!(resp.model, "gpt-4o");
        assert!(resp.usage.is_none());
    }

    #[test]
    fn test_parse_response_rejects_empty_choices() {
        let err = OpenAiClient::parse_response(r#"{"choices":[]}"#, "m").unwrap_err();
        assert_eq!(err.kind, crate::llm::LlmErrorKind::ParseError);
    }

    #[test]
    fn test_rejects_empty_key() {
        assert!(OpenAiClient::new(Client::new(), "").is_err());
        assert!(OpenAiClient::openrouter(Client::new(), "sk-or-v1-abc").is_ok());
    }
}
