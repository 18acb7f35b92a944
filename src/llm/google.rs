//! Google Gemini `generateContent` client.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::error::{parse_retry_after, LlmError};
use super::{guard_api_key, ChatMessage, ChatOptions, ChatResponse, LlmClient, Role, TokenUsage};

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GoogleClient {
    pub fn new(client: Client, api_key: &str) -> Result<Self, LlmError> {
        Ok(Self {
            client,
            api_key: guard_api_key(api_key)?,
            base_url: GEMINI_API_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Gemini calls the assistant role "model" and carries system text
    /// separately in `systemInstruction`.
    fn build_request_body(messages: &[ChatMessage], options: &ChatOptions) -> serde_json::Value {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let contents: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                serde_json::json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut generation_config = serde_json::Map::new();
        if let Some(t) = options.temperature {
            generation_config.insert("temperature".to_string(), serde_json::json!(t));
        }
        if let Some(max) = options.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), serde_json::json!(max));
        }

        let mut body = serde_json::json!({ "contents": contents });
        if !generation_config.is_empty() {
            body["generationConfig"] = serde_json::Value::Object(generation_config);
        }
        if !system.is_empty() {
            body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system.join("\n") }] });
        }
        body
    }

    fn parse_response(body: &str, model: &str) -> Result<ChatResponse, LlmError> {
        let parsed: GeminiResponse = serde_json::from_str(body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::parse_error("No candidates in response".to_string()))?;

        let content: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(LlmError::parse_error(
                "Candidate has no text parts".to_string(),
            ));
        }

        Ok(ChatResponse {
            content,
            usage: parsed.usage_metadata.map(|u| TokenUsage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            }),
            model: parsed.model_version.unwrap_or_else(|| model.to_string()),
            finish_reason: candidate.finish_reason,
        })
    }
}

#[async_trait]
impl LlmClient for GoogleClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let body = Self::build_request_body(messages, options);

        tracing::debug!(model = %model, "Sending request to Gemini");

        let response = self
            .client
            .post(format!("{}/models/{}:generateContent", self.base_url, model))
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &text, retry_after));
        }

        Self::parse_response(&text, model)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
    #[serde(default)]
    total_token_count: Option<u64>,
}
