//! Provider selection with fail-over and retry.
//!
//! # Algorithm
//! For each attempt the selector walks the preference order and takes the
//! first provider that is not marked down and for which the user has a key
//! passing the vendor's format check. The call runs under a deadline; any
//! error counts against that provider and, if attempts remain, the selector
//! sleeps `2^attempt` backoff units before trying again (possibly on a
//! different provider).
//!
//! Provider health lives in this struct, behind a mutex, so several workers
//! can share one selector.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

use super::{
    AnthropicClient, ChatMessage, ChatOptions, GoogleClient, LlmClient, LlmError, OpenAiClient,
    ProviderKind, TokenUsage,
};
use crate::credentials::CredentialResolver;
use crate::queue::backoff_delay;

/// Tunables for [`ProviderSelector`].
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Preference order; earlier providers win.
    pub order: Vec<ProviderKind>,
    /// Attempts per request when the caller does not override it.
    pub retries: u32,
    /// Deadline for a single provider call.
    pub timeout: Duration,
    /// Consecutive failures before a provider is marked unavailable.
    pub failure_threshold: u32,
    /// How long an unavailable provider is skipped before it may be probed again.
    pub cooldown: Duration,
    /// Backoff unit; the sleep after attempt `n` is `2^n` units.
    pub backoff_unit: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            order: ProviderKind::ALL.to_vec(),
            retries: 3,
            timeout: Duration::from_secs(30),
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),
            backoff_unit: Duration::from_secs(1),
        }
    }
}

/// Per-provider health, advisory only.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub available: bool,
    pub last_check: DateTime<Utc>,
    pub error_count: u32,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            available: true,
            last_check: Utc::now(),
            error_count: 0,
        }
    }

    /// A down provider becomes selectable again once the cool-down has passed.
    fn is_selectable(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        if self.available {
            return true;
        }
        let elapsed = now.signed_duration_since(self.last_check);
        elapsed
            .to_std()
            .map(|elapsed| elapsed >= cooldown)
            .unwrap_or(false)
    }
}

/// One request through the selector.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub user_id: Uuid,
    pub prompt: String,
    pub system: Option<String>,
    /// Overrides the user's preferred model on whichever provider is chosen.
    pub model: Option<String>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl CompletionRequest {
    pub fn new(user_id: Uuid, prompt: impl Into<String>) -> Self {
        Self {
            user_id,
            prompt: prompt.into(),
            system: None,
            model: None,
            max_tokens: None,
            temperature: None,
            timeout: None,
            retries: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(self.prompt.clone()));
        messages
    }
}

/// A successful completion, tagged with who served it.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub provider: ProviderKind,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No provider has both a usable key and an available status.
    NoAvailableProviders,
    /// Every attempt failed.
    Exhausted,
}

/// Structured failure returned instead of a panic or a bare error string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (error id: {error_id})")]
pub struct FailoverError {
    /// Correlation id for support escalation; also logged.
    pub error_id: Uuid,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
    pub last_error: Option<LlmError>,
}

impl FailoverError {
    fn no_providers(attempts: u32, last_error: Option<LlmError>) -> Self {
        Self {
            error_id: Uuid::new_v4(),
            kind: FailureKind::NoAvailableProviders,
            message: "No available providers: configure an API key for at least one provider"
                .to_string(),
            attempts,
            last_error,
        }
    }

    fn exhausted(attempts: u32, last_error: LlmError) -> Self {
        Self {
            error_id: Uuid::new_v4(),
            kind: FailureKind::Exhausted,
            message: format!("All {} attempts failed; last error: {}", attempts, last_error),
            attempts,
            last_error: Some(last_error),
        }
    }
}

/// Builds a vendor adapter for a key.
pub trait ClientFactory: Send + Sync {
    fn create(&self, provider: ProviderKind, api_key: &str) -> Result<Arc<dyn LlmClient>, LlmError>;
}

/// Builds the real HTTP adapters, sharing one connection pool.
#[derive(Clone, Default)]
pub struct HttpClientFactory {
    client: Client,
    base_urls: HashMap<ProviderKind, String>,
}

impl HttpClientFactory {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_urls: HashMap::new(),
        }
    }

    /// Point a provider at a different endpoint (proxies, compatible gateways).
    pub fn with_base_url(mut self, provider: ProviderKind, url: impl Into<String>) -> Self {
        self.base_urls.insert(provider, url.into());
        self
    }
}

impl ClientFactory for HttpClientFactory {
    fn create(&self, provider: ProviderKind, api_key: &str) -> Result<Arc<dyn LlmClient>, LlmError> {
        let client = self.client.clone();
        let base_url = self.base_urls.get(&provider).cloned();
        let adapter: Arc<dyn LlmClient> = match provider {
            ProviderKind::OpenAi => {
                let c = OpenAiClient::new(client, api_key)?;
                Arc::new(match base_url {
                    Some(url) => c.with_base_url(url),
                    None => c,
                })
            }
            ProviderKind::OpenRouter => {
                let c = OpenAiClient::openrouter(client, api_key)?;
                Arc::new(match base_url {
                    Some(url) => c.with_base_url(url),
                    None => c,
                })
            }
            ProviderKind::Anthropic => {
                let c = AnthropicClient::new(client, api_key)?;
                Arc::new(match base_url {
                    Some(url) => c.with_base_url(url),
                    None => c,
                })
            }
            ProviderKind::Google => {
                let c = GoogleClient::new(client, api_key)?;
                Arc::new(match base_url {
                    Some(url) => c.with_base_url(url),
                    None => c,
                })
            }
        };
        Ok(adapter)
    }
}

/// Chooses a provider, executes, and fails over.
pub struct ProviderSelector {
    credentials: Arc<dyn CredentialResolver>,
    factory: Arc<dyn ClientFactory>,
    config: FailoverConfig,
    health: Mutex<HashMap<ProviderKind, ProviderHealth>>,
}

impl ProviderSelector {
    pub fn new(
        credentials: Arc<dyn CredentialResolver>,
        factory: Arc<dyn ClientFactory>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            credentials,
            factory,
            config,
            health: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    fn with_health<R>(&self, f: impl FnOnce(&mut HashMap<ProviderKind, ProviderHealth>) -> R) -> R {
        let mut guard = self.health.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn is_selectable(&self, provider: ProviderKind) -> bool {
        let now = Utc::now();
        self.with_health(|health| {
            health
                .get(&provider)
                .map_or(true, |h| h.is_selectable(now, self.config.cooldown))
        })
    }

    /// Reset a provider to available after a successful call.
    pub fn record_success(&self, provider: ProviderKind) {
        self.with_health(|health| {
            let entry = health.entry(provider).or_insert_with(ProviderHealth::new);
            entry.available = true;
            entry.error_count = 0;
            entry.last_check = Utc::now();
        });
    }

    /// Count a failure; marks the provider down at the threshold.
    pub fn record_failure(&self, provider: ProviderKind) {
        let threshold = self.config.failure_threshold.max(1);
        let marked_down = self.with_health(|health| {
            let entry = health.entry(provider).or_insert_with(ProviderHealth::new);
            entry.error_count = entry.error_count.saturating_add(1);
            entry.last_check = Utc::now();
            let was_available = entry.available;
            if entry.error_count >= threshold {
                entry.available = false;
            }
            was_available && !entry.available
        });
        if marked_down {
            tracing::warn!(provider = %provider, "Provider marked unavailable after repeated failures");
        }
    }

    /// Snapshot of provider health in preference order.
    pub fn status(&self) -> Vec<(ProviderKind, ProviderHealth)> {
        self.with_health(|health| {
            self.config
                .order
                .iter()
                .map(|p| (*p, health.get(p).cloned().unwrap_or_else(ProviderHealth::new)))
                .collect()
        })
    }

    /// Forget everything known about a provider.
    pub fn reset_provider(&self, provider: ProviderKind) {
        self.with_health(|health| {
            health.remove(&provider);
        });
    }

    /// First provider with a usable key and a selectable status.
    ///
    /// A lookup error or a key that fails the vendor's format check counts
    /// as "no key"; the walk continues with the next provider.
    pub async fn select_provider(&self, user_id: Uuid) -> Option<(ProviderKind, String)> {
        for provider in &self.config.order {
            if !self.is_selectable(*provider) {
                tracing::debug!(provider = %provider, "Skipping unavailable provider");
                continue;
            }
            let key = match self.credentials.get_key(user_id, *provider).await {
                Ok(Some(key)) => key,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(provider = %provider, user_id = %user_id, "Credential lookup failed: {}", e);
                    continue;
                }
            };
            if !provider.is_valid_key(&key) {
                tracing::debug!(provider = %provider, user_id = %user_id, "Ignoring malformed API key");
                continue;
            }
            return Some((*provider, key.trim().to_string()));
        }
        None
    }

    /// Execute a completion with fail-over.
    pub async fn execute(&self, request: &CompletionRequest) -> Result<CompletionResult, FailoverError> {
        let retries = request.retries.unwrap_or(self.config.retries).max(1);
        let timeout = request.timeout.unwrap_or(self.config.timeout);
        let messages = request.messages();
        let options = ChatOptions {
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut last_error: Option<LlmError> = None;

        for attempt in 1..=retries {
            let Some((provider, api_key)) = self.select_provider(request.user_id).await else {
                let err = FailoverError::no_providers(attempt - 1, last_error);
                tracing::error!(
                    error_id = %err.error_id,
                    user_id = %request.user_id,
                    attempt,
                    "No available providers"
                );
                return Err(err);
            };

            let model = match &request.model {
                Some(model) => model.clone(),
                None => self.credentials.resolve_model(request.user_id, provider).await,
            };

            tracing::debug!(provider = %provider, model = %model, attempt, "Executing completion");

            let outcome = match self.factory.create(provider, &api_key) {
                Ok(client) => {
                    match tokio::time::timeout(
                        timeout,
                        client.chat_completion(&model, &messages, &options),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(LlmError::timeout(timeout)),
                    }
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(response) => {
                    self.record_success(provider);
                    if attempt > 1 {
                        tracing::info!(provider = %provider, attempt, "Completion succeeded after retry");
                    }
                    return Ok(CompletionResult {
                        content: response.content,
                        usage: response.usage,
                        provider,
                        model: response.model,
                    });
                }
                Err(error) => {
                    self.record_failure(provider);
                    tracing::warn!(
                        provider = %provider,
                        attempt,
                        retries,
                        transient = error.is_transient(),
                        "Provider call failed: {}",
                        error
                    );
                    last_error = Some(error);
                }
            }

            if attempt < retries {
                let mut delay = backoff_delay(attempt, self.config.backoff_unit);
                // A server-suggested wait is a floor, capped at the cool-down.
                if let Some(retry_after) = last_error.as_ref().and_then(|e| e.retry_after) {
                    delay = delay.max(retry_after.min(self.config.cooldown));
                }
                tokio::time::sleep(delay).await;
            }
        }

        let last = last_error.unwrap_or_else(|| LlmError::network_error("no attempt made".to_string()));
        let err = FailoverError::exhausted(retries, last);
        tracing::error!(
            error_id = %err.error_id,
            user_id = %request.user_id,
            "Completion failed: {}",
            err.message
        );
        Err(err)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::credentials::InMemoryCredentials;

    async fn selector_with(
        keys: &[(ProviderKind, &str)],
        config: FailoverConfig,
    ) -> (ProviderSelector, Arc<ScriptedFactory>, Uuid) {
        let user = Uuid::new_v4();
        let creds = Arc::new(InMemoryCredentials::new());
        for (provider, key) in keys {
            creds.set(user, *provider, *key, None).await;
        }
        let factory = Arc::new(ScriptedFactory::default());
        let selector = ProviderSelector::new(creds, factory.clone(), config);
        (selector, factory, user)
    }

    fn server_error() -> Scripted {
        Scripted::Fail(LlmError::server_error(503, "overloaded".to_string()))
    }

    #[tokio::test]
    async fn test_no_credentials_fails_fast() {
        let (selector, factory, user) = selector_with(&[], fast_config()).await;
        let err = selector
            .execute(&CompletionRequest::new(user, "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::NoAvailableProviders);
        assert_eq!(err.attempts, 0);
        assert!(factory.calls().is_empty());
        assert!(err.to_string().contains(&err.error_id.to_string()));
    }

    #[tokio::test]
    async fn test_malformed_key_is_treated_as_absent() {
        let (selector, factory, user) = selector_with(
            &[(ProviderKind::OpenAi, "not-a-key"), (ProviderKind::Anthropic, ANTHROPIC_KEY)],
            fast_config(),
        )
        .await;
        let result = selector.execute(&CompletionRequest::new(user, "hi")).await.unwrap();
        assert_eq!(result.provider, ProviderKind::Anthropic);
        assert_eq!(result.model, ProviderKind::Anthropic.default_model());
        assert_eq!(factory.calls(), vec![ProviderKind::Anthropic]);
    }

    #[tokio::test]
    async fn test_failing_provider_is_skipped_after_threshold() {
        let (selector, factory, user) = selector_with(
            &[(ProviderKind::OpenAi, OPENAI_KEY), (ProviderKind::Anthropic, ANTHROPIC_KEY)],
            fast_config(),
        )
        .await;
        for _ in 0..3 {
            factory.push(ProviderKind::OpenAi, server_error());
        }

        let err = selector
            .execute(&CompletionRequest::new(user, "first"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Exhausted);
        assert_eq!(err.attempts, 3);

        let openai = selector
            .status()
            .into_iter()
            .find(|(p, _)| *p == ProviderKind::OpenAi)
            .unwrap()
            .1;
        assert!(!openai.available);
        assert_eq!(openai.error_count, 3);

        let result = selector.execute(&CompletionRequest::new(user, "second")).await.unwrap();
        assert_eq!(result.provider, ProviderKind::Anthropic);
        assert_eq!(
            factory.calls(),
            vec![
                ProviderKind::OpenAi,
                ProviderKind::OpenAi,
                ProviderKind::OpenAi,
                ProviderKind::Anthropic
            ]
        );
    }

    #[tokio::test]
    async fn test_success_resets_error_count() {
        let (selector, factory, user) =
            selector_with(&[(ProviderKind::OpenAi, OPENAI_KEY)], fast_config()).await;
        factory.push(ProviderKind::OpenAi, server_error());
        factory.push(ProviderKind::OpenAi, server_error());
        factory.push(ProviderKind::OpenAi, Scripted::Reply("done".to_string()));

        let result = selector.execute(&CompletionRequest::new(user, "hi")).await.unwrap();
        assert_eq!(result.content, "done");
        assert_eq!(result.usage.unwrap().total_tokens, Some(2));

        let (_, health) = selector.status().into_iter().next().unwrap();
        assert!(health.available);
        assert_eq!(health.error_count, 0);
    }

    #[tokio::test]
    async fn test_retry_after_is_a_floor_on_backoff() {
        let (selector, factory, user) =
            selector_with(&[(ProviderKind::OpenAi, OPENAI_KEY)], fast_config()).await;
        factory.push(
            ProviderKind::OpenAi,
            Scripted::Fail(LlmError::rate_limited(
                "slow down".to_string(),
                Some(Duration::from_millis(60)),
            )),
        );
        factory.push(ProviderKind::OpenAi, Scripted::Reply("done".to_string()));

        let started = std::time::Instant::now();
        let result = selector.execute(&CompletionRequest::new(user, "hi")).await.unwrap();
        assert_eq!(result.content, "done");
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_retry_after_is_capped_by_cooldown() {
        let config = FailoverConfig {
            cooldown: Duration::from_millis(10),
            ..fast_config()
        };
        let (selector, factory, user) =
            selector_with(&[(ProviderKind::OpenAi, OPENAI_KEY)], config).await;
        factory.push(
            ProviderKind::OpenAi,
            Scripted::Fail(LlmError::rate_limited(
                "come back tomorrow".to_string(),
                Some(Duration::from_secs(86_400)),
            )),
        );

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            selector.execute(&CompletionRequest::new(user, "hi")),
        )
        .await
        .expect("retry-after must not stall the selector")
        .unwrap();
        assert_eq!(result.content, "ok");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let (selector, factory, user) =
            selector_with(&[(ProviderKind::OpenAi, OPENAI_KEY)], fast_config()).await;
        factory.push(ProviderKind::OpenAi, Scripted::Hang(Duration::from_secs(5)));

        let mut request = CompletionRequest::new(user, "hi");
        request.timeout = Some(Duration::from_millis(20));
        request.retries = Some(1);

        let err = selector.execute(&request).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Exhausted);
        assert_eq!(
            err.last_error.map(|e| e.kind),
            Some(crate::llm::LlmErrorKind::Timeout)
        );
    }

    #[tokio::test]
    async fn test_down_provider_is_probed_after_cooldown() {
        let config = FailoverConfig {
            cooldown: Duration::ZERO,
            failure_threshold: 1,
            ..fast_config()
        };
        let (selector, factory, user) =
            selector_with(&[(ProviderKind::OpenAi, OPENAI_KEY)], config).await;
        factory.push(ProviderKind::OpenAi, server_error());

        let mut request = CompletionRequest::new(user, "hi");
        request.retries = Some(2);
        let result = selector.execute(&request).await.unwrap();
        assert_eq!(result.provider, ProviderKind::OpenAi);
        assert_eq!(factory.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_all_providers_down_reports_no_providers() {
        let config = FailoverConfig {
            failure_threshold: 1,
            ..fast_config()
        };
        let (selector, factory, user) =
            selector_with(&[(ProviderKind::OpenAi, OPENAI_KEY)], config).await;
        factory.push(ProviderKind::OpenAi, server_error());

        let err = selector
            .execute(&CompletionRequest::new(user, "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::NoAvailableProviders);
        assert_eq!(err.attempts, 1);
        assert!(err.last_error.is_some());

        selector.reset_provider(ProviderKind::OpenAi);
        assert!(selector.execute(&CompletionRequest::new(user, "hi")).await.is_ok());
    }
}
