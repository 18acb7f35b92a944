//! Credential lookup for provider API keys.
//!
//! Decryption and storage of user keys live outside this crate; the core only
//! needs "give me a usable key and a preferred model for (user, provider)".

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::llm::ProviderKind;

/// Resolves decrypted API keys and model preferences per user.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Decrypted API key, or `None` when the user has not configured one.
    async fn get_key(&self, user_id: Uuid, provider: ProviderKind) -> anyhow::Result<Option<String>>;

    /// The user's preferred model for this provider, if any.
    async fn get_preferred_model(
        &self,
        user_id: Uuid,
        provider: ProviderKind,
    ) -> anyhow::Result<Option<String>>;

    /// Preferred model with the provider's default as fallback.
    async fn resolve_model(&self, user_id: Uuid, provider: ProviderKind) -> String {
        match self.get_preferred_model(user_id, provider).await {
            Ok(Some(model)) if !model.trim().is_empty() => model,
            Ok(_) => provider.default_model().to_string(),
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    provider = %provider,
                    "Failed to load preferred model, using default: {}",
                    e
                );
                provider.default_model().to_string()
            }
        }
    }
}

#[derive(Debug, Clone)]
struct StoredCredential {
    api_key: String,
    model: Option<String>,
}

/// In-memory resolver keyed by (user, provider).
#[derive(Debug, Default)]
pub struct InMemoryCredentials {
    entries: RwLock<HashMap<(Uuid, ProviderKind), StoredCredential>>,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(
        &self,
        user_id: Uuid,
        provider: ProviderKind,
        api_key: impl Into<String>,
        model: Option<String>,
    ) {
        let mut entries = self.entries.write().await;
        entries.insert(
            (user_id, provider),
            StoredCredential {
                api_key: api_key.into(),
                model,
            },
        );
    }

    pub async fn remove(&self, user_id: Uuid, provider: ProviderKind) -> bool {
        self.entries.write().await.remove(&(user_id, provider)).is_some()
    }
}

#[async_trait]
impl CredentialResolver for InMemoryCredentials {
    async fn get_key(&self, user_id: Uuid, provider: ProviderKind) -> anyhow::Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(user_id, provider)).map(|c| c.api_key.clone()))
    }

    async fn get_preferred_model(
        &self,
        user_id: Uuid,
        provider: ProviderKind,
    ) -> anyhow::Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(user_id, provider)).and_then(|c| c.model.clone()))
    }
}

/// Single-tenant resolver that serves the same keys to every user.
///
/// Keys come from `OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, `GOOGLE_API_KEY` and
/// `OPENROUTER_API_KEY`; models from the matching `*_MODEL` variables.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentials {
    keys: HashMap<ProviderKind, String>,
    models: HashMap<ProviderKind, String>,
}

impl EnvCredentials {
    pub fn from_env() -> Self {
        let mut creds = Self::default();
        for provider in ProviderKind::ALL {
            let prefix = provider.as_str().to_ascii_uppercase();
            if let Ok(key) = std::env::var(format!("{}_API_KEY", prefix)) {
                if !key.trim().is_empty() {
                    creds.keys.insert(provider, key);
                }
            }
            if let Ok(model) = std::env::var(format!("{}_MODEL", prefix)) {
                creds.models.insert(provider, model);
            }
        }
        tracing::info!(
            providers = ?creds.keys.keys().map(|p| p.as_str()).collect::<Vec<_>>(),
            "Loaded provider keys from environment"
        );
        creds
    }
}

#[async_trait]
impl CredentialResolver for EnvCredentials {
    async fn get_key(&self, _user_id: Uuid, provider: ProviderKind) -> anyhow::Result<Option<String>> {
        Ok(self.keys.get(&provider).cloned())
    }

    async fn get_preferred_model(
        &self,
        _user_id: Uuid,
        provider: ProviderKind,
    ) -> anyhow::Result<Option<String>> {
        Ok(self.models.get(&provider).cloned())
    }
}
