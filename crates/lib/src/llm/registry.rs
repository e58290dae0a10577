//! Client registry: shared LLM client handles keyed by provider, logical name and the settings
//! the client is built with.
//!
//! Handles are reference counted explicitly. `acquire` creates the client on first use and
//! reuses it afterwards; `release` drops the registry's handle once the last holder is gone.

use crate::config::{self, PersonaConfig, ProviderKind};
use crate::llm::{LlmGateway, OllamaClient, OpenAiClient};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Identity of a shared client. Two personas share a client only when every field matches.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ClientKey {
    pub provider: ProviderKind,
    pub name: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// `f32::to_bits` of the temperature, so the key stays `Eq + Hash`.
    pub temperature_bits: Option<u32>,
}

impl ClientKey {
    pub fn new(provider: ProviderKind, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
            model: None,
            base_url: None,
            temperature_bits: None,
        }
    }

    pub fn for_persona(persona: &PersonaConfig) -> Self {
        let trimmed = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            model: trimmed(&persona.model),
            base_url: trimmed(&persona.base_url).map(|u| u.trim_end_matches('/').to_string()),
            temperature_bits: persona.temperature.map(f32::to_bits),
            ..Self::new(persona.provider, persona.name.trim())
        }
    }
}

struct Entry {
    client: Arc<dyn LlmGateway>,
    holders: usize,
    last_used: DateTime<Utc>,
}

/// Registry of live clients. Shared across the gateway.
pub struct ClientRegistry {
    inner: Arc<RwLock<HashMap<ClientKey, Entry>>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the client for `key`, creating it with `make` when absent. Each call must be paired with one `release`.
    pub async fn acquire_with<F>(&self, key: ClientKey, make: F) -> Arc<dyn LlmGateway>
    where
        F: FnOnce() -> Arc<dyn LlmGateway>,
    {
        let mut g = self.inner.write().await;
        let entry = g.entry(key.clone()).or_insert_with(|| {
            log::info!("llm registry: created {:?} client {}", key.provider, key.name);
            Entry {
                client: make(),
                holders: 0,
                last_used: Utc::now(),
            }
        });
        entry.holders += 1;
        entry.last_used = Utc::now();
        entry.client.clone()
    }

    /// Get or build the client described by a persona config.
    pub async fn acquire(&self, persona: &PersonaConfig) -> Arc<dyn LlmGateway> {
        let key = ClientKey::for_persona(persona);
        self.acquire_with(key, || build_client(persona)).await
    }

    /// Drop one hold on `key`. The registry forgets the client when no holders remain. Unknown keys are ignored.
    pub async fn release(&self, key: &ClientKey) {
        let mut g = self.inner.write().await;
        let remove = match g.get_mut(key) {
            Some(entry) => {
                entry.holders = entry.holders.saturating_sub(1);
                entry.holders == 0
            }
            None => false,
        };
        if remove {
            g.remove(key);
            log::info!("llm registry: removed {:?} client {}", key.provider, key.name);
        }
    }

    /// Live keys with their holder counts and last acquisition time.
    pub async fn active(&self) -> Vec<(ClientKey, usize, DateTime<Utc>)> {
        let g = self.inner.read().await;
        let mut out: Vec<_> = g
            .iter()
            .map(|(k, e)| (k.clone(), e.holders, e.last_used))
            .collect();
        out.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        out
    }
}

/// Build a client for a persona's provider settings.
pub fn build_client(persona: &PersonaConfig) -> Arc<dyn LlmGateway> {
    match persona.provider {
        ProviderKind::Ollama => Arc::new(OllamaClient::new(
            persona.base_url.clone(),
            persona.model.clone(),
            persona.temperature,
        )),
        ProviderKind::Openai => Arc::new(OpenAiClient::new(
            persona.base_url.clone(),
            config::resolve_api_key(persona),
            persona.model.clone(),
            persona.temperature,
        )),
    }
}
