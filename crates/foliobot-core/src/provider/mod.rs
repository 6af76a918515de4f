//! Cloud provider trait and failover client.
//!
//! Each vendor adapter hides its request/response shape behind the
//! [`Provider`] trait. The [`FailoverClient`] walks an ordered list of
//! adapters until one answers, so a single slow or broken vendor never
//! takes the chat feature down.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::ProvidersConfig;

/// Per-attempt timeout. A timeout is a final failure for that attempt,
/// never retried within the same provider.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed reply from the last-resort provider.
pub const MAINTENANCE_MESSAGE: &str = "The assistant model is down for maintenance right now. Please try again in a little while.";

/// Trait for cloud text-completion providers.
///
/// Implementations are stateless apart from configuration: a pure
/// function of prompt to text, modulo the network.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate a completion for the given prompt.
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;

    /// Provider identifier used in logs.
    fn name(&self) -> &str;
}

/// Last-resort provider: never fails, returns a fixed maintenance
/// message. Always present at the end of the failover list so the
/// client can never be empty and `call` is eventually terminating.
struct MaintenanceProvider;

#[async_trait]
impl Provider for MaintenanceProvider {
    async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
        Ok(MAINTENANCE_MESSAGE.to_string())
    }

    fn name(&self) -> &str {
        "maintenance"
    }
}

/// Sequential failover over an ordered provider list.
///
/// Providers are tried in configuration-time order, one at a time, each
/// bounded by [`ATTEMPT_TIMEOUT`]. The first success wins; later
/// providers are never contacted. Attempts are never raced in parallel,
/// preserving ordered fallback.
pub struct FailoverClient {
    providers: Vec<Box<dyn Provider>>,
    attempt_timeout: Duration,
}

impl FailoverClient {
    /// Build a client from the given providers, appending the
    /// maintenance fallback so the list is never empty.
    pub fn new(mut providers: Vec<Box<dyn Provider>>) -> Self {
        providers.push(Box::new(MaintenanceProvider));
        Self {
            providers,
            attempt_timeout: ATTEMPT_TIMEOUT,
        }
    }

    /// Build the provider list from configured credentials. A provider
    /// without a usable key is never constructed.
    pub fn from_config(providers: &ProvidersConfig, client: reqwest::Client) -> Self {
        let mut list: Vec<Box<dyn Provider>> = Vec::new();

        for (name, entry) in providers.find_all_active() {
            let boxed: Box<dyn Provider> = match name {
                "gemini" => Box::new(gemini::GeminiProvider::new(
                    &entry.api_key,
                    entry.model.as_deref(),
                    client.clone(),
                )),
                "anthropic" => Box::new(anthropic::AnthropicProvider::new(
                    &entry.api_key,
                    entry.model.as_deref(),
                    client.clone(),
                )),
                "openai" => Box::new(openai::OpenAiProvider::new(
                    &entry.api_key,
                    entry.model.as_deref(),
                    client.clone(),
                )),
                _ => continue,
            };
            list.push(boxed);
        }

        Self::new(list)
    }

    /// Names of the configured providers, in attempt order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Try each provider in order and return the first success.
    ///
    /// Fails only if every configured provider fails — which cannot
    /// happen while the maintenance fallback is in place.
    pub async fn call(&self, prompt: &str) -> anyhow::Result<String> {
        let mut last_error: Option<anyhow::Error> = None;

        for provider in &self.providers {
            match tokio::time::timeout(self.attempt_timeout, provider.generate(prompt)).await {
                Ok(Ok(text)) => {
                    info!(provider = provider.name(), "Provider succeeded");
                    return Ok(text);
                }
                Ok(Err(e)) => {
                    warn!(provider = provider.name(), error = %e, "Provider failed, trying next");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(
                        provider = provider.name(),
                        timeout_secs = self.attempt_timeout.as_secs(),
                        "Provider timed out, trying next"
                    );
                    last_error = Some(anyhow::anyhow!(
                        "{} timed out after {}s",
                        provider.name(),
                        self.attempt_timeout.as_secs()
                    ));
                }
            }
        }

        Err(anyhow::anyhow!(
            "All providers failed. Last error: {}",
            last_error.map_or_else(|| "none recorded".into(), |e| e.to_string())
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted provider: fails, succeeds, or hangs, and counts attempts.
    struct ScriptedProvider {
        name: &'static str,
        behavior: Behavior,
        attempts: Arc<AtomicUsize>,
    }

    enum Behavior {
        Succeed(&'static str),
        Fail,
        Hang,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed(text) => Ok(text.to_string()),
                Behavior::Fail => Err(anyhow::anyhow!("{} is unavailable", self.name)),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(String::new())
                }
            }
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    fn scripted(
        name: &'static str,
        behavior: Behavior,
    ) -> (Box<dyn Provider>, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let p = ScriptedProvider {
            name,
            behavior,
            attempts: Arc::clone(&attempts),
        };
        (Box::new(p), attempts)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_failover_tries_providers_in_order() {
        let (p1, a1) = scripted("first", Behavior::Fail);
        let (p2, a2) = scripted("second", Behavior::Hang);
        let (p3, a3) = scripted("third", Behavior::Succeed("answer"));

        let client = FailoverClient::new(vec![p1, p2, p3]);
        let result = client.call("hello").await.unwrap();

        assert_eq!(result, "answer");
        assert_eq!(a1.load(Ordering::SeqCst), 1);
        assert_eq!(a2.load(Ordering::SeqCst), 1);
        assert_eq!(a3.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_stops_the_chain() {
        let (p1, _) = scripted("first", Behavior::Succeed("fast"));
        let (p2, a2) = scripted("second", Behavior::Succeed("never"));

        let client = FailoverClient::new(vec![p1, p2]);
        assert_eq!(client.call("q").await.unwrap(), "fast");
        assert_eq!(a2.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_never_empty_falls_back_to_maintenance() {
        let client = FailoverClient::new(Vec::new());
        let result = client.call("anything").await.unwrap();
        assert_eq!(result, MAINTENANCE_MESSAGE);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_all_real_providers_fail_still_yields_text() {
        let (p1, _) = scripted("first", Behavior::Fail);
        let (p2, _) = scripted("second", Behavior::Hang);

        let client = FailoverClient::new(vec![p1, p2]);
        let result = client.call("q").await.unwrap();
        assert_eq!(result, MAINTENANCE_MESSAGE);
    }
}
