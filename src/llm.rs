use crate::config::{LlmConfig, ProviderConfig, ProviderKind, RotationStrategy};
use crate::error::{PipelineError, Result};
use crate::rate_limiter::{RateLimiter, RotationCursor};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_MAX_TOKENS: u32 = 4000;
const DEFAULT_TEMPERATURE: f64 = 0.0;
/// How long to wait for per-provider limits to refill when every provider is
/// saturated, before failing the call.
const ESCALATION_WAIT: Duration = Duration::from_secs(60);

/// One upstream LLM endpoint with its own key, rate ceiling and usage
/// counters.
pub struct LlmProvider {
    pub name: String,
    pub model: String,
    kind: ProviderKind,
    endpoint: String,
    priority: u32,
    api_key: Option<String>,
    enabled: bool,
    limiter: RateLimiter,
    stats: ProviderStats,
}

#[derive(Default)]
struct ProviderStats {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rate_limited_calls: AtomicU64,
    total_latency_ms: AtomicU64,
}

/// Point-in-time usage snapshot for the end-of-run report.
#[derive(Debug, Clone)]
pub struct ProviderUsage {
    pub name: String,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rate_limited_calls: u64,
    pub average_latency_ms: u64,
}

impl LlmProvider {
    pub fn from_config(config: &ProviderConfig) -> Self {
        let api_key = std::env::var(config.api_key_env()).ok();
        if api_key.is_none() {
            debug!(
                "No API key in {} for provider {}",
                config.api_key_env(),
                config.name
            );
        }
        Self {
            name: config.name.clone(),
            model: config.model.clone(),
            kind: config.kind,
            endpoint: config.endpoint.clone(),
            priority: config.priority,
            api_key,
            enabled: config.enabled,
            limiter: RateLimiter::new(config.rate_limit_rpm),
            stats: ProviderStats::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.api_key.is_some()
    }

    fn total_calls(&self) -> u64 {
        self.stats.total_calls.load(Ordering::Relaxed)
    }

    pub fn usage(&self) -> ProviderUsage {
        let successful = self.stats.successful_calls.load(Ordering::Relaxed);
        let total_latency = self.stats.total_latency_ms.load(Ordering::Relaxed);
        ProviderUsage {
            name: self.name.clone(),
            total_calls: self.stats.total_calls.load(Ordering::Relaxed),
            successful_calls: successful,
            failed_calls: self.stats.failed_calls.load(Ordering::Relaxed),
            rate_limited_calls: self.stats.rate_limited_calls.load(Ordering::Relaxed),
            average_latency_ms: if successful > 0 {
                total_latency / successful
            } else {
                0
            },
        }
    }

    async fn complete(&self, client: &reqwest::Client, prompt: &str) -> Result<String> {
        self.stats.total_calls.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let outcome = match self.kind {
            ProviderKind::Gemini => self.call_gemini(client, prompt).await,
            ProviderKind::OpenAiCompatible => self.call_openai_compatible(client, prompt).await,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => {
                self.stats.successful_calls.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .total_latency_ms
                    .fetch_add(latency_ms, Ordering::Relaxed);
                debug!("{} call successful ({}ms)", self.name, latency_ms);
            }
            Err(PipelineError::RateLimited(_)) => {
                self.stats.rate_limited_calls.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failed_calls.fetch_add(1, Ordering::Relaxed);
                warn!("{} call failed: {}", self.name, e);
            }
        }
        outcome
    }

    async fn call_gemini(&self, client: &reqwest::Client, prompt: &str) -> Result<String> {
        let key = self.api_key.as_deref().unwrap_or_default();
        let url = format!("{}?key={}", self.endpoint, key);
        let payload = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": DEFAULT_TEMPERATURE,
                "maxOutputTokens": DEFAULT_MAX_TOKENS
            }
        });

        let response = client.post(&url).json(&payload).send().await?;
        let body = self.checked_json(response).await?;

        body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::MissingField("candidates[0].content.parts[0].text".into()))
    }

    async fn call_openai_compatible(
        &self,
        client: &reqwest::Client,
        prompt: &str,
    ) -> Result<String> {
        let key = self.api_key.as_deref().unwrap_or_default();
        let payload = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": DEFAULT_MAX_TOKENS,
            "temperature": DEFAULT_TEMPERATURE
        });

        let response = client
            .post(&self.endpoint)
            .bearer_auth(key)
            .json(&payload)
            .send()
            .await?;
        let body = self.checked_json(response).await?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::MissingField("choices[0].message.content".into()))
    }

    async fn checked_json(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(PipelineError::RateLimited(self.name.clone()));
        }
        if !status.is_success() {
            return Err(PipelineError::Api {
                message: format!("{} returned HTTP {}", self.name, status),
            });
        }
        Ok(response.json().await?)
    }
}

/// Routes completion calls across providers according to the configured
/// rotation strategy, skipping providers whose rate budget is spent.
pub struct LlmRouter {
    client: reqwest::Client,
    strategy: RotationStrategy,
    max_retries: usize,
    providers: Vec<LlmProvider>,
    /// Indices into `providers` sorted by ascending priority number.
    priority_order: Vec<usize>,
    cursor: RotationCursor,
}

impl LlmRouter {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        let providers: Vec<LlmProvider> = config
            .providers
            .iter()
            .map(LlmProvider::from_config)
            .filter(LlmProvider::is_active)
            .collect();

        if providers.is_empty() {
            warn!("No active LLM providers configured");
        } else {
            info!(
                "LLM router initialized with {} active providers ({:?} rotation)",
                providers.len(),
                config.rotation_strategy
            );
        }

        let mut priority_order: Vec<usize> = (0..providers.len()).collect();
        priority_order.sort_by_key(|&i| providers[i].priority);

        Ok(Self {
            client,
            strategy: config.rotation_strategy,
            max_retries: config.max_retries,
            providers,
            priority_order,
            cursor: RotationCursor::new(),
        })
    }

    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }

    pub fn usage_report(&self) -> Vec<ProviderUsage> {
        self.providers.iter().map(LlmProvider::usage).collect()
    }

    async fn next_available(&self) -> Option<&LlmProvider> {
        if self.providers.is_empty() {
            return None;
        }
        match self.strategy {
            RotationStrategy::RoundRobin => {
                for _ in 0..self.providers.len() {
                    let provider = &self.providers[self.cursor.advance(self.providers.len())];
                    if provider.limiter.try_acquire().await {
                        return Some(provider);
                    }
                }
                None
            }
            RotationStrategy::Priority => {
                for &i in &self.priority_order {
                    if self.providers[i].limiter.try_acquire().await {
                        return Some(&self.providers[i]);
                    }
                }
                None
            }
            RotationStrategy::LoadBalanced => {
                let mut by_usage: Vec<&LlmProvider> = self.providers.iter().collect();
                by_usage.sort_by_key(|p| p.total_calls());
                for provider in by_usage {
                    if provider.limiter.try_acquire().await {
                        return Some(provider);
                    }
                }
                None
            }
        }
    }

    /// One completion call. Tries up to `max_retries` providers; when every
    /// provider is saturated, waits a single escalation window for rate
    /// budgets to refill before giving up.
    pub async fn generate(&self, prompt: &str) -> Result<LlmResponse> {
        if self.providers.is_empty() {
            return Err(PipelineError::ProvidersExhausted);
        }

        let mut waited = false;
        let mut last_error = None;

        for _ in 0..self.max_retries.max(1) {
            let provider = match self.next_available().await {
                Some(p) => p,
                None => {
                    if waited {
                        return Err(PipelineError::ProvidersExhausted);
                    }
                    info!(
                        "All LLM providers saturated; waiting {}s for limits to reset",
                        ESCALATION_WAIT.as_secs()
                    );
                    tokio::time::sleep(ESCALATION_WAIT).await;
                    waited = true;
                    match self.next_available().await {
                        Some(p) => p,
                        None => return Err(PipelineError::ProvidersExhausted),
                    }
                }
            };

            debug!("Using provider {} for completion", provider.name);
            match provider.complete(&self.client, prompt).await {
                Ok(text) => {
                    return Ok(LlmResponse {
                        text,
                        provider: provider.name.clone(),
                        model: provider.model.clone(),
                    })
                }
                Err(e) => {
                    warn!("Provider {} failed, rotating: {}", provider.name, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(PipelineError::ProvidersExhausted))
    }
}

/// A completion together with the identity of the provider that produced it,
/// for provenance rows.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_config(name: &str, rpm: u64, priority: u32) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind: ProviderKind::OpenAiCompatible,
            endpoint: "http://localhost:1/v1/chat/completions".to_string(),
            model: "test-model".to_string(),
            priority,
            rate_limit_rpm: rpm,
            api_key_env: Some("FUNDING_SCRAPER_TEST_KEY".to_string()),
            enabled: true,
        }
    }

    fn router_with(providers: Vec<ProviderConfig>, strategy: RotationStrategy) -> LlmRouter {
        std::env::set_var("FUNDING_SCRAPER_TEST_KEY", "test-key");
        let config = LlmConfig {
            rotation_strategy: strategy,
            max_retries: 3,
            timeout_seconds: 1,
            providers,
        };
        LlmRouter::new(&config).unwrap()
    }

    #[tokio::test]
    async fn round_robin_cycles_providers() {
        let router = router_with(
            vec![provider_config("alpha", 60, 1), provider_config("beta", 60, 2)],
            RotationStrategy::RoundRobin,
        );
        let first = router.next_available().await.unwrap().name.clone();
        let second = router.next_available().await.unwrap().name.clone();
        let third = router.next_available().await.unwrap().name.clone();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn priority_prefers_lowest_priority_number() {
        let router = router_with(
            vec![provider_config("backup", 60, 9), provider_config("primary", 60, 1)],
            RotationStrategy::Priority,
        );
        assert_eq!(router.next_available().await.unwrap().name, "primary");
        assert_eq!(router.next_available().await.unwrap().name, "primary");
    }

    #[tokio::test]
    async fn saturated_provider_is_skipped() {
        let router = router_with(
            vec![provider_config("tiny", 1, 1), provider_config("big", 60, 2)],
            RotationStrategy::Priority,
        );
        assert_eq!(router.next_available().await.unwrap().name, "tiny");
        // tiny's single token is spent; rotation falls through to big
        assert_eq!(router.next_available().await.unwrap().name, "big");
    }

    #[tokio::test]
    async fn empty_router_fails_fast() {
        let router = router_with(vec![], RotationStrategy::RoundRobin);
        assert!(!router.has_providers());
        assert!(matches!(
            router.generate("hello").await,
            Err(PipelineError::ProvidersExhausted)
        ));
    }

    #[tokio::test]
    async fn disabled_provider_is_not_active() {
        std::env::set_var("FUNDING_SCRAPER_TEST_KEY", "test-key");
        let mut config = provider_config("off", 60, 1);
        config.enabled = false;
        assert!(!LlmProvider::from_config(&config).is_active());
    }
}
