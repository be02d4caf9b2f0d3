use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Top-level runtime configuration. Every section has usable defaults so the
/// binary (and the tests) run without a config file present.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub dedup: DedupConfig,
    pub search: SearchConfig,
    pub llm: LlmConfig,
    pub filings: FilingsConfig,
    pub export: ExportConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/funding_rounds.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Max day difference for two dates to count as the same event window.
    pub date_proximity_days: i64,
    /// Max relative difference for two amounts to count as similar.
    pub amount_similarity_threshold: f64,
    /// Reserved. Parsed and logged, does not alter matching.
    pub enable_fuzzy_matching: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            date_proximity_days: 90,
            amount_similarity_threshold: 0.10,
            enable_fuzzy_matching: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_results_per_query: usize,
    pub queries_per_company: usize,
    pub politeness_delay_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results_per_query: 4,
            queries_per_company: 8,
            politeness_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub rotation_strategy: RotationStrategy,
    pub max_retries: usize,
    pub timeout_seconds: u64,
    pub providers: Vec<ProviderConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            rotation_strategy: RotationStrategy::RoundRobin,
            max_retries: 3,
            timeout_seconds: 30,
            providers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    RoundRobin,
    Priority,
    LoadBalanced,
}

/// Request shape spoken by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAiCompatible,
    Gemini,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    pub model: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_rpm")]
    pub rate_limit_rpm: u64,
    /// Environment variable holding the API key. Defaults to
    /// `<NAME>_API_KEY` with the provider name upper-cased.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> u32 {
    999
}

fn default_rpm() -> u64 {
    60
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn api_key_env(&self) -> String {
        self.api_key_env
            .clone()
            .unwrap_or_else(|| format!("{}_API_KEY", self.name.to_uppercase()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilingsConfig {
    /// Minimum delay between calls made by a single registry account.
    pub min_delay_ms: u64,
    /// Fallback user agents when no SEC_USER_AGENT_N env vars are set.
    pub user_agents: Vec<String>,
}

impl Default for FilingsConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            user_agents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub output_directory: String,
    pub formats: Vec<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_directory: "data/exports".to_string(),
            formats: vec!["csv".to_string(), "json".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Ok(Config::default());
        }

        let config_content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file '{}': {}", path, e))
        })?;

        let config: Config = toml::from_str(&config_content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = Config::default();
        assert_eq!(config.dedup.date_proximity_days, 90);
        assert!((config.dedup.amount_similarity_threshold - 0.10).abs() < f64::EPSILON);
        assert!(!config.dedup.enable_fuzzy_matching);
        assert_eq!(config.pipeline.max_workers, 4);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [dedup]
            date_proximity_days = 30

            [[llm.providers]]
            name = "groq"
            kind = "open_ai_compatible"
            endpoint = "https://api.groq.com/openai/v1/chat/completions"
            model = "llama-3.1-70b"
            rate_limit_rpm = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.dedup.date_proximity_days, 30);
        // Untouched sections keep their defaults
        assert!((config.dedup.amount_similarity_threshold - 0.10).abs() < f64::EPSILON);
        assert_eq!(config.llm.providers.len(), 1);
        assert_eq!(config.llm.providers[0].api_key_env(), "GROQ_API_KEY");
        assert_eq!(config.llm.providers[0].priority, 999);
    }
}
