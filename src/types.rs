use crate::domain::Company;
use crate::error::Result;
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How trustworthy a record's originating source is. Ordering matters: the
/// merge rule prefers higher tiers, so `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

impl ConfidenceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::High => "HIGH",
            ConfidenceTier::Medium => "MEDIUM",
            ConfidenceTier::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HIGH" => Some(ConfidenceTier::High),
            "MEDIUM" => Some(ConfidenceTier::Medium),
            "LOW" => Some(ConfidenceTier::Low),
            _ => None,
        }
    }
}

impl fmt::Display for ConfidenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which collector produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    RegulatoryFiling,
    WebSearch,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::RegulatoryFiling => "SEC_FORM_D",
            SourceKind::WebSearch => "WEB_SEARCH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SEC_FORM_D" => Some(SourceKind::RegulatoryFiling),
            "WEB_SEARCH" => Some(SourceKind::WebSearch),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-company pipeline stages, checkpointed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Resolution,
    FilingCollection,
    SearchExtraction,
    Deduplication,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Resolution => "resolution",
            Stage::FilingCollection => "filing_collection",
            Stage::SearchExtraction => "search_extraction",
            Stage::Deduplication => "deduplication",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "resolution" => Some(Stage::Resolution),
            "filing_collection" => Some(Stage::FilingCollection),
            "search_extraction" => Some(Stage::SearchExtraction),
            "deduplication" => Some(Stage::Deduplication),
            _ => None,
        }
    }

    pub const ALL: [Stage; 4] = [
        Stage::Resolution,
        Stage::FilingCollection,
        Stage::SearchExtraction,
        Stage::Deduplication,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments for creating a funding round, as produced by a collector before
/// any deduplication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundArgs {
    pub round_name: Option<String>,
    /// Free text, any of the accepted granularities (YYYY, YYYY-MM, YYYY-MM-DD).
    pub date: Option<String>,
    pub amount_raised_usd: Option<f64>,
    pub pre_money_valuation_usd: Option<f64>,
    pub post_money_valuation_usd: Option<f64>,
    pub lead_investor: Option<String>,
    #[serde(default)]
    pub all_investors: Vec<String>,
    #[serde(default)]
    pub source_urls: Vec<String>,
    pub notes: Option<String>,
}

/// Core trait that all funding-data collectors must implement. Each collector
/// owns one checkpoint stage and is responsible for skipping companies that
/// already completed it.
#[async_trait::async_trait]
pub trait Collector: Send + Sync {
    /// Unique identifier for this collector
    fn name(&self) -> &'static str;

    /// The checkpoint stage this collector marks complete
    fn stage(&self) -> Stage;

    /// Collect funding rounds for one company and persist them through the
    /// store. Returns the number of rounds found (0 when the company was
    /// already processed or nothing was found).
    async fn process_company(&self, storage: &dyn Storage, company: &Company) -> Result<usize>;
}
