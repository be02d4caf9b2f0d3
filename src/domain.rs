use crate::types::{ConfidenceTier, RoundArgs, SourceKind, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A company being researched. Identity anchor for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: Option<i64>,
    /// Display name, unique key
    pub name: String,
    /// Registry identifier (SEC CIK), backfilled once resolved
    pub cik: Option<String>,
    /// Official name from the registry, backfilled once resolved
    pub official_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Company {
    pub fn new(name: String) -> Self {
        Self {
            id: None,
            name,
            cik: None,
            official_name: None,
            created_at: Utc::now(),
        }
    }
}

/// Deduplication state of a funding round. A demoted record always references
/// a surviving original; a duplicate pointing at another duplicate is not
/// representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedupState {
    Original,
    DuplicateOf(i64),
}

impl DedupState {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DedupState::DuplicateOf(_))
    }

    pub fn duplicate_of(&self) -> Option<i64> {
        match self {
            DedupState::Original => None,
            DedupState::DuplicateOf(id) => Some(*id),
        }
    }
}

/// One observed financing event as reported by one originating record.
/// Multiple records may describe the same real-world event; the dedup engine
/// demotes the inferior ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRound {
    pub id: Option<i64>,
    pub company_id: i64,
    pub round_name: Option<String>,
    /// Free text: YYYY, YYYY-MM, YYYY-MM-DD or slash-delimited
    pub date: Option<String>,
    pub amount_raised_usd: Option<f64>,
    pub pre_money_valuation_usd: Option<f64>,
    pub post_money_valuation_usd: Option<f64>,
    pub lead_investor: Option<String>,
    pub investor_ids: Vec<i64>,
    pub source_kind: SourceKind,
    pub confidence: ConfidenceTier,
    pub source_urls: Vec<String>,
    pub notes: Option<String>,
    pub dedup: DedupState,
    pub created_at: DateTime<Utc>,
}

impl FundingRound {
    pub fn new(
        company_id: i64,
        args: RoundArgs,
        source_kind: SourceKind,
        confidence: ConfidenceTier,
    ) -> Self {
        Self {
            id: None,
            company_id,
            round_name: args.round_name,
            date: args.date,
            amount_raised_usd: args.amount_raised_usd,
            pre_money_valuation_usd: args.pre_money_valuation_usd,
            post_money_valuation_usd: args.post_money_valuation_usd,
            lead_investor: args.lead_investor,
            investor_ids: Vec::new(),
            source_kind,
            confidence,
            source_urls: args.source_urls,
            notes: args.notes,
            dedup: DedupState::Original,
            created_at: Utc::now(),
        }
    }

    /// Count of populated financial detail fields, used as the merge
    /// tie-break when confidence tiers match.
    pub fn completeness_score(&self) -> u32 {
        let populated_amount = |v: &Option<f64>| matches!(v, Some(x) if *x != 0.0) as u32;
        let populated_text =
            |v: &Option<String>| v.as_deref().map_or(false, |s| !s.trim().is_empty()) as u32;

        populated_amount(&self.amount_raised_usd)
            + populated_amount(&self.pre_money_valuation_usd)
            + populated_amount(&self.post_money_valuation_usd)
            + populated_text(&self.lead_investor)
    }
}

/// An investor (VC firm, angel, corporate). Deduplicated by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Investor {
    pub id: Option<i64>,
    pub name: String,
    pub investor_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Investor {
    pub fn new(name: String) -> Self {
        Self {
            id: None,
            name,
            investor_type: None,
            created_at: Utc::now(),
        }
    }
}

/// Provenance record for one acquisition event, tied to a funding round.
/// Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: Option<i64>,
    pub round_id: i64,
    pub source_kind: SourceKind,
    pub url: Option<String>,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub extraction_confidence: Option<ConfidenceTier>,
    pub created_at: DateTime<Utc>,
}

impl SourceRecord {
    pub fn new(round_id: i64, source_kind: SourceKind) -> Self {
        Self {
            id: None,
            round_id,
            source_kind,
            url: None,
            title: None,
            snippet: None,
            llm_provider: None,
            llm_model: None,
            extraction_confidence: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        // Keep titles within the column limit
        self.title = title.map(|t| {
            if t.len() > 490 {
                let mut truncated: String = t.chars().take(490).collect();
                truncated.push_str("...");
                truncated
            } else {
                t
            }
        });
        self
    }

    pub fn with_snippet(mut self, snippet: Option<String>) -> Self {
        self.snippet = snippet;
        self
    }

    pub fn with_extraction(
        mut self,
        provider: Option<String>,
        model: Option<String>,
        confidence: Option<ConfidenceTier>,
    ) -> Self {
        self.llm_provider = provider;
        self.llm_model = model;
        self.extraction_confidence = confidence;
        self
    }
}

/// Completion state of one checkpoint stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageState {
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub items_found: i64,
}

/// Per-company processing checkpoint. Any stage, re-run, must first check
/// this record and skip companies already marked complete for that stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub id: Option<i64>,
    pub company_id: i64,
    pub resolution: StageState,
    pub filing_collection: StageState,
    pub search_extraction: StageState,
    pub deduplication: StageState,
    pub has_errors: bool,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingStatus {
    pub fn new(company_id: i64) -> Self {
        Self {
            id: None,
            company_id,
            resolution: StageState::default(),
            filing_collection: StageState::default(),
            search_extraction: StageState::default(),
            deduplication: StageState::default(),
            has_errors: false,
            error_message: None,
            retry_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn stage(&self, stage: Stage) -> &StageState {
        match stage {
            Stage::Resolution => &self.resolution,
            Stage::FilingCollection => &self.filing_collection,
            Stage::SearchExtraction => &self.search_extraction,
            Stage::Deduplication => &self.deduplication,
        }
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageState {
        match stage {
            Stage::Resolution => &mut self.resolution,
            Stage::FilingCollection => &mut self.filing_collection,
            Stage::SearchExtraction => &mut self.search_extraction,
            Stage::Deduplication => &mut self.deduplication,
        }
    }
}

/// Aggregate statistics returned by a full deduplication run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupStats {
    pub total_companies: usize,
    pub total_rounds: usize,
    pub unique_rounds: usize,
    pub duplicates_removed: usize,
    /// duplicates / total_rounds, zero-safe
    pub deduplication_rate: f64,
}

/// Aggregate store statistics for the stats report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub companies: usize,
    pub unique_rounds: usize,
    pub total_rounds: usize,
    pub duplicates: usize,
    pub investors: usize,
    pub sources: usize,
    pub total_amount_raised_usd: f64,
}
