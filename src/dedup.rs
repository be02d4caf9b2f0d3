use crate::config::DedupConfig;
use crate::domain::{Company, DedupStats, FundingRound};
use crate::error::Result;
use crate::storage::Storage;
use crate::types::{ConfidenceTier, Stage};
use chrono::NaiveDate;
use tracing::{debug, info, warn};

/// Round labels that name the same financing series even when the raw strings
/// differ ("Series A" vs "Series A round").
const SERIES_KEYWORDS: [&str; 9] = [
    "seed", "series a", "series b", "series c", "series d", "series e", "series f", "series g",
    "series h",
];

/// Pairwise duplicate detection and merge for funding rounds. All comparison
/// happens within a single company; records from different companies are
/// never duplicates of each other.
pub struct DedupEngine {
    date_proximity_days: i64,
    amount_similarity_threshold: f64,
}

impl DedupEngine {
    pub fn new(config: &DedupConfig) -> Self {
        if config.enable_fuzzy_matching {
            warn!("enable_fuzzy_matching is set but not implemented; ignoring");
        }
        Self {
            date_proximity_days: config.date_proximity_days,
            amount_similarity_threshold: config.amount_similarity_threshold,
        }
    }

    pub fn with_thresholds(date_proximity_days: i64, amount_similarity_threshold: f64) -> Self {
        Self {
            date_proximity_days,
            amount_similarity_threshold,
        }
    }

    /// Two same-company records describe the same financing event iff their
    /// dates are close AND either the amounts are similar or the round names
    /// match.
    pub fn is_duplicate_pair(&self, a: &FundingRound, b: &FundingRound) -> bool {
        if a.company_id != b.company_id {
            return false;
        }
        if !self.dates_are_close(a.date.as_deref(), b.date.as_deref()) {
            return false;
        }
        self.amounts_are_similar(a.amount_raised_usd, b.amount_raised_usd)
            || round_names_match(a.round_name.as_deref(), b.round_name.as_deref())
    }

    fn dates_are_close(&self, a: Option<&str>, b: Option<&str>) -> bool {
        let (Some(a), Some(b)) = (a.and_then(parse_flexible_date), b.and_then(parse_flexible_date))
        else {
            return false;
        };
        (a - b).num_days().abs() <= self.date_proximity_days
    }

    fn amounts_are_similar(&self, a: Option<f64>, b: Option<f64>) -> bool {
        let (Some(a), Some(b)) = (a, b) else {
            return false;
        };
        if a <= 0.0 || b <= 0.0 {
            return false;
        }
        let larger = a.max(b);
        let smaller = a.min(b);
        (larger - smaller) / larger <= self.amount_similarity_threshold
    }

    /// Demote duplicates among one company's non-duplicate rounds. Returns the
    /// number of records demoted. Idempotent: a company whose deduplication
    /// stage is already complete is skipped.
    pub async fn deduplicate_company(
        &self,
        storage: &dyn Storage,
        company: &Company,
    ) -> Result<usize> {
        let company_id = company.id.expect("persisted company has an id");

        let status = storage.get_processing_status(company_id).await?;
        if status.deduplication.completed {
            debug!("Deduplication already complete for {}, skipping", company.name);
            return Ok(0);
        }

        let rounds = storage.list_non_duplicate_rounds(company_id).await?;
        if rounds.len() < 2 {
            storage
                .update_stage_status(
                    company_id,
                    Stage::Deduplication,
                    rounds.len() as i64,
                    true,
                )
                .await?;
            return Ok(0);
        }

        // Records demoted in this pass drop out of later comparisons, so a
        // duplicate's reference always points at a surviving original and
        // demotion chains cannot form.
        let mut surviving = vec![true; rounds.len()];
        let mut duplicates_found = 0;

        for i in 0..rounds.len() {
            if !surviving[i] {
                continue;
            }
            for j in (i + 1)..rounds.len() {
                if !surviving[i] {
                    break;
                }
                if !surviving[j] {
                    continue;
                }
                if !self.is_duplicate_pair(&rounds[i], &rounds[j]) {
                    continue;
                }

                let (winner_idx, loser_idx) = if survivor_is_first(&rounds[i], &rounds[j]) {
                    (i, j)
                } else {
                    (j, i)
                };
                let winner_id = rounds[winner_idx].id.expect("persisted round has an id");
                let loser_id = rounds[loser_idx].id.expect("persisted round has an id");

                storage.mark_as_duplicate(loser_id, winner_id).await?;
                surviving[loser_idx] = false;
                duplicates_found += 1;
                debug!(
                    "Round {} demoted as duplicate of {} for {}",
                    loser_id, winner_id, company.name
                );
            }
        }

        let unique = surviving.iter().filter(|s| **s).count();
        storage
            .update_stage_status(company_id, Stage::Deduplication, unique as i64, true)
            .await?;

        if duplicates_found > 0 {
            info!(
                "Deduplicated {}: {} duplicates, {} unique rounds",
                company.name, duplicates_found, unique
            );
        }
        Ok(duplicates_found)
    }

    /// Deduplicate every company that owns rounds. A failure in one company is
    /// recorded against that company and does not stop the rest.
    pub async fn deduplicate_all(&self, storage: &dyn Storage) -> Result<DedupStats> {
        let companies = storage.list_companies_with_rounds().await?;
        let mut duplicates_removed = 0;

        for company in &companies {
            match self.deduplicate_company(storage, company).await {
                Ok(found) => duplicates_removed += found,
                Err(e) => {
                    warn!("Deduplication failed for {}: {}", company.name, e);
                    if let Some(id) = company.id {
                        storage
                            .record_company_error(id, &format!("deduplication: {}", e))
                            .await?;
                    }
                }
            }
        }

        let total_rounds = storage.count_rounds().await?;
        let unique_rounds = storage.list_all_non_duplicate_rounds().await?.len();
        let deduplication_rate = if total_rounds > 0 {
            duplicates_removed as f64 / total_rounds as f64
        } else {
            0.0
        };

        Ok(DedupStats {
            total_companies: companies.len(),
            total_rounds,
            unique_rounds,
            duplicates_removed,
            deduplication_rate,
        })
    }
}

/// Merge rule: HIGH confidence beats everything else; on a confidence tie the
/// more complete record wins; on an exact tie the first-encountered record
/// survives.
fn survivor_is_first(a: &FundingRound, b: &FundingRound) -> bool {
    let a_high = a.confidence == ConfidenceTier::High;
    let b_high = b.confidence == ConfidenceTier::High;
    if a_high != b_high {
        return a_high;
    }
    a.completeness_score() >= b.completeness_score()
}

/// Parse a free-text date at any of the accepted granularities. Year-month
/// resolves to the first of the month, bare years to January 1st.
pub fn parse_flexible_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{}-01", trimmed), "%Y-%m-%d") {
        return Some(date);
    }
    if trimmed.len() == 4 {
        if let Ok(year) = trimmed.parse::<i32>() {
            return NaiveDate::from_ymd_opt(year, 1, 1);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%m/%d/%Y") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%d/%m/%Y") {
        return Some(date);
    }
    None
}

fn round_names_match(a: Option<&str>, b: Option<&str>) -> bool {
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    SERIES_KEYWORDS
        .iter()
        .any(|kw| a.contains(kw) && b.contains(kw))
}
