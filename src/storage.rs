use crate::domain::{
    Company, DedupState, FundingRound, Investor, ProcessingStatus, SourceRecord, StoreStatistics,
};
use crate::error::{PipelineError, Result};
use crate::types::Stage;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Record store consumed by the collectors, the dedup engine and the
/// exporter. Every operation is individually atomic; callers get per-company
/// isolation by ordering their writes so the stage checkpoint lands last.
#[async_trait]
pub trait Storage: Send + Sync {
    // Company operations
    async fn get_or_create_company(&self, name: &str) -> Result<Company>;
    async fn get_company(&self, company_id: i64) -> Result<Option<Company>>;
    async fn get_company_by_name(&self, name: &str) -> Result<Option<Company>>;
    /// Backfill registry identity once resolved. Never overwrites an
    /// already-populated field.
    async fn backfill_company_identity(
        &self,
        company_id: i64,
        cik: Option<&str>,
        official_name: Option<&str>,
    ) -> Result<()>;
    async fn list_companies(&self) -> Result<Vec<Company>>;
    /// Companies that own at least one funding round, duplicates included.
    async fn list_companies_with_rounds(&self) -> Result<Vec<Company>>;
    async fn list_companies_needing_stage(&self, stage: Stage) -> Result<Vec<Company>>;

    // Processing status operations
    /// Fetch the checkpoint record, creating a default one if absent.
    async fn get_processing_status(&self, company_id: i64) -> Result<ProcessingStatus>;
    async fn update_stage_status(
        &self,
        company_id: i64,
        stage: Stage,
        items_found: i64,
        completed: bool,
    ) -> Result<()>;
    async fn record_company_error(&self, company_id: i64, message: &str) -> Result<()>;
    /// Clear stage flags so companies get reprocessed. Returns affected count.
    async fn reset_stages(&self, stages: &[Stage]) -> Result<usize>;

    // Funding round operations
    /// Persist a round, lazily creating and linking the named investors.
    async fn add_funding_round(
        &self,
        round: &mut FundingRound,
        investor_names: &[String],
    ) -> Result<()>;
    /// Every round for the company, demoted duplicates included.
    async fn list_rounds(&self, company_id: i64) -> Result<Vec<FundingRound>>;
    async fn list_non_duplicate_rounds(&self, company_id: i64) -> Result<Vec<FundingRound>>;
    async fn count_non_duplicate_rounds(&self, company_id: i64) -> Result<usize>;
    async fn list_all_non_duplicate_rounds(&self) -> Result<Vec<FundingRound>>;
    async fn count_rounds(&self) -> Result<usize>;
    /// Idempotent assignment of the duplicate state.
    async fn mark_as_duplicate(&self, round_id: i64, original_round_id: i64) -> Result<()>;

    // Investor operations
    async fn get_or_create_investor(&self, name: &str) -> Result<Investor>;
    async fn investor_names_for_round(&self, round_id: i64) -> Result<Vec<String>>;

    // Source operations
    async fn add_source(&self, source: &mut SourceRecord) -> Result<()>;

    // Statistics
    async fn statistics(&self) -> Result<StoreStatistics>;
}

/// In-memory storage implementation for development and testing.
pub struct InMemoryStorage {
    next_id: AtomicI64,
    companies: Arc<Mutex<HashMap<i64, Company>>>,
    rounds: Arc<Mutex<HashMap<i64, FundingRound>>>,
    investors: Arc<Mutex<HashMap<i64, Investor>>>,
    sources: Arc<Mutex<HashMap<i64, SourceRecord>>>,
    statuses: Arc<Mutex<HashMap<i64, ProcessingStatus>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            companies: Arc::new(Mutex::new(HashMap::new())),
            rounds: Arc::new(Mutex::new(HashMap::new())),
            investors: Arc::new(Mutex::new(HashMap::new())),
            sources: Arc::new(Mutex::new(HashMap::new())),
            statuses: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn alloc_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_or_create_company(&self, name: &str) -> Result<Company> {
        let mut companies = self.companies.lock().unwrap();
        if let Some(existing) = companies.values().find(|c| c.name == name) {
            return Ok(existing.clone());
        }

        let id = self.alloc_id();
        let mut company = Company::new(name.to_string());
        company.id = Some(id);
        companies.insert(id, company.clone());

        let mut statuses = self.statuses.lock().unwrap();
        let mut status = ProcessingStatus::new(id);
        status.id = Some(self.alloc_id());
        statuses.insert(id, status);

        debug!("Created company: {} with id {}", company.name, id);
        Ok(company)
    }

    async fn get_company(&self, company_id: i64) -> Result<Option<Company>> {
        let companies = self.companies.lock().unwrap();
        Ok(companies.get(&company_id).cloned())
    }

    async fn get_company_by_name(&self, name: &str) -> Result<Option<Company>> {
        let companies = self.companies.lock().unwrap();
        Ok(companies.values().find(|c| c.name == name).cloned())
    }

    async fn backfill_company_identity(
        &self,
        company_id: i64,
        cik: Option<&str>,
        official_name: Option<&str>,
    ) -> Result<()> {
        let mut companies = self.companies.lock().unwrap();
        let company = companies.get_mut(&company_id).ok_or_else(|| PipelineError::Api {
            message: format!("Unknown company id {}", company_id),
        })?;
        if company.cik.is_none() {
            company.cik = cik.map(|s| s.to_string());
        }
        if company.official_name.is_none() {
            company.official_name = official_name.map(|s| s.to_string());
        }
        Ok(())
    }

    async fn list_companies(&self) -> Result<Vec<Company>> {
        let companies = self.companies.lock().unwrap();
        let mut all: Vec<Company> = companies.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        Ok(all)
    }

    async fn list_companies_with_rounds(&self) -> Result<Vec<Company>> {
        let company_ids: std::collections::HashSet<i64> = {
            let rounds = self.rounds.lock().unwrap();
            rounds.values().map(|r| r.company_id).collect()
        };

        let companies = self.companies.lock().unwrap();
        let mut with_rounds: Vec<Company> = companies
            .values()
            .filter(|c| c.id.map_or(false, |id| company_ids.contains(&id)))
            .cloned()
            .collect();
        with_rounds.sort_by_key(|c| c.id);
        Ok(with_rounds)
    }

    async fn list_companies_needing_stage(&self, stage: Stage) -> Result<Vec<Company>> {
        let pending: std::collections::HashSet<i64> = {
            let statuses = self.statuses.lock().unwrap();
            statuses
                .values()
                .filter(|s| !s.stage(stage).completed)
                .map(|s| s.company_id)
                .collect()
        };

        let companies = self.companies.lock().unwrap();
        let mut needing: Vec<Company> = companies
            .values()
            .filter(|c| c.id.map_or(false, |id| pending.contains(&id)))
            .cloned()
            .collect();
        needing.sort_by_key(|c| c.id);
        Ok(needing)
    }

    async fn get_processing_status(&self, company_id: i64) -> Result<ProcessingStatus> {
        let mut statuses = self.statuses.lock().unwrap();
        if let Some(status) = statuses.get(&company_id) {
            return Ok(status.clone());
        }

        let mut status = ProcessingStatus::new(company_id);
        status.id = Some(self.alloc_id());
        statuses.insert(company_id, status.clone());
        Ok(status)
    }

    async fn update_stage_status(
        &self,
        company_id: i64,
        stage: Stage,
        items_found: i64,
        completed: bool,
    ) -> Result<()> {
        let mut statuses = self.statuses.lock().unwrap();
        let status = statuses
            .entry(company_id)
            .or_insert_with(|| ProcessingStatus::new(company_id));

        let state = status.stage_mut(stage);
        state.completed = completed;
        state.completed_at = completed.then(Utc::now);
        state.items_found = items_found;
        status.updated_at = Utc::now();

        debug!(
            "Stage {} for company {} -> completed={}, items={}",
            stage, company_id, completed, items_found
        );
        Ok(())
    }

    async fn record_company_error(&self, company_id: i64, message: &str) -> Result<()> {
        let mut statuses = self.statuses.lock().unwrap();
        let status = statuses
            .entry(company_id)
            .or_insert_with(|| ProcessingStatus::new(company_id));
        status.has_errors = true;
        status.error_message = Some(message.to_string());
        status.retry_count += 1;
        status.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_stages(&self, stages: &[Stage]) -> Result<usize> {
        let mut statuses = self.statuses.lock().unwrap();
        for status in statuses.values_mut() {
            for stage in stages {
                let state = status.stage_mut(*stage);
                state.completed = false;
                state.completed_at = None;
                state.items_found = 0;
            }
            status.updated_at = Utc::now();
        }
        Ok(statuses.len())
    }

    async fn add_funding_round(
        &self,
        round: &mut FundingRound,
        investor_names: &[String],
    ) -> Result<()> {
        let mut investor_ids = Vec::new();
        for name in investor_names {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                continue;
            }
            let investor = self.get_or_create_investor(trimmed).await?;
            let investor_id = investor.id.expect("investor id set on create");
            // A name listed twice links once
            if !investor_ids.contains(&investor_id) {
                investor_ids.push(investor_id);
            }
        }

        let id = self.alloc_id();
        round.id = Some(id);
        round.investor_ids = investor_ids;

        let mut rounds = self.rounds.lock().unwrap();
        rounds.insert(id, round.clone());

        debug!(
            "Created funding round {} for company {}",
            id, round.company_id
        );
        Ok(())
    }

    async fn list_rounds(&self, company_id: i64) -> Result<Vec<FundingRound>> {
        let rounds = self.rounds.lock().unwrap();
        let mut all: Vec<FundingRound> = rounds
            .values()
            .filter(|r| r.company_id == company_id)
            .cloned()
            .collect();
        all.sort_by_key(|r| r.id);
        Ok(all)
    }

    async fn list_non_duplicate_rounds(&self, company_id: i64) -> Result<Vec<FundingRound>> {
        let rounds = self.rounds.lock().unwrap();
        let mut filtered: Vec<FundingRound> = rounds
            .values()
            .filter(|r| r.company_id == company_id && !r.dedup.is_duplicate())
            .cloned()
            .collect();
        // Load order is creation order
        filtered.sort_by_key(|r| r.id);
        Ok(filtered)
    }

    async fn count_non_duplicate_rounds(&self, company_id: i64) -> Result<usize> {
        let rounds = self.rounds.lock().unwrap();
        Ok(rounds
            .values()
            .filter(|r| r.company_id == company_id && !r.dedup.is_duplicate())
            .count())
    }

    async fn list_all_non_duplicate_rounds(&self) -> Result<Vec<FundingRound>> {
        let rounds = self.rounds.lock().unwrap();
        let mut all: Vec<FundingRound> = rounds
            .values()
            .filter(|r| !r.dedup.is_duplicate())
            .cloned()
            .collect();
        all.sort_by_key(|r| r.id);
        Ok(all)
    }

    async fn count_rounds(&self) -> Result<usize> {
        let rounds = self.rounds.lock().unwrap();
        Ok(rounds.len())
    }

    async fn mark_as_duplicate(&self, round_id: i64, original_round_id: i64) -> Result<()> {
        let mut rounds = self.rounds.lock().unwrap();
        let round = rounds.get_mut(&round_id).ok_or_else(|| PipelineError::Api {
            message: format!("Unknown round id {}", round_id),
        })?;
        round.dedup = DedupState::DuplicateOf(original_round_id);
        debug!("Marked round {} as duplicate of {}", round_id, original_round_id);
        Ok(())
    }

    async fn get_or_create_investor(&self, name: &str) -> Result<Investor> {
        let mut investors = self.investors.lock().unwrap();
        if let Some(existing) = investors.values().find(|i| i.name == name) {
            return Ok(existing.clone());
        }

        let id = self.alloc_id();
        let mut investor = Investor::new(name.to_string());
        investor.id = Some(id);
        investors.insert(id, investor.clone());

        debug!("Created investor: {} with id {}", investor.name, id);
        Ok(investor)
    }

    async fn investor_names_for_round(&self, round_id: i64) -> Result<Vec<String>> {
        let investor_ids = {
            let rounds = self.rounds.lock().unwrap();
            match rounds.get(&round_id) {
                Some(round) => round.investor_ids.clone(),
                None => return Ok(Vec::new()),
            }
        };

        let investors = self.investors.lock().unwrap();
        Ok(investor_ids
            .iter()
            .filter_map(|id| investors.get(id).map(|i| i.name.clone()))
            .collect())
    }

    async fn add_source(&self, source: &mut SourceRecord) -> Result<()> {
        let id = self.alloc_id();
        source.id = Some(id);

        let mut sources = self.sources.lock().unwrap();
        sources.insert(id, source.clone());
        Ok(())
    }

    async fn statistics(&self) -> Result<StoreStatistics> {
        let companies = self.companies.lock().unwrap().len();
        let investors = self.investors.lock().unwrap().len();
        let sources = self.sources.lock().unwrap().len();

        let rounds = self.rounds.lock().unwrap();
        let total_rounds = rounds.len();
        let duplicates = rounds.values().filter(|r| r.dedup.is_duplicate()).count();
        let total_amount_raised_usd = rounds
            .values()
            .filter(|r| !r.dedup.is_duplicate())
            .filter_map(|r| r.amount_raised_usd)
            .sum();

        Ok(StoreStatistics {
            companies,
            unique_rounds: total_rounds - duplicates,
            total_rounds,
            duplicates,
            investors,
            sources,
            total_amount_raised_usd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfidenceTier, RoundArgs, SourceKind};

    #[tokio::test]
    async fn company_creation_is_idempotent_by_name() {
        let storage = InMemoryStorage::new();
        let first = storage.get_or_create_company("Acme").await.unwrap();
        let second = storage.get_or_create_company("Acme").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(storage.list_companies().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backfill_does_not_overwrite_existing_identity() {
        let storage = InMemoryStorage::new();
        let company = storage.get_or_create_company("Acme").await.unwrap();
        let id = company.id.unwrap();

        storage
            .backfill_company_identity(id, Some("0000012345"), Some("Acme Inc"))
            .await
            .unwrap();
        storage
            .backfill_company_identity(id, Some("0000099999"), None)
            .await
            .unwrap();

        let reloaded = storage.get_company(id).await.unwrap().unwrap();
        assert_eq!(reloaded.cik.as_deref(), Some("0000012345"));
        assert_eq!(reloaded.official_name.as_deref(), Some("Acme Inc"));
    }

    #[tokio::test]
    async fn investors_are_deduplicated_by_name() {
        let storage = InMemoryStorage::new();
        let company = storage.get_or_create_company("Acme").await.unwrap();

        let mut round = FundingRound::new(
            company.id.unwrap(),
            RoundArgs::default(),
            SourceKind::WebSearch,
            ConfidenceTier::Medium,
        );
        storage
            .add_funding_round(
                &mut round,
                &["Sequoia Capital".to_string(), "Sequoia Capital".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(round.investor_ids.len(), 1);
        let names = storage
            .investor_names_for_round(round.id.unwrap())
            .await
            .unwrap();
        assert_eq!(names, vec!["Sequoia Capital".to_string()]);
    }

    #[tokio::test]
    async fn mark_as_duplicate_is_idempotent() {
        let storage = InMemoryStorage::new();
        let company = storage.get_or_create_company("Acme").await.unwrap();
        let company_id = company.id.unwrap();

        let mut a = FundingRound::new(
            company_id,
            RoundArgs::default(),
            SourceKind::RegulatoryFiling,
            ConfidenceTier::High,
        );
        let mut b = FundingRound::new(
            company_id,
            RoundArgs::default(),
            SourceKind::WebSearch,
            ConfidenceTier::Medium,
        );
        storage.add_funding_round(&mut a, &[]).await.unwrap();
        storage.add_funding_round(&mut b, &[]).await.unwrap();

        storage
            .mark_as_duplicate(b.id.unwrap(), a.id.unwrap())
            .await
            .unwrap();
        storage
            .mark_as_duplicate(b.id.unwrap(), a.id.unwrap())
            .await
            .unwrap();

        assert_eq!(storage.count_non_duplicate_rounds(company_id).await.unwrap(), 1);
        let survivors = storage.list_non_duplicate_rounds(company_id).await.unwrap();
        assert_eq!(survivors[0].id, a.id);
    }

    #[tokio::test]
    async fn reset_stages_clears_only_selected_flags() {
        let storage = InMemoryStorage::new();
        let company = storage.get_or_create_company("Acme").await.unwrap();
        let id = company.id.unwrap();

        storage
            .update_stage_status(id, Stage::FilingCollection, 2, true)
            .await
            .unwrap();
        storage
            .update_stage_status(id, Stage::Deduplication, 1, true)
            .await
            .unwrap();

        storage.reset_stages(&[Stage::Deduplication]).await.unwrap();

        let status = storage.get_processing_status(id).await.unwrap();
        assert!(status.filing_collection.completed);
        assert!(!status.deduplication.completed);
        assert_eq!(status.deduplication.items_found, 0);
    }
}
