use crate::config::Config;
use crate::collectors::{FilingCollector, SearchCollector};
use crate::dedup::DedupEngine;
use crate::error::{PipelineError, Result};
use crate::exporter::Exporter;
use crate::llm::LlmRouter;
use crate::storage::Storage;
use crate::types::Collector;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Accepted header names for the company column of the input CSV.
const COMPANY_COLUMNS: [&str; 3] = ["Companies", "Company", "company"];

/// Read company names from a CSV file, in file order, optionally truncated.
pub fn load_companies_from_csv(path: &Path, limit: Option<usize>) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let Some(column) = headers
        .iter()
        .position(|h| COMPANY_COLUMNS.contains(&h.trim()))
    else {
        return Err(PipelineError::Config(format!(
            "No company column in {} (expected one of {:?})",
            path.display(),
            COMPANY_COLUMNS
        )));
    };

    let mut companies = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(name) = record.get(column) {
            let name = name.trim();
            if !name.is_empty() {
                companies.push(name.to_string());
            }
        }
    }
    if let Some(limit) = limit {
        companies.truncate(limit);
    }
    Ok(companies)
}

/// Drives the four pipeline stages end to end. Every stage checkpoints
/// per company, so re-running after a crash resumes where the last run
/// stopped.
pub struct Pipeline {
    config: Config,
    storage: Arc<dyn Storage>,
}

impl Pipeline {
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Self {
        Self { config, storage }
    }

    pub async fn run(&self, csv_path: &Path, limit: Option<usize>) -> Result<()> {
        // Stage 1: register companies
        let started = Instant::now();
        let names = load_companies_from_csv(csv_path, limit)?;
        info!("Stage 1: registering {} companies", names.len());
        self.register_companies(&names).await?;
        info!("Stage 1 complete in {:.2?}", started.elapsed());

        // Stage 2: regulatory filings
        let filings = Arc::new(FilingCollector::new(&self.config.filings)?);
        self.run_collector_stage(filings).await?;

        // Stage 3: web search + LLM extraction
        let router = Arc::new(LlmRouter::new(&self.config.llm)?);
        if !router.has_providers() {
            warn!("Search extraction will fail per company: no LLM providers active");
        }
        let search = Arc::new(SearchCollector::new(&self.config.search, router.clone())?);
        self.run_collector_stage(search).await?;

        // Stage 4: deduplication
        let stage_start = Instant::now();
        let engine = DedupEngine::new(&self.config.dedup);
        let dedup = engine.deduplicate_all(self.storage.as_ref()).await?;
        info!(
            "Stage 4 complete in {:.2?}: {} companies, {} duplicates removed, {} unique rounds ({:.1}% dedup rate)",
            stage_start.elapsed(),
            dedup.total_companies,
            dedup.duplicates_removed,
            dedup.unique_rounds,
            dedup.deduplication_rate * 100.0
        );

        // Export surviving rounds
        let exporter = Exporter::new(&self.config.export);
        let written = exporter.export_all(self.storage.as_ref()).await?;
        info!("Exported {} files", written.len());

        self.report(&router).await?;
        Ok(())
    }

    /// Make sure every listed company exists in the store. Registry identity
    /// resolution is the filing collector's job, which also marks that stage.
    pub async fn register_companies(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.storage.get_or_create_company(name).await?;
        }
        Ok(())
    }

    /// Run one collector over every company still needing its stage, bounded
    /// by the worker budget. A failing company is recorded and skipped.
    pub async fn run_collector_stage(&self, collector: Arc<dyn Collector>) -> Result<()> {
        let stage = collector.stage();
        let stage_start = Instant::now();
        let companies = self.storage.list_companies_needing_stage(stage).await?;
        info!(
            "Stage {}: {} companies to process with {} workers",
            stage,
            companies.len(),
            self.config.pipeline.max_workers
        );

        let semaphore = Arc::new(Semaphore::new(self.config.pipeline.max_workers.max(1)));
        let mut tasks = JoinSet::new();
        for company in companies {
            let semaphore = Arc::clone(&semaphore);
            let collector = Arc::clone(&collector);
            let storage = Arc::clone(&self.storage);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                let outcome = collector.process_company(storage.as_ref(), &company).await;
                (company, outcome)
            });
        }

        let mut processed = 0usize;
        let mut items = 0usize;
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(found))) => {
                    processed += 1;
                    items += found;
                }
                Ok((company, Err(e))) => {
                    failed += 1;
                    warn!("{} failed for {}: {}", collector.name(), company.name, e);
                    if let Some(id) = company.id {
                        self.storage
                            .record_company_error(id, &format!("{}: {}", collector.name(), e))
                            .await?;
                    }
                }
                Err(e) => {
                    failed += 1;
                    warn!("{} worker task panicked: {}", collector.name(), e);
                }
            }
        }

        info!(
            "Stage {} complete in {:.2?}: {} processed, {} items found, {} failed",
            stage,
            stage_start.elapsed(),
            processed,
            items,
            failed
        );
        Ok(())
    }

    async fn report(&self, router: &LlmRouter) -> Result<()> {
        let stats = self.storage.statistics().await?;
        info!(
            "Final: {} companies, {} unique rounds ({} total, {} duplicates), {} investors, {} sources, ${:.0} total raised",
            stats.companies,
            stats.unique_rounds,
            stats.total_rounds,
            stats.duplicates,
            stats.investors,
            stats.sources,
            stats.total_amount_raised_usd
        );
        for usage in router.usage_report() {
            info!(
                "Provider {}: {} calls ({} ok, {} failed, {} rate-limited, avg {}ms)",
                usage.name,
                usage.total_calls,
                usage.successful_calls,
                usage.failed_calls,
                usage.rate_limited_calls,
                usage.average_latency_ms
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Company;
    use crate::storage::InMemoryStorage;
    use crate::types::Stage;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    fn csv_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_companies_with_any_accepted_header() {
        for header in ["Companies", "Company", "company"] {
            let file = csv_file(&format!("{}\nAcme\nBeta Corp\n\n", header));
            let names = load_companies_from_csv(file.path(), None).unwrap();
            assert_eq!(names, vec!["Acme".to_string(), "Beta Corp".to_string()]);
        }
    }

    #[test]
    fn limit_truncates_in_file_order() {
        let file = csv_file("Companies\nAcme\nBeta\nGamma\n");
        let names = load_companies_from_csv(file.path(), Some(2)).unwrap();
        assert_eq!(names, vec!["Acme".to_string(), "Beta".to_string()]);
    }

    #[test]
    fn missing_company_column_is_a_config_error() {
        let file = csv_file("Name\nAcme\n");
        assert!(matches!(
            load_companies_from_csv(file.path(), None),
            Err(PipelineError::Config(_))
        ));
    }

    struct FlakyCollector {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Collector for FlakyCollector {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn stage(&self) -> Stage {
            Stage::FilingCollection
        }

        async fn process_company(
            &self,
            storage: &dyn Storage,
            company: &Company,
        ) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if company.name == "Broken Corp" {
                return Err(PipelineError::Api {
                    message: "upstream down".to_string(),
                });
            }
            storage
                .update_stage_status(company.id.unwrap(), Stage::FilingCollection, 1, true)
                .await?;
            Ok(1)
        }
    }

    #[tokio::test]
    async fn one_failing_company_does_not_abort_the_stage() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let good = storage.get_or_create_company("Good Corp").await.unwrap();
        let broken = storage.get_or_create_company("Broken Corp").await.unwrap();

        let pipeline = Pipeline::new(Config::default(), Arc::clone(&storage));
        let collector = Arc::new(FlakyCollector {
            calls: AtomicUsize::new(0),
        });
        pipeline
            .run_collector_stage(Arc::clone(&collector) as Arc<dyn Collector>)
            .await
            .unwrap();

        assert_eq!(collector.calls.load(Ordering::SeqCst), 2);
        let good_status = storage
            .get_processing_status(good.id.unwrap())
            .await
            .unwrap();
        assert!(good_status.filing_collection.completed);

        let broken_status = storage
            .get_processing_status(broken.id.unwrap())
            .await
            .unwrap();
        assert!(!broken_status.filing_collection.completed);
        assert!(broken_status.has_errors);
        assert!(broken_status
            .error_message
            .as_deref()
            .unwrap()
            .contains("upstream down"));
    }

    #[tokio::test]
    async fn registration_leaves_resolution_to_the_filing_stage() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let pipeline = Pipeline::new(Config::default(), Arc::clone(&storage));
        pipeline
            .register_companies(&["Acme".to_string()])
            .await
            .unwrap();

        let company = storage.get_company_by_name("Acme").await.unwrap().unwrap();
        let status = storage
            .get_processing_status(company.id.unwrap())
            .await
            .unwrap();
        assert!(!status.resolution.completed);
    }

    #[tokio::test]
    async fn completed_companies_are_not_rescheduled() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let done = storage.get_or_create_company("Done Corp").await.unwrap();
        storage.get_or_create_company("Pending Corp").await.unwrap();
        storage
            .update_stage_status(done.id.unwrap(), Stage::FilingCollection, 5, true)
            .await
            .unwrap();

        let pipeline = Pipeline::new(Config::default(), Arc::clone(&storage));
        let collector = Arc::new(FlakyCollector {
            calls: AtomicUsize::new(0),
        });
        pipeline
            .run_collector_stage(Arc::clone(&collector) as Arc<dyn Collector>)
            .await
            .unwrap();

        // Only the pending company was scheduled
        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
    }
}
