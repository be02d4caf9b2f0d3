use crate::config::FilingsConfig;
use crate::domain::{Company, FundingRound, SourceRecord};
use crate::error::Result;
use crate::rate_limiter::PacedPool;
use crate::storage::Storage;
use crate::types::{Collector, ConfidenceTier, RoundArgs, SourceKind, Stage};
use regex::Regex;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const TICKERS_URL: &str = "https://www.sec.gov/files/company_tickers.json";
const DEFAULT_USER_AGENT: &str = "Joe B joe.malambo@mail.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Collects Form D filings from the SEC EDGAR registry. Requests rotate
/// through a pool of user-agent identities, each paced to the registry's
/// per-account rate expectations.
pub struct FilingCollector {
    client: reqwest::Client,
    agents: PacedPool,
    offering_amount: Regex,
}

/// One Form D filing worth turning into a round.
struct FormDFiling {
    filing_date: Option<String>,
    accession_number: String,
    amount_usd: Option<f64>,
    document_url: String,
}

impl FilingCollector {
    pub fn new(config: &FilingsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        // Env vars win over config; a lone default identity is the fallback
        let mut user_agents: Vec<String> = (1..=10)
            .filter_map(|i| std::env::var(format!("SEC_USER_AGENT_{}", i)).ok())
            .map(|ua| ua.trim().to_string())
            .filter(|ua| !ua.is_empty())
            .collect();
        if user_agents.is_empty() {
            user_agents = config.user_agents.clone();
        }
        if user_agents.is_empty() {
            warn!("No registry user agents configured, using default");
            user_agents =
                vec![std::env::var("SEC_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.into())];
        }
        info!(
            "Filing collector initialized with {} user agents",
            user_agents.len()
        );

        Ok(Self {
            client,
            agents: PacedPool::new(user_agents, Duration::from_millis(config.min_delay_ms)),
            offering_amount: Regex::new(
                r"<totalOfferingAmount>\s*([0-9][0-9,.]*)\s*</totalOfferingAmount>",
            )
            .expect("valid regex"),
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let user_agent = self.agents.checkout().await.to_string();
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .send()
            .await?
            .error_for_status()?;
        Ok(response)
    }

    /// Resolve a company name to its registry CIK and official name, via
    /// case-insensitive substring match in either direction.
    pub async fn resolve_cik(&self, company_name: &str) -> Result<Option<(String, String)>> {
        let body: Value = self.get(TICKERS_URL).await?.json().await?;
        let needle = company_name.to_lowercase();

        let entries = match body.as_object() {
            Some(map) => map,
            None => return Ok(None),
        };
        for entry in entries.values() {
            let title = entry["title"].as_str().unwrap_or_default();
            let title_lower = title.to_lowercase();
            if title_lower.contains(&needle) || needle.contains(&title_lower) {
                let cik = match &entry["cik_str"] {
                    Value::Number(n) => n.to_string(),
                    Value::String(s) => s.clone(),
                    _ => continue,
                };
                let padded = format!("{:0>10}", cik);
                info!("{} -> CIK {} ({})", company_name, padded, title);
                return Ok(Some((padded, title.to_string())));
            }
        }

        debug!("{} not found in registry", company_name);
        Ok(None)
    }

    async fn fetch_form_d_filings(&self, cik: &str, company_name: &str) -> Result<Vec<FormDFiling>> {
        let url = format!("https://data.sec.gov/submissions/CIK{}.json", cik);
        let body: Value = self.get(&url).await?.json().await?;
        let recent = &body["filings"]["recent"];

        let empty = Vec::new();
        let forms = recent["form"].as_array().unwrap_or(&empty);
        let dates = recent["filingDate"].as_array().unwrap_or(&empty);
        let accessions = recent["accessionNumber"].as_array().unwrap_or(&empty);

        let mut filings = Vec::new();
        for (i, form) in forms.iter().enumerate() {
            if form.as_str() != Some("D") {
                continue;
            }
            let Some(accession) = accessions.get(i).and_then(Value::as_str) else {
                continue;
            };
            let filing_date = dates.get(i).and_then(Value::as_str).map(str::to_string);

            match self.parse_form_d(cik, accession, filing_date).await {
                Ok(filing) => filings.push(filing),
                Err(e) => debug!("Skipping Form D {} for {}: {}", accession, company_name, e),
            }
        }

        if filings.is_empty() {
            info!("{} -> no Form D filings found", company_name);
        } else {
            info!("{} -> found {} Form D filings", company_name, filings.len());
        }
        Ok(filings)
    }

    async fn parse_form_d(
        &self,
        cik: &str,
        accession_number: &str,
        filing_date: Option<String>,
    ) -> Result<FormDFiling> {
        let accession_clean = accession_number.replace('-', "");
        let cik_short = cik.trim_start_matches('0');
        let url = format!(
            "https://www.sec.gov/Archives/edgar/data/{}/{}/primary_doc.xml",
            cik_short, accession_clean
        );

        let document = self.get(&url).await?.text().await?;
        let amount_usd = self
            .offering_amount
            .captures(&document)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok());

        Ok(FormDFiling {
            filing_date,
            accession_number: accession_number.to_string(),
            amount_usd,
            document_url: url,
        })
    }

    /// Resolve the company's registry identity and mark the resolution stage
    /// once the outcome is known. A stored CIK short-circuits the lookup.
    async fn ensure_resolved(
        &self,
        storage: &dyn Storage,
        company_id: i64,
        company: &Company,
    ) -> Result<Option<String>> {
        if let Some(cik) = &company.cik {
            let status = storage.get_processing_status(company_id).await?;
            if !status.resolution.completed {
                storage
                    .update_stage_status(company_id, Stage::Resolution, 1, true)
                    .await?;
            }
            return Ok(Some(cik.clone()));
        }

        match self.resolve_cik(&company.name).await? {
            Some((cik, official_name)) => {
                storage
                    .backfill_company_identity(company_id, Some(&cik), Some(&official_name))
                    .await?;
                storage
                    .update_stage_status(company_id, Stage::Resolution, 1, true)
                    .await?;
                Ok(Some(cik))
            }
            None => {
                storage
                    .update_stage_status(company_id, Stage::Resolution, 0, true)
                    .await?;
                Ok(None)
            }
        }
    }
}

#[async_trait::async_trait]
impl Collector for FilingCollector {
    fn name(&self) -> &'static str {
        "sec_form_d"
    }

    fn stage(&self) -> Stage {
        Stage::FilingCollection
    }

    async fn process_company(&self, storage: &dyn Storage, company: &Company) -> Result<usize> {
        let company_id = company.id.expect("persisted company has an id");

        let status = storage.get_processing_status(company_id).await?;
        if status.filing_collection.completed {
            debug!("{} already collected, skipping", company.name);
            return Ok(status.filing_collection.items_found as usize);
        }

        // Resolve registry identity once; later runs reuse the stored CIK
        let cik = match self.ensure_resolved(storage, company_id, company).await? {
            Some(cik) => cik,
            None => {
                storage
                    .update_stage_status(company_id, Stage::FilingCollection, 0, true)
                    .await?;
                return Ok(0);
            }
        };

        let filings = self.fetch_form_d_filings(&cik, &company.name).await?;
        for filing in &filings {
            let args = RoundArgs {
                round_name: Some("Form D Filing".to_string()),
                date: filing.filing_date.clone(),
                amount_raised_usd: filing.amount_usd,
                source_urls: vec![filing.document_url.clone()],
                notes: Some(format!(
                    "SEC Form D filing (Accession: {})",
                    filing.accession_number
                )),
                ..Default::default()
            };

            let mut round = FundingRound::new(
                company_id,
                args,
                SourceKind::RegulatoryFiling,
                ConfidenceTier::High,
            );
            let notes = round.notes.clone();
            storage.add_funding_round(&mut round, &[]).await?;

            let mut source = SourceRecord::new(
                round.id.expect("persisted round has an id"),
                SourceKind::RegulatoryFiling,
            )
            .with_url(Some(filing.document_url.clone()))
            .with_title(Some(format!(
                "SEC Form D - {}",
                filing.filing_date.as_deref().unwrap_or("unknown date")
            )))
            .with_snippet(notes);
            storage.add_source(&mut source).await?;
        }

        storage
            .update_stage_status(
                company_id,
                Stage::FilingCollection,
                filings.len() as i64,
                true,
            )
            .await?;
        Ok(filings.len())
    }
}
