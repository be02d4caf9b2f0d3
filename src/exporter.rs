use crate::config::ExportConfig;
use crate::error::Result;
use crate::storage::Storage;
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One flattened funding round, ready for tabular output.
#[derive(Debug, Clone, Serialize)]
pub struct ExportRow {
    pub company_name: String,
    pub cik: Option<String>,
    pub round_name: Option<String>,
    pub date: Option<String>,
    pub amount_raised_usd: Option<f64>,
    pub pre_money_valuation_usd: Option<f64>,
    pub post_money_valuation_usd: Option<f64>,
    pub lead_investor: Option<String>,
    /// All investor names joined with "; "
    pub investors: String,
    pub source_kind: String,
    pub confidence: String,
    /// Source URLs joined with "; "
    pub source_urls: String,
    pub notes: Option<String>,
}

/// Writes the surviving rounds to timestamped CSV/JSON files.
pub struct Exporter {
    output_directory: PathBuf,
    formats: Vec<String>,
}

impl Exporter {
    pub fn new(config: &ExportConfig) -> Self {
        Self {
            output_directory: PathBuf::from(&config.output_directory),
            formats: config.formats.clone(),
        }
    }

    /// Flatten every non-duplicate round with its company and investor names.
    pub async fn build_rows(&self, storage: &dyn Storage) -> Result<Vec<ExportRow>> {
        let rounds = storage.list_all_non_duplicate_rounds().await?;
        let mut rows = Vec::with_capacity(rounds.len());

        for round in rounds {
            let company = storage.get_company(round.company_id).await?;
            let round_id = round.id.expect("persisted round has an id");
            let investors = storage.investor_names_for_round(round_id).await?;

            rows.push(ExportRow {
                company_name: company
                    .as_ref()
                    .map(|c| c.name.clone())
                    .unwrap_or_default(),
                cik: company.and_then(|c| c.cik),
                round_name: round.round_name,
                date: round.date,
                amount_raised_usd: round.amount_raised_usd,
                pre_money_valuation_usd: round.pre_money_valuation_usd,
                post_money_valuation_usd: round.post_money_valuation_usd,
                lead_investor: round.lead_investor,
                investors: investors.join("; "),
                source_kind: round.source_kind.as_str().to_string(),
                confidence: round.confidence.as_str().to_string(),
                source_urls: round.source_urls.join("; "),
                notes: round.notes,
            });
        }
        Ok(rows)
    }

    /// Export all surviving rounds in every configured format. Returns the
    /// paths written.
    pub async fn export_all(&self, storage: &dyn Storage) -> Result<Vec<PathBuf>> {
        let rows = self.build_rows(storage).await?;
        std::fs::create_dir_all(&self.output_directory)?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut written = Vec::new();

        for format in &self.formats {
            let path = self
                .output_directory
                .join(format!("funding_rounds_{}.{}", timestamp, format));
            match format.as_str() {
                "csv" => write_csv(&path, &rows)?,
                "json" => write_json(&path, &rows)?,
                other => {
                    warn!("Unknown export format '{}', skipping", other);
                    continue;
                }
            }
            info!("Exported {} rounds to {}", rows.len(), path.display());
            written.push(path);
        }
        Ok(written)
    }
}

fn write_csv(path: &Path, rows: &[ExportRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_json(path: &Path, rows: &[ExportRow]) -> Result<()> {
    let json = serde_json::to_string_pretty(rows)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FundingRound;
    use crate::storage::InMemoryStorage;
    use crate::types::{ConfidenceTier, RoundArgs, SourceKind};
    use tempfile::TempDir;

    async fn seeded_storage() -> InMemoryStorage {
        let storage = InMemoryStorage::new();
        let company = storage.get_or_create_company("Acme").await.unwrap();
        let company_id = company.id.unwrap();

        let args = RoundArgs {
            round_name: Some("Series A".to_string()),
            date: Some("2021-05-01".to_string()),
            amount_raised_usd: Some(5_000_000.0),
            lead_investor: Some("Example Ventures".to_string()),
            source_urls: vec!["https://example.com/a".to_string()],
            ..Default::default()
        };
        let mut surviving = FundingRound::new(
            company_id,
            args,
            SourceKind::RegulatoryFiling,
            ConfidenceTier::High,
        );
        storage
            .add_funding_round(
                &mut surviving,
                &["Example Ventures".to_string(), "Other Fund".to_string()],
            )
            .await
            .unwrap();

        let mut demoted = FundingRound::new(
            company_id,
            RoundArgs::default(),
            SourceKind::WebSearch,
            ConfidenceTier::Medium,
        );
        storage.add_funding_round(&mut demoted, &[]).await.unwrap();
        storage
            .mark_as_duplicate(demoted.id.unwrap(), surviving.id.unwrap())
            .await
            .unwrap();
        storage
    }

    #[tokio::test]
    async fn rows_flatten_company_and_investors_and_skip_duplicates() {
        let storage = seeded_storage().await;
        let exporter = Exporter::new(&ExportConfig::default());
        let rows = exporter.build_rows(&storage).await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].company_name, "Acme");
        assert_eq!(rows[0].investors, "Example Ventures; Other Fund");
        assert_eq!(rows[0].source_kind, "SEC_FORM_D");
        assert_eq!(rows[0].confidence, "HIGH");
        assert_eq!(rows[0].source_urls, "https://example.com/a");
    }

    #[tokio::test]
    async fn export_writes_csv_and_json_files() {
        let storage = seeded_storage().await;
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(&ExportConfig {
            output_directory: dir.path().to_string_lossy().to_string(),
            formats: vec!["csv".to_string(), "json".to_string()],
        });

        let written = exporter.export_all(&storage).await.unwrap();
        assert_eq!(written.len(), 2);

        let csv_content = std::fs::read_to_string(&written[0]).unwrap();
        assert!(csv_content.starts_with("company_name,"));
        assert!(csv_content.contains("Acme"));

        let json_content = std::fs::read_to_string(&written[1]).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json_content).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_formats_are_skipped() {
        let storage = seeded_storage().await;
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(&ExportConfig {
            output_directory: dir.path().to_string_lossy().to_string(),
            formats: vec!["xlsx".to_string(), "csv".to_string()],
        });

        let written = exporter.export_all(&storage).await.unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].extension().is_some_and(|e| e == "csv"));
    }
}
