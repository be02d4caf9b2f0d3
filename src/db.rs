use crate::domain::{
    Company, DedupState, FundingRound, Investor, ProcessingStatus, SourceRecord, StageState,
    StoreStatistics,
};
use crate::error::{PipelineError, Result};
use crate::storage::Storage;
use crate::types::{ConfidenceTier, SourceKind, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// SQLite-backed record store. One connection guarded by a mutex; every trait
/// method is a single transaction, which gives the per-operation atomicity the
/// pipeline's checkpoint ordering relies on.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;
            CREATE TABLE IF NOT EXISTS companies (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                name           TEXT NOT NULL UNIQUE,
                cik            TEXT,
                official_name  TEXT,
                created_at     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS funding_rounds (
                id                        INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id                INTEGER NOT NULL REFERENCES companies(id),
                round_name                TEXT,
                date                      TEXT,
                amount_raised_usd         REAL,
                pre_money_valuation_usd   REAL,
                post_money_valuation_usd  REAL,
                lead_investor             TEXT,
                source_kind               TEXT NOT NULL,
                confidence                TEXT NOT NULL,
                source_urls               TEXT NOT NULL DEFAULT '[]',
                notes                     TEXT,
                is_duplicate              INTEGER NOT NULL DEFAULT 0,
                duplicate_of              INTEGER REFERENCES funding_rounds(id),
                created_at                TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rounds_company
                ON funding_rounds(company_id, is_duplicate);
            CREATE TABLE IF NOT EXISTS investors (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                name           TEXT NOT NULL UNIQUE,
                investor_type  TEXT,
                created_at     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS round_investors (
                round_id     INTEGER NOT NULL REFERENCES funding_rounds(id),
                investor_id  INTEGER NOT NULL REFERENCES investors(id),
                PRIMARY KEY (round_id, investor_id)
            );
            CREATE TABLE IF NOT EXISTS sources (
                id                     INTEGER PRIMARY KEY AUTOINCREMENT,
                round_id               INTEGER NOT NULL REFERENCES funding_rounds(id),
                source_kind            TEXT NOT NULL,
                url                    TEXT,
                title                  TEXT,
                snippet                TEXT,
                llm_provider           TEXT,
                llm_model              TEXT,
                extraction_confidence  TEXT,
                created_at             TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS processing_status (
                id                             INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id                     INTEGER NOT NULL UNIQUE REFERENCES companies(id),
                resolution_completed           INTEGER NOT NULL DEFAULT 0,
                resolution_completed_at        TEXT,
                resolution_items               INTEGER NOT NULL DEFAULT 0,
                filing_collection_completed    INTEGER NOT NULL DEFAULT 0,
                filing_collection_completed_at TEXT,
                filing_collection_items        INTEGER NOT NULL DEFAULT 0,
                search_extraction_completed    INTEGER NOT NULL DEFAULT 0,
                search_extraction_completed_at TEXT,
                search_extraction_items        INTEGER NOT NULL DEFAULT 0,
                deduplication_completed        INTEGER NOT NULL DEFAULT 0,
                deduplication_completed_at     TEXT,
                deduplication_items            INTEGER NOT NULL DEFAULT 0,
                has_errors                     INTEGER NOT NULL DEFAULT 0,
                error_message                  TEXT,
                retry_count                    INTEGER NOT NULL DEFAULT 0,
                updated_at                     TEXT NOT NULL
            );
            "#,
        )?;
        info!("Opened record store at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn timestamp_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn timestamp_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn stage_prefix(stage: Stage) -> &'static str {
    match stage {
        Stage::Resolution => "resolution",
        Stage::FilingCollection => "filing_collection",
        Stage::SearchExtraction => "search_extraction",
        Stage::Deduplication => "deduplication",
    }
}

fn company_from_row(row: &Row<'_>) -> rusqlite::Result<Company> {
    let created_at: String = row.get("created_at")?;
    Ok(Company {
        id: Some(row.get("id")?),
        name: row.get("name")?,
        cik: row.get("cik")?,
        official_name: row.get("official_name")?,
        created_at: timestamp_from_sql(&created_at),
    })
}

fn round_from_row(row: &Row<'_>) -> rusqlite::Result<FundingRound> {
    let source_kind: String = row.get("source_kind")?;
    let confidence: String = row.get("confidence")?;
    let source_urls: String = row.get("source_urls")?;
    let is_duplicate: bool = row.get("is_duplicate")?;
    let duplicate_of: Option<i64> = row.get("duplicate_of")?;
    let created_at: String = row.get("created_at")?;

    Ok(FundingRound {
        id: Some(row.get("id")?),
        company_id: row.get("company_id")?,
        round_name: row.get("round_name")?,
        date: row.get("date")?,
        amount_raised_usd: row.get("amount_raised_usd")?,
        pre_money_valuation_usd: row.get("pre_money_valuation_usd")?,
        post_money_valuation_usd: row.get("post_money_valuation_usd")?,
        lead_investor: row.get("lead_investor")?,
        investor_ids: Vec::new(),
        source_kind: SourceKind::parse(&source_kind).unwrap_or(SourceKind::WebSearch),
        confidence: ConfidenceTier::parse(&confidence).unwrap_or(ConfidenceTier::Low),
        source_urls: serde_json::from_str(&source_urls).unwrap_or_default(),
        notes: row.get("notes")?,
        dedup: match (is_duplicate, duplicate_of) {
            (true, Some(original)) => DedupState::DuplicateOf(original),
            _ => DedupState::Original,
        },
        created_at: timestamp_from_sql(&created_at),
    })
}

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessingStatus> {
    let stage_state = |prefix: &str| -> rusqlite::Result<StageState> {
        let completed_at: Option<String> = row.get(format!("{}_completed_at", prefix).as_str())?;
        Ok(StageState {
            completed: row.get(format!("{}_completed", prefix).as_str())?,
            completed_at: completed_at.as_deref().map(timestamp_from_sql),
            items_found: row.get(format!("{}_items", prefix).as_str())?,
        })
    };
    let updated_at: String = row.get("updated_at")?;

    Ok(ProcessingStatus {
        id: Some(row.get("id")?),
        company_id: row.get("company_id")?,
        resolution: stage_state("resolution")?,
        filing_collection: stage_state("filing_collection")?,
        search_extraction: stage_state("search_extraction")?,
        deduplication: stage_state("deduplication")?,
        has_errors: row.get("has_errors")?,
        error_message: row.get("error_message")?,
        retry_count: row.get("retry_count")?,
        updated_at: timestamp_from_sql(&updated_at),
    })
}

fn attach_investor_ids(conn: &Connection, round: &mut FundingRound) -> rusqlite::Result<()> {
    let round_id = match round.id {
        Some(id) => id,
        None => return Ok(()),
    };
    let mut stmt = conn.prepare(
        "SELECT investor_id FROM round_investors WHERE round_id = ?1 ORDER BY investor_id",
    )?;
    round.investor_ids = stmt
        .query_map(params![round_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(())
}

fn get_or_create_investor_inner(conn: &Connection, name: &str) -> Result<Investor> {
    let existing = conn
        .query_row(
            "SELECT id, name, investor_type, created_at FROM investors WHERE name = ?1",
            params![name],
            |row| {
                let created_at: String = row.get(3)?;
                Ok(Investor {
                    id: Some(row.get(0)?),
                    name: row.get(1)?,
                    investor_type: row.get(2)?,
                    created_at: timestamp_from_sql(&created_at),
                })
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    if let Some(investor) = existing {
        return Ok(investor);
    }

    let mut investor = Investor::new(name.to_string());
    conn.execute(
        "INSERT INTO investors (name, investor_type, created_at) VALUES (?1, ?2, ?3)",
        params![
            investor.name,
            investor.investor_type,
            timestamp_to_sql(investor.created_at)
        ],
    )?;
    investor.id = Some(conn.last_insert_rowid());
    Ok(investor)
}

fn ensure_status_row(conn: &Connection, company_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO processing_status (company_id, updated_at) VALUES (?1, ?2)",
        params![company_id, timestamp_to_sql(Utc::now())],
    )?;
    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_or_create_company(&self, name: &str) -> Result<Company> {
        let conn = self.conn.lock().unwrap();
        let existing = conn
            .query_row(
                "SELECT id, name, cik, official_name, created_at FROM companies WHERE name = ?1",
                params![name],
                company_from_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        if let Some(company) = existing {
            return Ok(company);
        }

        let mut company = Company::new(name.to_string());
        conn.execute(
            "INSERT INTO companies (name, created_at) VALUES (?1, ?2)",
            params![company.name, timestamp_to_sql(company.created_at)],
        )?;
        let company_id = conn.last_insert_rowid();
        company.id = Some(company_id);
        ensure_status_row(&conn, company_id)?;
        debug!("Created company: {}", company.name);
        Ok(company)
    }

    async fn get_company(&self, company_id: i64) -> Result<Option<Company>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, cik, official_name, created_at FROM companies WHERE id = ?1",
            params![company_id],
            company_from_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(PipelineError::Db(other)),
        })
    }

    async fn get_company_by_name(&self, name: &str) -> Result<Option<Company>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, cik, official_name, created_at FROM companies WHERE name = ?1",
            params![name],
            company_from_row,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(PipelineError::Db(other)),
        })
    }

    async fn backfill_company_identity(
        &self,
        company_id: i64,
        cik: Option<&str>,
        official_name: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE companies
             SET cik = COALESCE(cik, ?2), official_name = COALESCE(official_name, ?3)
             WHERE id = ?1",
            params![company_id, cik, official_name],
        )?;
        Ok(())
    }

    async fn list_companies(&self) -> Result<Vec<Company>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, cik, official_name, created_at FROM companies ORDER BY id",
        )?;
        let companies = stmt
            .query_map([], company_from_row)?
            .collect::<rusqlite::Result<Vec<Company>>>()?;
        Ok(companies)
    }

    async fn list_companies_with_rounds(&self) -> Result<Vec<Company>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT c.id, c.name, c.cik, c.official_name, c.created_at
             FROM companies c
             JOIN funding_rounds r ON r.company_id = c.id
             ORDER BY c.id",
        )?;
        let companies = stmt
            .query_map([], company_from_row)?
            .collect::<rusqlite::Result<Vec<Company>>>()?;
        Ok(companies)
    }

    async fn list_companies_needing_stage(&self, stage: Stage) -> Result<Vec<Company>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT c.id, c.name, c.cik, c.official_name, c.created_at
             FROM companies c
             LEFT JOIN processing_status s ON s.company_id = c.id
             WHERE COALESCE(s.{}_completed, 0) = 0
             ORDER BY c.id",
            stage_prefix(stage)
        );
        let mut stmt = conn.prepare(&sql)?;
        let companies = stmt
            .query_map([], company_from_row)?
            .collect::<rusqlite::Result<Vec<Company>>>()?;
        Ok(companies)
    }

    async fn get_processing_status(&self, company_id: i64) -> Result<ProcessingStatus> {
        let conn = self.conn.lock().unwrap();
        ensure_status_row(&conn, company_id)?;
        let status = conn.query_row(
            "SELECT * FROM processing_status WHERE company_id = ?1",
            params![company_id],
            status_from_row,
        )?;
        Ok(status)
    }

    async fn update_stage_status(
        &self,
        company_id: i64,
        stage: Stage,
        items_found: i64,
        completed: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        ensure_status_row(&conn, company_id)?;
        let prefix = stage_prefix(stage);
        let sql = format!(
            "UPDATE processing_status
             SET {p}_completed = ?2, {p}_completed_at = ?3, {p}_items = ?4, updated_at = ?5
             WHERE company_id = ?1",
            p = prefix
        );
        let completed_at = completed.then(|| timestamp_to_sql(Utc::now()));
        conn.execute(
            &sql,
            params![
                company_id,
                completed,
                completed_at,
                items_found,
                timestamp_to_sql(Utc::now())
            ],
        )?;
        debug!(
            "Stage {} for company {} -> completed={}, items={}",
            stage, company_id, completed, items_found
        );
        Ok(())
    }

    async fn record_company_error(&self, company_id: i64, message: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        ensure_status_row(&conn, company_id)?;
        conn.execute(
            "UPDATE processing_status
             SET has_errors = 1, error_message = ?2, retry_count = retry_count + 1, updated_at = ?3
             WHERE company_id = ?1",
            params![company_id, message, timestamp_to_sql(Utc::now())],
        )?;
        Ok(())
    }

    async fn reset_stages(&self, stages: &[Stage]) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut affected = 0;
        for stage in stages {
            let prefix = stage_prefix(*stage);
            let sql = format!(
                "UPDATE processing_status
                 SET {p}_completed = 0, {p}_completed_at = NULL, {p}_items = 0, updated_at = ?1",
                p = prefix
            );
            affected = conn.execute(&sql, params![timestamp_to_sql(Utc::now())])?;
        }
        Ok(affected)
    }

    async fn add_funding_round(
        &self,
        round: &mut FundingRound,
        investor_names: &[String],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO funding_rounds
             (company_id, round_name, date, amount_raised_usd, pre_money_valuation_usd,
              post_money_valuation_usd, lead_investor, source_kind, confidence, source_urls,
              notes, is_duplicate, duplicate_of, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, NULL, ?12)",
            params![
                round.company_id,
                round.round_name,
                round.date,
                round.amount_raised_usd,
                round.pre_money_valuation_usd,
                round.post_money_valuation_usd,
                round.lead_investor,
                round.source_kind.as_str(),
                round.confidence.as_str(),
                serde_json::to_string(&round.source_urls)?,
                round.notes,
                timestamp_to_sql(round.created_at)
            ],
        )?;
        let round_id = tx.last_insert_rowid();

        let mut investor_ids = Vec::new();
        for name in investor_names {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                continue;
            }
            let investor = get_or_create_investor_inner(&tx, trimmed)?;
            let investor_id = investor.id.expect("investor id set on create");
            tx.execute(
                "INSERT OR IGNORE INTO round_investors (round_id, investor_id) VALUES (?1, ?2)",
                params![round_id, investor_id],
            )?;
            // A name listed twice links once
            if !investor_ids.contains(&investor_id) {
                investor_ids.push(investor_id);
            }
        }

        tx.commit()?;
        round.id = Some(round_id);
        round.investor_ids = investor_ids;
        debug!(
            "Created funding round {} for company {}",
            round_id, round.company_id
        );
        Ok(())
    }

    async fn list_rounds(&self, company_id: i64) -> Result<Vec<FundingRound>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM funding_rounds WHERE company_id = ?1 ORDER BY id")?;
        let mut rounds = stmt
            .query_map(params![company_id], round_from_row)?
            .collect::<rusqlite::Result<Vec<FundingRound>>>()?;
        for round in &mut rounds {
            attach_investor_ids(&conn, round)?;
        }
        Ok(rounds)
    }

    async fn list_non_duplicate_rounds(&self, company_id: i64) -> Result<Vec<FundingRound>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM funding_rounds
             WHERE company_id = ?1 AND is_duplicate = 0
             ORDER BY id",
        )?;
        let mut rounds = stmt
            .query_map(params![company_id], round_from_row)?
            .collect::<rusqlite::Result<Vec<FundingRound>>>()?;
        for round in &mut rounds {
            attach_investor_ids(&conn, round)?;
        }
        Ok(rounds)
    }

    async fn count_non_duplicate_rounds(&self, company_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM funding_rounds WHERE company_id = ?1 AND is_duplicate = 0",
            params![company_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn list_all_non_duplicate_rounds(&self) -> Result<Vec<FundingRound>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM funding_rounds WHERE is_duplicate = 0 ORDER BY id")?;
        let mut rounds = stmt
            .query_map([], round_from_row)?
            .collect::<rusqlite::Result<Vec<FundingRound>>>()?;
        for round in &mut rounds {
            attach_investor_ids(&conn, round)?;
        }
        Ok(rounds)
    }

    async fn count_rounds(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM funding_rounds", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    async fn mark_as_duplicate(&self, round_id: i64, original_round_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE funding_rounds SET is_duplicate = 1, duplicate_of = ?2 WHERE id = ?1",
            params![round_id, original_round_id],
        )?;
        if affected == 0 {
            return Err(PipelineError::Api {
                message: format!("Unknown round id {}", round_id),
            });
        }
        debug!(
            "Marked round {} as duplicate of {}",
            round_id, original_round_id
        );
        Ok(())
    }

    async fn get_or_create_investor(&self, name: &str) -> Result<Investor> {
        let conn = self.conn.lock().unwrap();
        get_or_create_investor_inner(&conn, name)
    }

    async fn investor_names_for_round(&self, round_id: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT i.name FROM investors i
             JOIN round_investors ri ON ri.investor_id = i.id
             WHERE ri.round_id = ?1
             ORDER BY i.id",
        )?;
        let names = stmt
            .query_map(params![round_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    async fn add_source(&self, source: &mut SourceRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sources
             (round_id, source_kind, url, title, snippet, llm_provider, llm_model,
              extraction_confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                source.round_id,
                source.source_kind.as_str(),
                source.url,
                source.title,
                source.snippet,
                source.llm_provider,
                source.llm_model,
                source.extraction_confidence.map(|c| c.as_str()),
                timestamp_to_sql(source.created_at)
            ],
        )?;
        source.id = Some(conn.last_insert_rowid());
        Ok(())
    }

    async fn statistics(&self) -> Result<StoreStatistics> {
        let conn = self.conn.lock().unwrap();
        let companies: i64 = conn.query_row("SELECT COUNT(*) FROM companies", [], |r| r.get(0))?;
        let total_rounds: i64 =
            conn.query_row("SELECT COUNT(*) FROM funding_rounds", [], |r| r.get(0))?;
        let duplicates: i64 = conn.query_row(
            "SELECT COUNT(*) FROM funding_rounds WHERE is_duplicate = 1",
            [],
            |r| r.get(0),
        )?;
        let investors: i64 = conn.query_row("SELECT COUNT(*) FROM investors", [], |r| r.get(0))?;
        let sources: i64 = conn.query_row("SELECT COUNT(*) FROM sources", [], |r| r.get(0))?;
        let total_amount_raised_usd: f64 = conn.query_row(
            "SELECT COALESCE(SUM(amount_raised_usd), 0.0) FROM funding_rounds WHERE is_duplicate = 0",
            [],
            |r| r.get(0),
        )?;

        Ok(StoreStatistics {
            companies: companies as usize,
            unique_rounds: (total_rounds - duplicates) as usize,
            total_rounds: total_rounds as usize,
            duplicates: duplicates as usize,
            investors: investors as usize,
            sources: sources as usize,
            total_amount_raised_usd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoundArgs;
    use tempfile::TempDir;

    fn open_temp_store() -> (TempDir, SqliteStorage) {
        let dir = TempDir::new().unwrap();
        let storage = SqliteStorage::open(dir.path().join("test.db")).unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn repeated_investor_names_link_once() {
        let (_dir, storage) = open_temp_store();
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
    async fn round_trip_preserves_round_fields() {
        let (_dir, storage) = open_temp_store();
        let company = storage.get_or_create_company("Acme").await.unwrap();

        let args = RoundArgs {
            round_name: Some("Series A".to_string()),
            date: Some("2021-05-01".to_string()),
            amount_raised_usd: Some(5_000_000.0),
            lead_investor: Some("Sequoia Capital".to_string()),
            source_urls: vec!["https://example.com/a".to_string()],
            ..Default::default()
        };
        let mut round = FundingRound::new(
            company.id.unwrap(),
            args,
            SourceKind::RegulatoryFiling,
            ConfidenceTier::High,
        );
        storage
            .add_funding_round(&mut round, &["Sequoia Capital".to_string()])
            .await
            .unwrap();

        let loaded = storage
            .list_non_duplicate_rounds(company.id.unwrap())
            .await
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].round_name.as_deref(), Some("Series A"));
        assert_eq!(loaded[0].amount_raised_usd, Some(5_000_000.0));
        assert_eq!(loaded[0].source_kind, SourceKind::RegulatoryFiling);
        assert_eq!(loaded[0].confidence, ConfidenceTier::High);
        assert_eq!(
            loaded[0].source_urls,
            vec!["https://example.com/a".to_string()]
        );
        assert_eq!(loaded[0].investor_ids.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_rounds_are_excluded_from_listings() {
        let (_dir, storage) = open_temp_store();
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

        let survivors = storage.list_non_duplicate_rounds(company_id).await.unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].id, a.id);

        let stats = storage.statistics().await.unwrap();
        assert_eq!(stats.total_rounds, 2);
        assert_eq!(stats.unique_rounds, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn status_rows_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let company_id;
        {
            let storage = SqliteStorage::open(&db_path).unwrap();
            let company = storage.get_or_create_company("Acme").await.unwrap();
            company_id = company.id.unwrap();
            storage
                .update_stage_status(company_id, Stage::FilingCollection, 3, true)
                .await
                .unwrap();
        }

        let storage = SqliteStorage::open(&db_path).unwrap();
        let status = storage.get_processing_status(company_id).await.unwrap();
        assert!(status.filing_collection.completed);
        assert_eq!(status.filing_collection.items_found, 3);
        assert!(!status.search_extraction.completed);
    }

    #[tokio::test]
    async fn needing_stage_skips_completed_companies() {
        let (_dir, storage) = open_temp_store();
        let done = storage.get_or_create_company("Done Corp").await.unwrap();
        let pending = storage.get_or_create_company("Pending Corp").await.unwrap();

        storage
            .update_stage_status(done.id.unwrap(), Stage::SearchExtraction, 1, true)
            .await
            .unwrap();

        let needing = storage
            .list_companies_needing_stage(Stage::SearchExtraction)
            .await
            .unwrap();
        assert_eq!(needing.len(), 1);
        assert_eq!(needing[0].id, pending.id);
    }
}
