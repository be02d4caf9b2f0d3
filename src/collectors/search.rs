use crate::config::SearchConfig;
use crate::domain::{Company, FundingRound, SourceRecord};
use crate::error::Result;
use crate::llm::LlmRouter;
use crate::storage::Storage;
use crate::types::{Collector, ConfidenceTier, RoundArgs, SourceKind, Stage};
use scraper::{Html, Selector};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const SEARCH_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Collects funding rounds by searching the web for press coverage and
/// asking an LLM to structure what the search results describe.
pub struct SearchCollector {
    client: reqwest::Client,
    router: Arc<LlmRouter>,
    max_results_per_query: usize,
    queries_per_company: usize,
    politeness_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Round shape the extraction prompt asks the model to emit.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ExtractedRound {
    round_name: Option<String>,
    date: Option<String>,
    amount_raised_usd: Option<f64>,
    pre_money_valuation_usd: Option<f64>,
    post_money_valuation_usd: Option<f64>,
    lead_investor: Option<String>,
    all_investors: Vec<String>,
    source_url: Option<String>,
}

impl SearchCollector {
    pub fn new(config: &SearchConfig, router: Arc<LlmRouter>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(SEARCH_USER_AGENT)
            .build()?;
        info!(
            "Search collector initialized ({} queries/company, {} results/query, {}ms delay)",
            config.queries_per_company, config.max_results_per_query, config.politeness_delay_ms
        );
        Ok(Self {
            client,
            router,
            max_results_per_query: config.max_results_per_query,
            queries_per_company: config.queries_per_company,
            politeness_delay: Duration::from_millis(config.politeness_delay_ms),
        })
    }

    /// The query plan for one company, capped at the configured count.
    fn queries(&self, company_name: &str) -> Vec<String> {
        let mut queries = Self::generate_queries(company_name);
        queries.truncate(self.queries_per_company);
        queries
    }

    /// Fixed set of site-scoped queries targeting outlets that report
    /// financing rounds.
    pub fn generate_queries(company_name: &str) -> Vec<String> {
        vec![
            format!(r#"site:techcrunch.com "{}" funding raised Series"#, company_name),
            format!(r#"site:crunchbase.com "{}" funding rounds"#, company_name),
            format!(
                r#"site:reuters.com OR site:bloomberg.com "{}" raises funding"#,
                company_name
            ),
            format!(
                r#"site:pitchbook.com OR site:cbinsights.com "{}" venture capital"#,
                company_name
            ),
            format!(
                r#"site:theinformation.com OR site:axios.com "{}" funding"#,
                company_name
            ),
            format!(
                r#"site:venturebeat.com OR site:geekwire.com "{}" raises"#,
                company_name
            ),
            format!(
                r#"site:wsj.com OR site:ft.com OR site:forbes.com "{}" investment"#,
                company_name
            ),
            format!(
                r#""{}" funding history seed series valuation investors"#,
                company_name
            ),
        ]
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let response = self
            .client
            .get(SEARCH_ENDPOINT)
            .query(&[("q", query)])
            .send()
            .await?
            .error_for_status()?;
        let html = response.text().await?;
        Ok(parse_search_page(&html, self.max_results_per_query))
    }

    async fn gather_results(&self, company_name: &str) -> Vec<SearchHit> {
        let mut all_results = Vec::new();
        for query in self.queries(company_name) {
            debug!("Searching: {}", query.chars().take(80).collect::<String>());
            match self.search(&query).await {
                Ok(results) => {
                    debug!("Found {} results", results.len());
                    all_results.extend(results);
                }
                Err(e) => warn!("Search failed for '{}': {}", query, e),
            }
            tokio::time::sleep(self.politeness_delay).await;
        }
        all_results
    }

    async fn extract_rounds(
        &self,
        company_name: &str,
        results: &[SearchHit],
    ) -> Result<(Vec<ExtractedRound>, String, String)> {
        let prompt = build_extraction_prompt(company_name, results);
        let response = self.router.generate(&prompt).await?;
        let rounds = parse_extraction_response(&response.text);
        debug!("Extracted {} rounds for {}", rounds.len(), company_name);
        Ok((rounds, response.provider, response.model))
    }
}

fn parse_search_page(html: &str, max_results: usize) -> Vec<SearchHit> {
    let document = Html::parse_document(html);
    let result_selector = Selector::parse("div.result").expect("valid selector");
    let title_selector = Selector::parse("a.result__a").expect("valid selector");
    let snippet_selector = Selector::parse("a.result__snippet").expect("valid selector");

    let mut hits = Vec::new();
    for result in document.select(&result_selector) {
        let Some(anchor) = result.select(&title_selector).next() else {
            continue;
        };
        let title = anchor.text().collect::<String>().trim().to_string();
        let url = anchor.value().attr("href").unwrap_or_default().to_string();
        if title.is_empty() || url.is_empty() {
            continue;
        }
        let snippet = result
            .select(&snippet_selector)
            .next()
            .map(|s| s.text().collect::<String>().trim().to_string())
            .unwrap_or_default();

        hits.push(SearchHit { title, url, snippet });
        if hits.len() >= max_results {
            break;
        }
    }
    hits
}

fn build_extraction_prompt(company_name: &str, results: &[SearchHit]) -> String {
    let mut search_text = String::new();
    for (i, result) in results.iter().enumerate() {
        search_text.push_str(&format!(
            "\n\n--- Result {} ---\nTitle: {}\nURL: {}\nSnippet: {}\n",
            i + 1,
            result.title,
            result.url,
            result.snippet
        ));
    }

    format!(
        r#"You are a financial data analyst extracting funding round information from web search results.

Company: {company}

Search Results:
{search_text}

Extract ALL funding rounds mentioned for {company}. For each round, extract:
- round_name (e.g., "Seed", "Series A", "Series B", "Series C", etc.)
- date (YYYY-MM-DD or YYYY-MM or YYYY)
- amount_raised_usd (number only, in USD)
- pre_money_valuation_usd (if mentioned, number only)
- post_money_valuation_usd (if mentioned, number only)
- lead_investor (primary investor if mentioned)
- all_investors (list of all investors mentioned)
- source_url (which URL this data came from)

Return ONLY a valid JSON array of funding rounds. If no funding rounds are found, return an empty array [].

Example format:
[
  {{
    "round_name": "Series A",
    "date": "2020-05-15",
    "amount_raised_usd": 50000000,
    "pre_money_valuation_usd": null,
    "post_money_valuation_usd": 250000000,
    "lead_investor": "Sequoia Capital",
    "all_investors": ["Sequoia Capital", "Andreessen Horowitz"],
    "source_url": "https://techcrunch.com/..."
  }}
]

JSON array:"#,
        company = company_name,
        search_text = search_text
    )
}

/// Pull the JSON array out of a model response that may wrap it in prose.
/// Anything unparseable yields an empty list, never an error.
fn parse_extraction_response(response: &str) -> Vec<ExtractedRound> {
    let trimmed = response.trim();
    let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) else {
        warn!("No JSON array found in extraction response");
        return Vec::new();
    };
    if end < start {
        return Vec::new();
    }
    match serde_json::from_str(&trimmed[start..=end]) {
        Ok(rounds) => rounds,
        Err(e) => {
            warn!("Failed to parse extraction response: {}", e);
            Vec::new()
        }
    }
}

#[async_trait::async_trait]
impl Collector for SearchCollector {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn stage(&self) -> Stage {
        Stage::SearchExtraction
    }

    async fn process_company(&self, storage: &dyn Storage, company: &Company) -> Result<usize> {
        let company_id = company.id.expect("persisted company has an id");

        let status = storage.get_processing_status(company_id).await?;
        if status.search_extraction.completed {
            debug!("{} already extracted, skipping", company.name);
            return Ok(status.search_extraction.items_found as usize);
        }

        let results = self.gather_results(&company.name).await;
        if results.is_empty() {
            info!("{} -> no search results found", company.name);
            storage
                .update_stage_status(company_id, Stage::SearchExtraction, 0, true)
                .await?;
            return Ok(0);
        }
        info!("{} -> {} total search results", company.name, results.len());

        let (rounds, provider, model) = self.extract_rounds(&company.name, &results).await?;
        if rounds.is_empty() {
            info!("{} -> no funding rounds extracted", company.name);
            storage
                .update_stage_status(company_id, Stage::SearchExtraction, 0, true)
                .await?;
            return Ok(0);
        }

        for extracted in &rounds {
            let args = RoundArgs {
                round_name: extracted.round_name.clone(),
                date: extracted.date.clone(),
                amount_raised_usd: extracted.amount_raised_usd,
                pre_money_valuation_usd: extracted.pre_money_valuation_usd,
                post_money_valuation_usd: extracted.post_money_valuation_usd,
                lead_investor: extracted.lead_investor.clone(),
                all_investors: extracted.all_investors.clone(),
                source_urls: extracted.source_url.iter().cloned().collect(),
                notes: None,
            };
            let investors = args.all_investors.clone();

            let mut round = FundingRound::new(
                company_id,
                args,
                SourceKind::WebSearch,
                ConfidenceTier::Medium,
            );
            storage.add_funding_round(&mut round, &investors).await?;

            if let Some(url) = &extracted.source_url {
                // Attach the search hit this URL came from, when we still have it
                let matching = results.iter().find(|r| &r.url == url);
                let mut source = SourceRecord::new(
                    round.id.expect("persisted round has an id"),
                    SourceKind::WebSearch,
                )
                .with_url(Some(url.clone()))
                .with_title(matching.map(|m| m.title.clone()))
                .with_snippet(matching.map(|m| m.snippet.clone()))
                .with_extraction(
                    Some(provider.clone()),
                    Some(model.clone()),
                    Some(ConfidenceTier::Medium),
                );
                storage.add_source(&mut source).await?;
            }
        }

        storage
            .update_stage_status(
                company_id,
                Stage::SearchExtraction,
                rounds.len() as i64,
                true,
            )
            .await?;
        info!("{} -> {} rounds extracted", company.name, rounds.len());
        Ok(rounds.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;

    fn collector_with(config: SearchConfig) -> SearchCollector {
        let router = Arc::new(LlmRouter::new(&LlmConfig::default()).unwrap());
        SearchCollector::new(&config, router).unwrap()
    }

    #[test]
    fn generates_eight_queries_quoting_the_company() {
        let queries = SearchCollector::generate_queries("Acme");
        assert_eq!(queries.len(), 8);
        assert!(queries.iter().all(|q| q.contains(r#""Acme""#)));
        assert!(queries[0].starts_with("site:techcrunch.com"));
    }

    #[test]
    fn query_plan_is_capped_at_the_configured_count() {
        let collector = collector_with(SearchConfig {
            queries_per_company: 3,
            ..SearchConfig::default()
        });
        let queries = collector.queries("Acme");
        assert_eq!(queries, SearchCollector::generate_queries("Acme")[..3]);
    }

    #[test]
    fn default_query_plan_uses_every_query() {
        let collector = collector_with(SearchConfig::default());
        assert_eq!(collector.queries("Acme").len(), 8);
    }

    #[test]
    fn parses_duckduckgo_result_markup() {
        let html = r#"
            <html><body>
            <div class="result">
              <a class="result__a" href="https://techcrunch.com/acme-series-a">Acme raises $5M</a>
              <a class="result__snippet">Acme announced a $5M Series A led by Example Ventures.</a>
            </div>
            <div class="result">
              <a class="result__a" href="https://example.com/other">Other story</a>
            </div>
            </body></html>
        "#;
        let hits = parse_search_page(html, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Acme raises $5M");
        assert_eq!(hits[0].url, "https://techcrunch.com/acme-series-a");
        assert!(hits[0].snippet.contains("Series A"));
        assert_eq!(hits[1].snippet, "");
    }

    #[test]
    fn parse_search_page_respects_result_cap() {
        let html = r#"
            <div class="result"><a class="result__a" href="u1">t1</a></div>
            <div class="result"><a class="result__a" href="u2">t2</a></div>
            <div class="result"><a class="result__a" href="u3">t3</a></div>
        "#;
        assert_eq!(parse_search_page(html, 2).len(), 2);
    }

    #[test]
    fn extraction_tolerates_prose_around_the_array() {
        let response = r#"Here are the rounds I found:
            [{"round_name": "Series A", "date": "2020-05-15", "amount_raised_usd": 50000000}]
            Let me know if you need anything else."#;
        let rounds = parse_extraction_response(response);
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].round_name.as_deref(), Some("Series A"));
        assert_eq!(rounds[0].amount_raised_usd, Some(50_000_000.0));
    }

    #[test]
    fn unparseable_extraction_yields_empty_list() {
        assert!(parse_extraction_response("no array here").is_empty());
        assert!(parse_extraction_response("[{broken json]").is_empty());
        assert!(parse_extraction_response("").is_empty());
    }

    #[test]
    fn empty_array_extraction_yields_empty_list() {
        assert!(parse_extraction_response("[]").is_empty());
    }

    #[test]
    fn extraction_prompt_includes_all_results() {
        let hits = vec![
            SearchHit {
                title: "Title One".into(),
                url: "https://example.com/1".into(),
                snippet: "Snippet one".into(),
            },
            SearchHit {
                title: "Title Two".into(),
                url: "https://example.com/2".into(),
                snippet: "Snippet two".into(),
            },
        ];
        let prompt = build_extraction_prompt("Acme", &hits);
        assert!(prompt.contains("--- Result 1 ---"));
        assert!(prompt.contains("--- Result 2 ---"));
        assert!(prompt.contains("Title Two"));
        assert!(prompt.contains("Company: Acme"));
    }
}
