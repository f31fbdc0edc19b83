use std::future::Future;
use std::time::Instant;

use serde::Serialize;

use crate::config::{DateRange, EutilsConfig};
use crate::entities::query::{QueryFilters, QueryInput, compose_query};
use crate::error::PubTrialsError;
use crate::sources::pubmed::PubMedClient;
use crate::transform::pubmed_xml::parse_article_set;

/// Known trial report, fetched when the sample search returns nothing to fetch.
const FALLBACK_PMID: &str = "16236737";

#[derive(Debug, Clone, Serialize)]
pub struct EndpointCheck {
    pub endpoint: &'static str,
    pub ok: bool,
    pub latency_ms: u128,
    pub detail: String,
}

/// Result of running one sample pair through the same search and fetch path as `fetch`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub base: String,
    pub requests_per_second: u32,
    pub api_key: bool,
    pub sample_query: String,
    pub checks: Vec<EndpointCheck>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }

    pub fn to_markdown(&self) -> String {
        let rate = match self.requests_per_second {
            0 => "unthrottled".to_string(),
            n => format!("{n} req/s"),
        };
        let key = if self.api_key { "set" } else { "not set" };

        let mut out = String::new();
        out.push_str("# E-utilities check\n\n");
        out.push_str(&format!("- Base: {}\n", self.base));
        out.push_str(&format!("- Rate limit: {rate} (API key {key})\n"));
        out.push_str(&format!("- Sample query: `{}`\n\n", self.sample_query));
        for check in &self.checks {
            let mark = if check.ok { "ok" } else { "FAILED" };
            out.push_str(&format!(
                "- {} {mark} in {}ms: {}\n",
                check.endpoint, check.latency_ms, check.detail
            ));
        }
        out
    }
}

async fn timed<T, Fut, F>(endpoint: &'static str, request: Fut, describe: F) -> (EndpointCheck, Option<T>)
where
    Fut: Future<Output = Result<T, PubTrialsError>>,
    F: FnOnce(&T) -> String,
{
    let start = Instant::now();
    let result = request.await;
    let latency_ms = start.elapsed().as_millis();
    match result {
        Ok(value) => (
            EndpointCheck {
                endpoint,
                ok: true,
                latency_ms,
                detail: describe(&value),
            },
            Some(value),
        ),
        Err(err) => (
            EndpointCheck {
                endpoint,
                ok: false,
                latency_ms,
                detail: err.to_string(),
            },
            None,
        ),
    }
}

/// Searches one sample pair, then fetches and parses a PMID it returned.
///
/// # Errors
///
/// Returns an error when the HTTP client cannot be created or the sample query cannot be composed.
pub async fn check(config: &EutilsConfig) -> Result<HealthReport, PubTrialsError> {
    let client = PubMedClient::new(config)?;
    let sample_query = compose_query(
        &QueryInput::new("imatinib", "Gastrointestinal Stromal Tumors"),
        &QueryFilters::default(),
    )?;
    let window = DateRange::default();

    let (esearch, page) = timed(
        "esearch",
        client.esearch_page(&sample_query, 0, 1, Some(&window)),
        |page| format!("{} hits", page.count),
    )
    .await;

    let pmid = page
        .and_then(|p| p.ids.into_iter().next())
        .unwrap_or_else(|| FALLBACK_PMID.to_string());
    let (efetch, _) = timed(
        "efetch",
        async {
            let xml = client.efetch(std::slice::from_ref(&pmid)).await?;
            parse_article_set(&xml)
        },
        |records| match records.first() {
            Some(p) if p.trial_ids.is_empty() => format!("PMID {} parsed, no trial ids", p.pmid),
            Some(p) => format!(
                "PMID {} parsed, {} trial id(s)",
                p.pmid,
                p.trial_ids.len()
            ),
            None => format!("PMID {pmid} returned no record"),
        },
    )
    .await;

    Ok(HealthReport {
        base: config.base.to_string(),
        requests_per_second: config.requests_per_second,
        api_key: config.api_key.is_some(),
        sample_query,
        checks: vec![esearch, efetch],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_query() -> String {
        compose_query(
            &QueryInput::new("imatinib", "Gastrointestinal Stromal Tumors"),
            &QueryFilters::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn check_fetches_the_pmid_found_by_the_sample_search() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .and(query_param("term", sample_query().as_str()))
            .and(query_param("tool", "pubtrials"))
            .and(query_param("email", "ops@example.org"))
            .and(query_param("api_key", "a&b=c"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "esearchresult": {"count": "57", "idlist": ["22663011"]}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/efetch.fcgi"))
            .and(query_param("id", "22663011"))
            .and(query_param("email", "ops@example.org"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<PubmedArticleSet><PubmedArticle><MedlineCitation><PMID>22663011</PMID>\
                 <Article><DataBankList><DataBank><DataBankName>ClinicalTrials.gov</DataBankName>\
                 <AccessionNumberList><AccessionNumber>NCT01245062</AccessionNumber>\
                 </AccessionNumberList></DataBank></DataBankList></Article>\
                 </MedlineCitation></PubmedArticle></PubmedArticleSet>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = EutilsConfig::for_base(server.uri())
            .with_email(Some("ops@example.org".into()));
        config.api_key = Some("a&b=c".into());
        let report = check(&config).await.unwrap();

        assert!(report.healthy());
        assert_eq!(report.checks[0].detail, "57 hits");
        assert_eq!(report.checks[1].detail, "PMID 22663011 parsed, 1 trial id(s)");
        let md = report.to_markdown();
        assert!(md.contains("API key set"));
        assert!(md.contains("- esearch ok in"));
    }

    #[tokio::test]
    async fn failed_search_still_checks_efetch_with_fallback_pmid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad term"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/efetch.fcgi"))
            .and(query_param("id", FALLBACK_PMID))
            .respond_with(ResponseTemplate::new(200).set_body_string("<PubmedArticleSet/>"))
            .expect(1)
            .mount(&server)
            .await;

        let report = check(&EutilsConfig::for_base(server.uri())).await.unwrap();

        assert!(!report.healthy());
        assert!(!report.checks[0].ok);
        assert!(report.checks[0].detail.contains("HTTP 400"));
        assert!(report.checks[1].ok);
        assert_eq!(
            report.checks[1].detail,
            format!("PMID {FALLBACK_PMID} returned no record")
        );
        let md = report.to_markdown();
        assert!(md.contains("unthrottled"));
        assert!(md.contains("- esearch FAILED in"));
    }
}
