use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{DateRange, EutilsConfig, SearchOptions};
use crate::error::PubTrialsError;
use crate::sources::rate_limit::RateLimiter;

const PUBMED_API: &str = "pubmed";

const ESEARCH_PAGE_SIZE: usize = 500;
/// PubMed esearch only exposes the first 10,000 hits of a query.
const ESEARCH_MAX_RETRIEVABLE: usize = 10_000;
pub const EFETCH_BATCH_SIZE: usize = 200;

#[derive(Clone)]
pub struct PubMedClient {
    client: reqwest_middleware::ClientWithMiddleware,
    base: Cow<'static, str>,
    tool: String,
    email: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ESearchPage {
    pub count: usize,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ESearchResult {
    /// Hit count reported by PubMed, which may exceed `pmids.len()`.
    pub total: usize,
    pub pmids: Vec<String>,
}

pub fn is_pmid(value: &str) -> bool {
    !value.is_empty() && value.len() <= 10 && value.bytes().all(|b| b.is_ascii_digit())
}

impl PubMedClient {
    pub fn new(config: &EutilsConfig) -> Result<Self, PubTrialsError> {
        Ok(Self {
            client: crate::sources::throttled_client(Arc::new(RateLimiter::new(
                config.min_interval(),
            )))?,
            base: config.base.clone(),
            tool: config.tool.clone(),
            email: config.email.clone(),
            api_key: config.api_key.clone(),
        })
    }

    #[cfg(test)]
    fn new_for_test(base: String) -> Result<Self, PubTrialsError> {
        Self::new(&EutilsConfig::for_base(base))
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_ref().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn common_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("db", "pubmed".to_string()), ("tool", self.tool.clone())];
        if let Some(email) = &self.email {
            params.push(("email", email.clone()));
        }
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    async fn get_bytes(
        &self,
        path: &str,
        params: &[(&'static str, String)],
    ) -> Result<Vec<u8>, PubTrialsError> {
        let url = self.endpoint(path);
        let resp = self
            .client
            .get(&url)
            .query(&self.common_params())
            .query(params)
            .send()
            .await?;
        let status = resp.status();
        let bytes = crate::sources::read_limited_body(resp, PUBMED_API).await?;
        if !status.is_success() {
            let excerpt = crate::sources::body_excerpt(&bytes);
            return Err(PubTrialsError::Api {
                api: PUBMED_API.to_string(),
                message: format!("HTTP {status}: {excerpt}"),
            });
        }
        Ok(bytes)
    }

    /// One esearch page of PMIDs starting at `retstart`.
    pub async fn esearch_page(
        &self,
        term: &str,
        retstart: usize,
        retmax: usize,
        date_range: Option<&DateRange>,
    ) -> Result<ESearchPage, PubTrialsError> {
        let term = term.trim();
        if term.is_empty() {
            return Err(PubTrialsError::InvalidArgument(
                "PubMed search term is required".into(),
            ));
        }

        let mut params = vec![
            ("term", term.to_string()),
            ("retmode", "json".to_string()),
            ("retstart", retstart.to_string()),
            ("retmax", retmax.to_string()),
        ];
        if let Some(range) = date_range {
            params.push(("datetype", "pdat".to_string()));
            params.push(("mindate", range.mindate.clone()));
            params.push(("maxdate", range.maxdate.clone()));
        }

        let bytes = self.get_bytes("esearch.fcgi", &params).await?;
        let resp: ESearchResponse =
            serde_json::from_slice(&bytes).map_err(|source| PubTrialsError::ApiJson {
                api: PUBMED_API.to_string(),
                source,
            })?;
        resp.into_page()
    }

    /// Collects PMIDs across esearch pages, up to `options.max_results`.
    pub async fn esearch(
        &self,
        term: &str,
        options: &SearchOptions,
    ) -> Result<ESearchResult, PubTrialsError> {
        let cap = options.max_results.min(ESEARCH_MAX_RETRIEVABLE);
        let mut pmids: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut total: Option<usize> = None;
        let mut retstart = 0usize;

        while pmids.len() < cap {
            let retmax = ESEARCH_PAGE_SIZE.min(cap - pmids.len());
            let page = self
                .esearch_page(term, retstart, retmax, options.date_range.as_ref())
                .await?;
            let count = *total.get_or_insert(page.count);
            if page.ids.is_empty() {
                break;
            }

            retstart += page.ids.len();
            for id in page.ids {
                let id = id.trim().to_string();
                if !is_pmid(&id) {
                    warn!(id, "Skipping malformed PMID from esearch");
                    continue;
                }
                if seen.insert(id.clone()) {
                    pmids.push(id);
                }
            }

            if retstart >= count || retstart >= ESEARCH_MAX_RETRIEVABLE {
                break;
            }
        }

        pmids.truncate(cap);
        let total = total.unwrap_or(0);
        if total > pmids.len() {
            debug!(total, returned = pmids.len(), "esearch results truncated");
        }
        Ok(ESearchResult { total, pmids })
    }

    /// Raw PubmedArticleSet XML for at most [`EFETCH_BATCH_SIZE`] PMIDs.
    pub async fn efetch(&self, pmids: &[String]) -> Result<String, PubTrialsError> {
        if pmids.is_empty() {
            return Err(PubTrialsError::InvalidArgument(
                "At least one PMID is required".into(),
            ));
        }
        if pmids.len() > EFETCH_BATCH_SIZE {
            return Err(PubTrialsError::InvalidArgument(format!(
                "efetch accepts at most {EFETCH_BATCH_SIZE} PMIDs per request"
            )));
        }
        if let Some(bad) = pmids.iter().find(|id| !is_pmid(id)) {
            return Err(PubTrialsError::InvalidArgument(format!(
                "\"{bad}\" is not a PMID (expected digits)"
            )));
        }

        let params = vec![("id", pmids.join(",")), ("retmode", "xml".to_string())];
        let bytes = self.get_bytes("efetch.fcgi", &params).await?;
        String::from_utf8(bytes).map_err(|err| PubTrialsError::Api {
            api: PUBMED_API.to_string(),
            message: format!("efetch returned non UTF-8 body: {err}"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ESearchResponse {
    esearchresult: Option<ESearchResultBody>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ESearchResultBody {
    count: Option<String>,
    #[serde(default)]
    idlist: Vec<String>,
    #[serde(rename = "ERROR")]
    error: Option<String>,
    errorlist: Option<ESearchErrorList>,
}

#[derive(Debug, Deserialize)]
struct ESearchErrorList {
    #[serde(default)]
    phrasesnotfound: Vec<String>,
    #[serde(default)]
    fieldsnotfound: Vec<String>,
}

impl ESearchResponse {
    fn into_page(self) -> Result<ESearchPage, PubTrialsError> {
        if let Some(message) = self.error.filter(|v| !v.trim().is_empty()) {
            return Err(PubTrialsError::Api {
                api: PUBMED_API.to_string(),
                message,
            });
        }
        let Some(body) = self.esearchresult else {
            return Err(PubTrialsError::Api {
                api: PUBMED_API.to_string(),
                message: "esearch response has no esearchresult".into(),
            });
        };
        if let Some(message) = body.error.filter(|v| !v.trim().is_empty()) {
            return Err(PubTrialsError::Api {
                api: PUBMED_API.to_string(),
                message,
            });
        }
        if let Some(list) = &body.errorlist {
            if !list.phrasesnotfound.is_empty() || !list.fieldsnotfound.is_empty() {
                warn!(
                    phrases = ?list.phrasesnotfound,
                    fields = ?list.fieldsnotfound,
                    "PubMed ignored parts of the query"
                );
            }
        }

        let count = match body.count.as_deref().map(str::trim) {
            Some(raw) => raw.parse::<usize>().map_err(|_| PubTrialsError::Api {
                api: PUBMED_API.to_string(),
                message: format!("esearch count is not a number: \"{raw}\""),
            })?,
            None => body.idlist.len(),
        };
        Ok(ESearchPage {
            count,
            ids: body.idlist,
        })
    }
}
