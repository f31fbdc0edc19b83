use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SearchOptions;
use crate::entities::query::{QueryFilters, QueryInput, compose_query};
use crate::error::PubTrialsError;
use crate::sources::pubmed::{EFETCH_BATCH_SIZE, PubMedClient, is_pmid};
use crate::transform;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub pmid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pub_year: Option<i32>,
    #[serde(default)]
    pub publication_types: BTreeSet<String>,
    /// ClinicalTrials.gov identifiers cited by the record.
    #[serde(default)]
    pub trial_ids: BTreeSet<String>,
    /// False when metadata could not be fetched for this PMID.
    pub available: bool,
}

impl Publication {
    pub fn unavailable(pmid: &str) -> Self {
        Self {
            pmid: pmid.to_string(),
            title: None,
            pub_year: None,
            publication_types: BTreeSet::new(),
            trial_ids: BTreeSet::new(),
            available: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicationSearch {
    pub query: String,
    pub total: usize,
    pub pmids: Vec<String>,
}

pub async fn search(
    client: &PubMedClient,
    input: &QueryInput,
    filters: &QueryFilters,
    options: &SearchOptions,
) -> Result<PublicationSearch, PubTrialsError> {
    let query = compose_query(input, filters)?;
    let result = client.esearch(&query, options).await?;
    debug!(
        substance = %input.active_substance,
        disease = %input.disease_name,
        total = result.total,
        returned = result.pmids.len(),
        "esearch complete"
    );
    Ok(PublicationSearch {
        query,
        total: result.total,
        pmids: result.pmids,
    })
}

async fn fetch_batch(
    client: &PubMedClient,
    batch: &[String],
) -> Result<HashMap<String, Publication>, PubTrialsError> {
    let xml = client.efetch(batch).await?;
    let parsed = transform::pubmed_xml::parse_article_set(&xml)?;
    Ok(parsed.into_iter().map(|p| (p.pmid.clone(), p)).collect())
}

/// Fetches metadata for `pmids`, returned in the same order.
///
/// A failed batch is logged and its PMIDs come back as [`Publication::unavailable`].
pub async fn fetch(client: &PubMedClient, pmids: &[String]) -> Vec<Publication> {
    let mut out = Vec::with_capacity(pmids.len());
    for batch in pmids.chunks(EFETCH_BATCH_SIZE) {
        match fetch_batch(client, batch).await {
            Ok(mut found) => {
                for pmid in batch {
                    match found.remove(pmid) {
                        Some(publication) => out.push(publication),
                        None => {
                            warn!(pmid, "efetch returned no record for PMID");
                            out.push(Publication::unavailable(pmid));
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, count = batch.len(), "efetch batch failed");
                out.extend(batch.iter().map(|pmid| Publication::unavailable(pmid)));
            }
        }
    }
    out
}

/// Strict lookup: any HTTP failure or missing record is an error.
pub async fn get(client: &PubMedClient, ids: &[String]) -> Result<Vec<Publication>, PubTrialsError> {
    let ids = ids
        .iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    if ids.is_empty() {
        return Err(PubTrialsError::InvalidArgument(
            "PMID is required. Example: pubtrials get 22663011".into(),
        ));
    }
    if let Some(bad) = ids.iter().find(|id| !is_pmid(id)) {
        return Err(PubTrialsError::InvalidArgument(format!(
            "\"{bad}\" is not a PMID (expected digits)"
        )));
    }

    let mut out = Vec::with_capacity(ids.len());
    for batch in ids.chunks(EFETCH_BATCH_SIZE) {
        let mut found = fetch_batch(client, batch).await?;
        for pmid in batch {
            let publication = found.remove(pmid).ok_or_else(|| PubTrialsError::NotFound {
                entity: "publication".into(),
                id: pmid.clone(),
                suggestion: format!("Check the record at https://pubmed.ncbi.nlm.nih.gov/{pmid}/"),
            })?;
            out.push(publication);
        }
    }
    Ok(out)
}
