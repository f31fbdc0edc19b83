use std::collections::{BTreeSet, HashMap, HashSet};

use futures::{StreamExt, stream};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::SearchOptions;
use crate::entities::publication::{self, Publication, PublicationSearch};
use crate::entities::query::{QueryFilters, QueryInput};
use crate::error::PubTrialsError;
use crate::sources::pubmed::PubMedClient;

pub const MAX_CONCURRENCY: usize = 10;

/// One (query input, publication) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRow {
    pub input_index: usize,
    pub active_substance: String,
    pub disease_name: String,
    pub pmid: String,
    pub title: Option<String>,
    pub pub_year: Option<i32>,
    pub publication_types: BTreeSet<String>,
    pub trial_ids: BTreeSet<String>,
    pub available: bool,
}

impl ResultRow {
    fn new(index: usize, input: &QueryInput, publication: Publication) -> Self {
        Self {
            input_index: index,
            active_substance: input.active_substance.clone(),
            disease_name: input.disease_name.clone(),
            pmid: publication.pmid,
            title: publication.title,
            pub_year: publication.pub_year,
            publication_types: publication.publication_types,
            trial_ids: publication.trial_ids,
            available: publication.available,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuerySummary {
    pub input_index: usize,
    pub active_substance: String,
    pub disease_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Hits reported by PubMed.
    pub total: usize,
    /// Rows this query contributed.
    pub returned: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultTable {
    pub queries: Vec<QuerySummary>,
    pub rows: Vec<ResultRow>,
}

impl ResultTable {
    pub fn failed_queries(&self) -> usize {
        self.queries.iter().filter(|q| q.error.is_some()).count()
    }

    pub fn unavailable_rows(&self) -> usize {
        self.rows.iter().filter(|r| !r.available).count()
    }

    pub fn rows_with_trial_ids(&self) -> usize {
        self.rows.iter().filter(|r| !r.trial_ids.is_empty()).count()
    }
}

/// Search result (or error message) for one input row.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub index: usize,
    pub input: QueryInput,
    pub search: Result<PublicationSearch, String>,
}

/// Joins search outcomes with fetched metadata, in input order then PubMed order.
pub fn aggregate(
    outcomes: &[QueryOutcome],
    publications: &HashMap<String, Publication>,
) -> ResultTable {
    let mut table = ResultTable::default();

    for outcome in outcomes {
        match &outcome.search {
            Ok(search) => {
                for pmid in &search.pmids {
                    let publication = publications
                        .get(pmid)
                        .cloned()
                        .unwrap_or_else(|| Publication::unavailable(pmid));
                    table
                        .rows
                        .push(ResultRow::new(outcome.index, &outcome.input, publication));
                }
                table.queries.push(QuerySummary {
                    input_index: outcome.index,
                    active_substance: outcome.input.active_substance.clone(),
                    disease_name: outcome.input.disease_name.clone(),
                    query: Some(search.query.clone()),
                    total: search.total,
                    returned: search.pmids.len(),
                    error: None,
                });
            }
            Err(message) => table.queries.push(QuerySummary {
                input_index: outcome.index,
                active_substance: outcome.input.active_substance.clone(),
                disease_name: outcome.input.disease_name.clone(),
                query: None,
                total: 0,
                returned: 0,
                error: Some(message.clone()),
            }),
        }
    }

    table
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub filters: QueryFilters,
    pub search: SearchOptions,
    pub concurrency: usize,
    /// Abort on the first failed search instead of logging and continuing.
    pub fail_fast: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            filters: QueryFilters::default(),
            search: SearchOptions::default(),
            concurrency: 1,
            fail_fast: false,
        }
    }
}

/// Searches every input, fetches the union of PMIDs once, then aggregates.
pub async fn collect(
    client: &PubMedClient,
    inputs: &[QueryInput],
    options: &PipelineOptions,
) -> Result<ResultTable, PubTrialsError> {
    if options.concurrency == 0 || options.concurrency > MAX_CONCURRENCY {
        return Err(PubTrialsError::InvalidArgument(format!(
            "--concurrency must be between 1 and {MAX_CONCURRENCY}"
        )));
    }

    let mut searches = stream::iter(inputs.iter().enumerate().map(|(index, input)| async move {
        let search =
            publication::search(client, input, &options.filters, &options.search).await;
        (index, input, search)
    }))
    .buffered(options.concurrency);

    let mut outcomes = Vec::with_capacity(inputs.len());
    while let Some((index, input, search)) = searches.next().await {
        let search = match search {
            Ok(found) => Ok(found),
            Err(err) if options.fail_fast => return Err(err),
            Err(err) => {
                warn!(
                    index,
                    substance = %input.active_substance,
                    disease = %input.disease_name,
                    error = %err,
                    "Search failed, skipping input"
                );
                Err(err.to_string())
            }
        };
        outcomes.push(QueryOutcome {
            index,
            input: input.clone(),
            search,
        });
    }

    let mut seen = HashSet::new();
    let unique_pmids = outcomes
        .iter()
        .filter_map(|o| o.search.as_ref().ok())
        .flat_map(|s| s.pmids.iter())
        .filter(|pmid| seen.insert(pmid.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    info!(
        queries = outcomes.len(),
        pmids = unique_pmids.len(),
        "Fetching publication metadata"
    );

    let publications = publication::fetch(client, &unique_pmids)
        .await
        .into_iter()
        .map(|p| (p.pmid.clone(), p))
        .collect::<HashMap<_, _>>();

    Ok(aggregate(&outcomes, &publications))
}
