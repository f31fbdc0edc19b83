use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::config::SearchOptions;
use crate::entities::query::QueryFilters;
use crate::entities::table::{QuerySummary, ResultRow, ResultTable};

pub fn to_pretty<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(value)
}

fn generated_at() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".into())
}

#[derive(Serialize)]
struct TableDocument<'a> {
    generated_at: String,
    filters: &'a QueryFilters,
    search: &'a SearchOptions,
    queries: &'a [QuerySummary],
    rows: &'a [ResultRow],
}

/// Result table with the run parameters that produced it.
pub fn table_document(
    table: &ResultTable,
    filters: &QueryFilters,
    search: &SearchOptions,
) -> Result<String, serde_json::Error> {
    to_pretty(&TableDocument {
        generated_at: generated_at(),
        filters,
        search,
        queries: &table.queries,
        rows: &table.rows,
    })
}
