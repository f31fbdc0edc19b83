use crate::entities::publication::{Publication, PublicationSearch};
use crate::entities::table::ResultTable;

fn cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}

fn joined(values: &std::collections::BTreeSet<String>) -> String {
    if values.is_empty() {
        return "-".into();
    }
    values.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

pub fn run_summary(table: &ResultTable, output: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str("# PubMed clinical-trial publications\n\n");
    out.push_str("| # | Substance | Disease | Hits | Rows | Status |\n");
    out.push_str("|---|-----------|---------|------|------|--------|\n");
    for query in &table.queries {
        let status = match query.error.as_deref() {
            Some(err) => format!("error: {}", cell(err)),
            None => "ok".into(),
        };
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            query.input_index,
            cell(&query.active_substance),
            cell(&query.disease_name),
            query.total,
            query.returned,
            status
        ));
    }

    let succeeded = table.queries.len() - table.failed_queries();
    out.push_str(&format!(
        "\nQueries: {succeeded}/{} succeeded\n",
        table.queries.len()
    ));
    out.push_str(&format!(
        "Rows: {} ({} with trial ids, {} without metadata)\n",
        table.rows.len(),
        table.rows_with_trial_ids(),
        table.unavailable_rows()
    ));
    if let Some(path) = output {
        out.push_str(&format!("Output: {path}\n"));
    }
    out
}

pub fn search_markdown(search: &PublicationSearch) -> String {
    let mut out = String::new();
    out.push_str(&format!("Query: `{}`\n\n", search.query));
    out.push_str(&format!(
        "Found {} PMIDs (PubMed reports {} hits)\n\n",
        search.pmids.len(),
        search.total
    ));
    for pmid in &search.pmids {
        out.push_str(&format!("- {pmid}\n"));
    }
    out
}

pub fn publications_markdown(publications: &[Publication]) -> String {
    let mut out = String::new();
    for publication in publications {
        out.push_str(&format!("## PMID {}\n\n", publication.pmid));
        if let Some(title) = &publication.title {
            out.push_str(&format!("{title}\n\n"));
        }
        let year = publication
            .pub_year
            .map(|y| y.to_string())
            .unwrap_or_else(|| "-".into());
        out.push_str(&format!("- Year: {year}\n"));
        out.push_str(&format!(
            "- Publication types: {}\n",
            joined(&publication.publication_types)
        ));
        out.push_str(&format!("- Trials: {}\n\n", joined(&publication.trial_ids)));
    }
    out
}
