use std::collections::BTreeSet;
use std::io::Write;

use serde::Serialize;

use crate::entities::table::{ResultRow, ResultTable};
use crate::error::PubTrialsError;

pub const COLUMNS: &[&str] = &[
    "input_index",
    "active_substance",
    "disease_name",
    "pmid",
    "title",
    "pub_year",
    "pub_types",
    "nct_ids",
    "available",
];

const MULTI_VALUE_SEPARATOR: &str = "; ";

#[derive(Serialize)]
struct CsvRow<'a> {
    input_index: usize,
    active_substance: &'a str,
    disease_name: &'a str,
    pmid: &'a str,
    title: &'a str,
    pub_year: Option<i32>,
    pub_types: String,
    nct_ids: String,
    available: bool,
}

fn join_set(values: &BTreeSet<String>) -> String {
    values
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(MULTI_VALUE_SEPARATOR)
}

impl<'a> From<&'a ResultRow> for CsvRow<'a> {
    fn from(row: &'a ResultRow) -> Self {
        Self {
            input_index: row.input_index,
            active_substance: &row.active_substance,
            disease_name: &row.disease_name,
            pmid: &row.pmid,
            title: row.title.as_deref().unwrap_or_default(),
            pub_year: row.pub_year,
            pub_types: join_set(&row.publication_types),
            nct_ids: join_set(&row.trial_ids),
            available: row.available,
        }
    }
}

/// Writes the header plus one line per row; the header is written even for an empty table.
pub fn write_table<W: Write>(table: &ResultTable, writer: W) -> Result<(), PubTrialsError> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    wtr.write_record(COLUMNS)?;
    for row in &table.rows {
        wtr.serialize(CsvRow::from(row))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn to_string(table: &ResultTable) -> Result<String, PubTrialsError> {
    let mut out = Vec::new();
    write_table(table, &mut out)?;
    String::from_utf8(out).map_err(|err| PubTrialsError::InvalidArgument(err.to_string()))
}
