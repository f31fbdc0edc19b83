use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PubTrialsError;

/// PubMed publication types that mark a record as a clinical-trial report.
pub const CLINICAL_TRIAL_TYPES: &[&str] = &[
    "Clinical Study",
    "Clinical Trial",
    "Randomized Controlled Trial",
    "Controlled Clinical Trial",
    "Clinical Trial, Phase I",
    "Clinical Trial, Phase II",
    "Clinical Trial, Phase III",
    "Clinical Trial, Phase IV",
];

pub const DEFAULT_LANGUAGE: &str = "English";

/// One (substance, disease) pair driving one search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryInput {
    pub active_substance: String,
    pub disease_name: String,
}

impl QueryInput {
    pub fn new(active_substance: &str, disease_name: &str) -> Self {
        Self {
            active_substance: active_substance.trim().to_string(),
            disease_name: disease_name.trim().to_string(),
        }
    }
}

/// Static filter terms appended to every substance/disease query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryFilters {
    pub language: Option<String>,
    pub publication_types: Vec<String>,
}

impl Default for QueryFilters {
    fn default() -> Self {
        Self {
            language: Some(DEFAULT_LANGUAGE.to_string()),
            publication_types: CLINICAL_TRIAL_TYPES.iter().map(|v| v.to_string()).collect(),
        }
    }
}

fn is_boolean_operator(value: &str) -> bool {
    matches!(value, "AND" | "OR" | "NOT")
}

/// Sanitizes free text for PubMed's query syntax.
///
/// PubMed has no escape character, so quotes and brackets are dropped and the
/// term is quoted whenever it would otherwise be split or parsed as syntax.
pub fn pubmed_phrase(value: &str) -> String {
    let cleaned = value
        .chars()
        .map(|ch| match ch {
            '"' | '[' | ']' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect::<String>();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return collapsed;
    }

    let needs_quotes = collapsed.contains(' ')
        || collapsed
            .chars()
            .any(|c| matches!(c, '(' | ')' | ',' | '/' | ':' | '&' | '|' | '*' | '#'))
        || is_boolean_operator(&collapsed.to_ascii_uppercase());
    if needs_quotes {
        format!("\"{collapsed}\"")
    } else {
        collapsed
    }
}

/// Builds `<substance>[SUBS] AND <disease>[MESH]` plus language and publication-type filters.
pub fn compose_query(input: &QueryInput, filters: &QueryFilters) -> Result<String, PubTrialsError> {
    let substance = pubmed_phrase(&input.active_substance);
    if substance.is_empty() {
        return Err(PubTrialsError::InvalidArgument(
            "Active substance is required".into(),
        ));
    }
    let disease = pubmed_phrase(&input.disease_name);
    if disease.is_empty() {
        return Err(PubTrialsError::InvalidArgument(
            "Disease name is required".into(),
        ));
    }

    let mut terms = vec![format!("{substance}[SUBS]"), format!("{disease}[MESH]")];

    if let Some(language) = filters
        .language
        .as_deref()
        .map(pubmed_phrase)
        .filter(|v| !v.is_empty())
    {
        terms.push(format!("{language}[LANG]"));
    }

    let types = filters
        .publication_types
        .iter()
        .map(|v| v.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|v| !v.is_empty() && !v.contains(['"', '[', ']']))
        .map(|v| format!("{v}[PTYP]"))
        .collect::<Vec<_>>();
    if !types.is_empty() {
        terms.push(format!("({})", types.join(" OR ")));
    }

    Ok(terms.join(" AND "))
}

fn has_tsv_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("tsv") || ext.eq_ignore_ascii_case("tab"))
}

/// Reads query inputs from delimited text with `active_substance` and `disease_name` headers.
///
/// Rows with a blank substance or disease are skipped with a warning.
pub fn read_inputs<R: Read>(reader: R, delimiter: u8) -> Result<Vec<QueryInput>, PubTrialsError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    for required in ["active_substance", "disease_name"] {
        if !headers.iter().any(|h| h == required) {
            return Err(PubTrialsError::InvalidArgument(format!(
                "Input is missing the \"{required}\" column (found: {})",
                headers.iter().collect::<Vec<_>>().join(", ")
            )));
        }
    }

    let mut inputs = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record?;
        let input = match record.deserialize::<QueryInput>(Some(&headers)) {
            Ok(input) => input,
            Err(err) => {
                warn!(row = line + 1, error = %err, "Skipping malformed input row");
                continue;
            }
        };
        if input.active_substance.is_empty() || input.disease_name.is_empty() {
            warn!(row = line + 1, "Skipping input row with a blank substance or disease");
            continue;
        }
        inputs.push(input);
    }
    Ok(inputs)
}

pub async fn load_inputs(path: &Path) -> Result<Vec<QueryInput>, PubTrialsError> {
    let content = tokio::fs::read(path).await?;
    let delimiter = if has_tsv_extension(path) { b'\t' } else { b',' };
    let inputs = read_inputs(content.as_slice(), delimiter)?;
    debug!(path = %path.display(), rows = inputs.len(), "Loaded query inputs");
    if inputs.is_empty() {
        return Err(PubTrialsError::InvalidArgument(format!(
            "No usable rows in {}",
            path.display()
        )));
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_query_matches_clinical_trial_template() {
        let query = compose_query(
            &QueryInput::new("imatinib", "Gastrointestinal Stromal Tumors"),
            &QueryFilters::default(),
        )
        .unwrap();
        assert!(query.starts_with(
            "imatinib[SUBS] AND \"Gastrointestinal Stromal Tumors\"[MESH] AND English[LANG] AND ("
        ));
        assert!(query.contains("Clinical Trial, Phase III[PTYP]"));
        assert_eq!(query.matches("[PTYP]").count(), CLINICAL_TRIAL_TYPES.len());
        assert!(query.ends_with(')'));
    }

    #[test]
    fn compose_query_omits_disabled_filters() {
        let filters = QueryFilters {
            language: None,
            publication_types: Vec::new(),
        };
        let query = compose_query(&QueryInput::new("aspirin", "Stroke"), &filters).unwrap();
        assert_eq!(query, "aspirin[SUBS] AND Stroke[MESH]");
    }

    #[test]
    fn compose_query_rejects_blank_terms() {
        let filters = QueryFilters::default();
        assert!(compose_query(&QueryInput::new("  ", "Stroke"), &filters).is_err());
        let err = compose_query(&QueryInput::new("aspirin", "\"[]\""), &filters)
            .expect_err("disease made only of syntax characters should fail");
        assert!(err.to_string().contains("Disease name is required"));
    }

    #[test]
    fn pubmed_phrase_neutralizes_syntax() {
        assert_eq!(pubmed_phrase("pembrolizumab"), "pembrolizumab");
        assert_eq!(pubmed_phrase("  abiraterone   acetate "), "\"abiraterone acetate\"");
        assert_eq!(pubmed_phrase("Carcinoma, Non-Small-Cell Lung"), "\"Carcinoma, Non-Small-Cell Lung\"");
        assert_eq!(pubmed_phrase("x\"[TIAB] OR y"), "\"x TIAB OR y\"");
        assert_eq!(pubmed_phrase("not"), "\"not\"");
        assert_eq!(pubmed_phrase("\t\n"), "");
    }

    #[test]
    fn compose_query_survives_url_encoding_for_printable_input() {
        let samples = [
            ("5-fluorouracil", "Colorectal Neoplasms"),
            ("interferon alfa-2b", "Hepatitis C, Chronic"),
            ("a&b=c?d#e%f+g", "x/y (z)"),
            ("ß-lactam \"quoted\"", "Ménière Disease"),
            ("~!@$^*_{}|\\;'<>`", "[MESH] AND OR NOT"),
        ];
        for (substance, disease) in samples {
            let input = QueryInput::new(substance, disease);
            let query = compose_query(&input, &QueryFilters::default()).unwrap();
            assert!(query.contains(&pubmed_phrase(substance)));
            assert!(query.contains(&pubmed_phrase(disease)));

            let url = reqwest::Url::parse_with_params(
                "https://eutils.example/esearch.fcgi",
                &[("term", query.as_str())],
            )
            .unwrap();
            let decoded = url
                .query_pairs()
                .find(|(k, _)| k == "term")
                .map(|(_, v)| v.into_owned());
            assert_eq!(decoded.as_deref(), Some(query.as_str()));
        }
    }

    #[test]
    fn read_inputs_requires_named_columns() {
        let data = "drug,disease\naspirin,Stroke\n";
        let err = read_inputs(data.as_bytes(), b',').expect_err("wrong headers should fail");
        assert!(err.to_string().contains("active_substance"));
    }

    #[test]
    fn read_inputs_skips_blank_rows_and_ignores_extra_columns() {
        let data = "\
product_number,active_substance,disease_name
EMEA/H/C/000406,imatinib,\"Leukemia, Myelogenous, Chronic, BCR-ABL Positive\"
EMEA/H/C/000001,,Stroke
EMEA/H/C/000002, aspirin ,Stroke
";
        let inputs = read_inputs(data.as_bytes(), b',').unwrap();
        assert_eq!(
            inputs,
            vec![
                QueryInput::new("imatinib", "Leukemia, Myelogenous, Chronic, BCR-ABL Positive"),
                QueryInput::new("aspirin", "Stroke"),
            ]
        );
    }

    #[test]
    fn read_inputs_skips_short_rows() {
        let data = "active_substance,disease_name\nimatinib\naspirin,Stroke\n";
        let inputs = read_inputs(data.as_bytes(), b',').unwrap();
        assert_eq!(inputs, vec![QueryInput::new("aspirin", "Stroke")]);
    }

    #[test]
    fn read_inputs_supports_tab_delimited() {
        let data = "active_substance\tdisease_name\nnivolumab\tMelanoma\n";
        let inputs = read_inputs(data.as_bytes(), b'\t').unwrap();
        assert_eq!(inputs, vec![QueryInput::new("nivolumab", "Melanoma")]);
    }
}
