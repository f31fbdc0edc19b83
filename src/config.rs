use std::borrow::Cow;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::error::PubTrialsError;

pub const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
pub const EUTILS_BASE_ENV: &str = "PUBTRIALS_EUTILS_BASE";
const API_KEY_ENV: &str = "NCBI_API_KEY";
const EMAIL_ENV: &str = "NCBI_EMAIL";
const RPS_ENV: &str = "PUBTRIALS_RPS";

pub const DEFAULT_TOOL: &str = "pubtrials";

/// NCBI allows 3 requests/second per client, 10 with an API key.
const RPS_ANONYMOUS: u32 = 3;
const RPS_WITH_KEY: u32 = 10;

pub const DEFAULT_MAX_RESULTS: usize = 1000;
pub const DEFAULT_MINDATE: &str = "2000/01";
pub const DEFAULT_MAXDATE: &str = "2020/08";

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct EutilsConfig {
    pub base: Cow<'static, str>,
    pub tool: String,
    pub email: Option<String>,
    pub api_key: Option<String>,
    /// Zero disables client-side throttling.
    pub requests_per_second: u32,
}

impl EutilsConfig {
    pub fn from_env() -> Result<Self, PubTrialsError> {
        let api_key = env_value(API_KEY_ENV);
        let limit = if api_key.is_some() {
            RPS_WITH_KEY
        } else {
            RPS_ANONYMOUS
        };
        let requests_per_second = match env_value(RPS_ENV) {
            Some(raw) => raw.parse::<u32>().map_err(|_| {
                PubTrialsError::InvalidArgument(format!(
                    "{RPS_ENV} must be a non-negative integer, got \"{raw}\""
                ))
            })?,
            None => limit,
        };
        if requests_per_second == 0 || requests_per_second > limit {
            warn!(
                requests_per_second,
                limit, "Request rate exceeds the NCBI E-utilities policy"
            );
        }

        Ok(Self {
            base: crate::sources::env_base(EUTILS_BASE, EUTILS_BASE_ENV),
            tool: DEFAULT_TOOL.to_string(),
            email: env_value(EMAIL_ENV),
            api_key,
            requests_per_second,
        })
    }

    /// Unthrottled settings against an arbitrary base, for mirrors and mock servers.
    pub fn for_base(base: impl Into<String>) -> Self {
        Self {
            base: Cow::Owned(base.into()),
            tool: DEFAULT_TOOL.to_string(),
            email: None,
            api_key: None,
            requests_per_second: 0,
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        if let Some(email) = email
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            self.email = Some(email);
        }
        self
    }

    pub fn min_interval(&self) -> Duration {
        if self.requests_per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(1) / self.requests_per_second
    }
}

fn pubmed_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{4})(?:/(\d{2})(?:/(\d{2}))?)?$").expect("pubmed date regex is valid")
    })
}

/// Validates a PubMed date (`YYYY`, `YYYY/MM` or `YYYY/MM/DD`; `-` and `.` accepted as separators).
pub fn validate_pubmed_date(value: &str) -> Result<String, PubTrialsError> {
    let normalized = value.trim().replace(['-', '.'], "/");
    let invalid = || {
        PubTrialsError::InvalidArgument(format!(
            "Invalid date \"{}\". Expected YYYY, YYYY/MM or YYYY/MM/DD",
            value.trim()
        ))
    };
    let caps = pubmed_date_re().captures(&normalized).ok_or_else(invalid)?;
    if let Some(month) = caps.get(2) {
        let month: u32 = month.as_str().parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) {
            return Err(invalid());
        }
    }
    if let Some(day) = caps.get(3) {
        let day: u32 = day.as_str().parse().map_err(|_| invalid())?;
        if !(1..=31).contains(&day) {
            return Err(invalid());
        }
    }
    Ok(normalized)
}

/// Publication-date window, sent as `mindate`/`maxdate` with `datetype=pdat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub mindate: String,
    pub maxdate: String,
}

impl DateRange {
    pub fn new(mindate: &str, maxdate: &str) -> Result<Self, PubTrialsError> {
        let mindate = validate_pubmed_date(mindate)?;
        let maxdate = validate_pubmed_date(maxdate)?;
        if lower_bound(&mindate) > upper_bound(&maxdate) {
            return Err(PubTrialsError::InvalidArgument(
                "--mindate must be <= --maxdate".into(),
            ));
        }
        Ok(Self { mindate, maxdate })
    }
}

impl Default for DateRange {
    fn default() -> Self {
        Self {
            mindate: DEFAULT_MINDATE.to_string(),
            maxdate: DEFAULT_MAXDATE.to_string(),
        }
    }
}

fn lower_bound(date: &str) -> String {
    match date.len() {
        4 => format!("{date}/01/01"),
        7 => format!("{date}/01"),
        _ => date.to_string(),
    }
}

fn upper_bound(date: &str) -> String {
    match date.len() {
        4 => format!("{date}/12/31"),
        7 => format!("{date}/31"),
        _ => date.to_string(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOptions {
    pub max_results: usize,
    pub date_range: Option<DateRange>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS,
            date_range: Some(DateRange::default()),
        }
    }
}

impl SearchOptions {
    pub fn new(
        max_results: usize,
        mindate: Option<&str>,
        maxdate: Option<&str>,
        no_date_filter: bool,
    ) -> Result<Self, PubTrialsError> {
        if max_results == 0 {
            return Err(PubTrialsError::InvalidArgument(
                "--max-results must be at least 1".into(),
            ));
        }
        let date_range = if no_date_filter {
            None
        } else {
            Some(DateRange::new(
                mindate.unwrap_or(DEFAULT_MINDATE),
                maxdate.unwrap_or(DEFAULT_MAXDATE),
            )?)
        };
        Ok(Self {
            max_results,
            date_range,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_pubmed_date_accepts_supported_precisions() {
        assert_eq!(validate_pubmed_date("2000").unwrap(), "2000");
        assert_eq!(validate_pubmed_date("2000/01").unwrap(), "2000/01");
        assert_eq!(validate_pubmed_date(" 2020-08-15 ").unwrap(), "2020/08/15");
    }

    #[test]
    fn validate_pubmed_date_rejects_bad_values() {
        assert!(validate_pubmed_date("20").is_err());
        assert!(validate_pubmed_date("2020/13").is_err());
        assert!(validate_pubmed_date("2020/01/00").is_err());
        assert!(validate_pubmed_date("last year").is_err());
    }

    #[test]
    fn date_range_rejects_inverted_window() {
        let err = DateRange::new("2021", "2020/08").expect_err("inverted window should fail");
        assert!(err.to_string().contains("--mindate must be <= --maxdate"));
    }

    #[test]
    fn date_range_allows_same_year_at_mixed_precision() {
        let range = DateRange::new("2020", "2020/08").expect("same year should be valid");
        assert_eq!(range.mindate, "2020");
        assert_eq!(range.maxdate, "2020/08");
    }

    #[test]
    fn search_options_defaults_match_study_window() {
        let opts = SearchOptions::new(DEFAULT_MAX_RESULTS, None, None, false).unwrap();
        assert_eq!(opts.date_range, Some(DateRange::default()));
        let opts = SearchOptions::new(10, None, None, true).unwrap();
        assert!(opts.date_range.is_none());
        assert!(SearchOptions::new(0, None, None, false).is_err());
    }

    #[test]
    fn min_interval_follows_rate() {
        let mut config = EutilsConfig::for_base("http://localhost");
        assert_eq!(config.min_interval(), Duration::ZERO);
        config.requests_per_second = 4;
        assert_eq!(config.min_interval(), Duration::from_millis(250));
    }

    #[test]
    fn with_email_ignores_blank_override() {
        let mut config = EutilsConfig::for_base("http://localhost");
        config.email = Some("team@example.org".into());
        let config = config.with_email(Some("  ".into()));
        assert_eq!(config.email.as_deref(), Some("team@example.org"));
        let config = config.with_email(Some("me@example.org".into()));
        assert_eq!(config.email.as_deref(), Some("me@example.org"));
    }
}
