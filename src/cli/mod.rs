//! Top-level CLI parsing and command execution.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::debug;

use crate::config::{DEFAULT_MAX_RESULTS, EutilsConfig, SearchOptions};
use crate::entities::publication;
use crate::entities::query::{CLINICAL_TRIAL_TYPES, QueryFilters, QueryInput, compose_query};
use crate::entities::table::{self, PipelineOptions, ResultTable};
use crate::error::PubTrialsError;
use crate::sources::pubmed::PubMedClient;

pub mod health;

#[derive(Parser, Debug)]
#[command(
    name = "pubtrials",
    about = "Find PubMed clinical-trial publications for substance/disease pairs",
    version,
    after_help = "Set NCBI_API_KEY to raise the request rate from 3/s to 10/s."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output as JSON instead of Markdown
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Contact email sent to NCBI with every request (overrides NCBI_EMAIL)
    #[arg(long, global = true)]
    pub email: Option<String>,

    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct FilterArgs {
    /// Restrict to one publication language
    #[arg(long, default_value = crate::entities::query::DEFAULT_LANGUAGE)]
    pub language: String,
    /// Do not restrict by language
    #[arg(long, conflicts_with = "language")]
    pub any_language: bool,
    /// Do not restrict to clinical-trial publication types
    #[arg(long)]
    pub any_publication_type: bool,
}

impl FilterArgs {
    fn filters(&self) -> QueryFilters {
        let language = Some(self.language.trim().to_string())
            .filter(|v| !self.any_language && !v.is_empty());
        let publication_types = if self.any_publication_type {
            Vec::new()
        } else {
            CLINICAL_TRIAL_TYPES.iter().map(|v| v.to_string()).collect()
        };
        QueryFilters {
            language,
            publication_types,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct WindowArgs {
    /// Maximum PMIDs kept per query (PubMed serves at most 10000)
    #[arg(long, default_value_t = DEFAULT_MAX_RESULTS)]
    pub max_results: usize,
    /// Earliest publication date (YYYY, YYYY/MM or YYYY/MM/DD; default 2000/01)
    #[arg(long)]
    pub mindate: Option<String>,
    /// Latest publication date (default 2020/08)
    #[arg(long)]
    pub maxdate: Option<String>,
    /// Search all publication dates
    #[arg(long, conflicts_with_all = ["mindate", "maxdate"])]
    pub no_date_filter: bool,
}

impl WindowArgs {
    fn options(&self) -> Result<SearchOptions, PubTrialsError> {
        SearchOptions::new(
            self.max_results,
            self.mindate.as_deref(),
            self.maxdate.as_deref(),
            self.no_date_filter,
        )
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableFormat {
    #[default]
    Csv,
    Json,
}

#[derive(Subcommand, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum Commands {
    /// Run every (substance, disease) row of a CSV/TSV file and write the result table
    #[command(after_help = "\
EXAMPLES:
  pubtrials fetch data/ema_sample.csv -o trials.csv
  pubtrials fetch pairs.tsv --format json --no-date-filter --concurrency 3")]
    Fetch {
        /// Input file with active_substance and disease_name columns
        input: PathBuf,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Table format
        #[arg(long, value_enum, default_value_t = TableFormat::Csv)]
        format: TableFormat,
        #[command(flatten)]
        window: WindowArgs,
        #[command(flatten)]
        filters: FilterArgs,
        /// Searches in flight at once (1-10); all share one rate limit
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        /// Abort on the first failed search
        #[arg(long)]
        fail_fast: bool,
    },
    /// Print the PubMed query for one pair without contacting the API
    Query {
        substance: String,
        disease: String,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// List PMIDs matching one pair
    Search {
        substance: String,
        disease: String,
        #[command(flatten)]
        window: WindowArgs,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Show publication year, types and trial ids for PMIDs
    #[command(after_help = "\
EXAMPLES:
  pubtrials get 16236737
  pubtrials get 16236737,15128894 --json")]
    Get {
        /// PMIDs (space or comma separated)
        #[arg(required = true)]
        pmids: Vec<String>,
    },
    /// Check E-utilities connectivity
    Health,
    /// Show version
    Version,
}

fn version_output() -> String {
    let cargo_version = env!("CARGO_PKG_VERSION");
    let git_tag = option_env!("PUBTRIALS_BUILD_GIT_TAG");
    let git = option_env!("PUBTRIALS_BUILD_GIT_SHA").unwrap_or("unknown");
    let build = option_env!("PUBTRIALS_BUILD_DATE").unwrap_or("unknown");
    let version = git_tag
        .filter(|t| t.starts_with('v') && !t.contains('-'))
        .map(|t| &t[1..])
        .unwrap_or(cargo_version);
    format!("pubtrials {version} (git {git}, build {build})")
}

fn split_pmids(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn pubmed_client(cli_email: Option<String>) -> Result<PubMedClient, PubTrialsError> {
    let config = EutilsConfig::from_env()?.with_email(cli_email);
    debug!(base = %config.base, rps = config.requests_per_second, "E-utilities config");
    PubMedClient::new(&config)
}

fn render_table(
    table: &ResultTable,
    format: TableFormat,
    options: &PipelineOptions,
) -> anyhow::Result<String> {
    match format {
        TableFormat::Csv => Ok(crate::render::csv::to_string(table)?),
        TableFormat::Json => Ok(crate::render::json::table_document(
            table,
            &options.filters,
            &options.search,
        )?),
    }
}

#[derive(serde::Serialize)]
struct FetchSummary<'a> {
    output: Option<String>,
    queries: usize,
    failed_queries: usize,
    rows: usize,
    rows_with_trial_ids: usize,
    unavailable_rows: usize,
    per_query: &'a [table::QuerySummary],
}

fn fetch_summary(table: &ResultTable, output: Option<String>, json: bool) -> anyhow::Result<String> {
    if json {
        Ok(crate::render::json::to_pretty(&FetchSummary {
            output,
            queries: table.queries.len(),
            failed_queries: table.failed_queries(),
            rows: table.rows.len(),
            rows_with_trial_ids: table.rows_with_trial_ids(),
            unavailable_rows: table.unavailable_rows(),
            per_query: &table.queries,
        })?)
    } else {
        Ok(crate::render::markdown::run_summary(table, output.as_deref()))
    }
}

/// Executes a parsed command and returns the text to print on stdout.
///
/// # Errors
///
/// Returns an error if argument validation fails, the input file cannot be read,
/// the output cannot be written, or a strict command's API request fails.
pub async fn run(cli: Cli) -> anyhow::Result<String> {
    match cli.command {
        Commands::Fetch {
            input,
            output,
            format,
            window,
            filters,
            concurrency,
            fail_fast,
        } => {
            let options = PipelineOptions {
                filters: filters.filters(),
                search: window.options()?,
                concurrency,
                fail_fast,
            };
            let inputs = crate::entities::query::load_inputs(&input).await?;
            let client = pubmed_client(cli.email)?;
            let table = table::collect(&client, &inputs, &options).await?;
            let rendered = render_table(&table, format, &options)?;

            match output {
                Some(path) => {
                    tokio::fs::write(&path, rendered).await?;
                    fetch_summary(&table, Some(path.display().to_string()), cli.json)
                }
                None => {
                    // stdout carries the table itself; the summary goes to stderr.
                    eprint!("{}", fetch_summary(&table, None, cli.json)?);
                    Ok(rendered)
                }
            }
        }
        Commands::Query {
            substance,
            disease,
            filters,
        } => {
            let query = compose_query(&QueryInput::new(&substance, &disease), &filters.filters())?;
            if cli.json {
                #[derive(serde::Serialize)]
                struct QueryResponse {
                    query: String,
                }
                Ok(crate::render::json::to_pretty(&QueryResponse { query })?)
            } else {
                Ok(query)
            }
        }
        Commands::Search {
            substance,
            disease,
            window,
            filters,
        } => {
            let options = window.options()?;
            let client = pubmed_client(cli.email)?;
            let search = publication::search(
                &client,
                &QueryInput::new(&substance, &disease),
                &filters.filters(),
                &options,
            )
            .await?;
            if cli.json {
                Ok(crate::render::json::to_pretty(&search)?)
            } else {
                Ok(crate::render::markdown::search_markdown(&search))
            }
        }
        Commands::Get { pmids } => {
            let pmids = split_pmids(&pmids);
            let client = pubmed_client(cli.email)?;
            let publications = publication::get(&client, &pmids).await?;
            if cli.json {
                Ok(crate::render::json::to_pretty(&publications)?)
            } else {
                Ok(crate::render::markdown::publications_markdown(&publications))
            }
        }
        Commands::Health => {
            let config = EutilsConfig::from_env()?.with_email(cli.email);
            let report = health::check(&config).await?;
            if cli.json {
                Ok(crate::render::json::to_pretty(&report)?)
            } else {
                Ok(report.to_markdown())
            }
        }
        Commands::Version => Ok(version_output()),
    }
}

/// Parses `args` (program name first) and runs the command.
///
/// # Errors
///
/// Returns an error when CLI args cannot be parsed or when command execution fails.
pub async fn execute(mut args: Vec<String>) -> anyhow::Result<String> {
    if args.is_empty() {
        args.push("pubtrials".to_string());
    }
    let cli = Cli::try_parse_from(args)?;
    run(cli).await
}
