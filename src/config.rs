use crate::errors::AppError;
use crate::location::{default_city_aliases, CityAlias};
use regex::{Regex, RegexBuilder};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_WIKIPEDIA_API_URL: &str = "https://en.wikipedia.org/w/api.php";
pub const DEFAULT_PAGE_TITLE: &str = "List_of_most_visited_museums";
pub const DEFAULT_TABLE_PATTERN: &str = "Visitors in 2024";
pub const DEFAULT_GEONAMES_BASE_URL: &str = "http://api.geonames.org";
pub const DEFAULT_TARGET_YEAR: i32 = 2024;
pub const DEFAULT_MIN_VISITORS: u64 = 1_250_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_WORKERS: usize = 8;

/// Which table of the page to read.
#[derive(Debug, Clone)]
pub struct TableSelection {
    /// Matched case-insensitively against caption, header and cell text.
    pub pattern: Regex,
    /// Fall back to the largest table when nothing matches `pattern`.
    pub fallback_to_largest: bool,
}

impl TableSelection {
    pub fn new(pattern: &str) -> Result<Self, AppError> {
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Invalid table pattern: {}", e)))?;

        Ok(Self {
            pattern,
            fallback_to_largest: true,
        })
    }

    pub fn without_fallback(mut self) -> Self {
        self.fallback_to_largest = false;
        self
    }
}

/// Row filters applied by the cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleaningRules {
    /// Only counts reported for exactly this year are kept.
    pub target_year: i32,
    /// Visitor count must be strictly greater than this.
    pub min_visitors: u64,
}

impl Default for CleaningRules {
    fn default() -> Self {
        Self {
            target_year: DEFAULT_TARGET_YEAR,
            min_visitors: DEFAULT_MIN_VISITORS,
        }
    }
}

/// Knobs of the population enrichment stage.
#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    /// Total lookup attempts per key.
    pub max_retries: u32,
    /// Base delay before a retry; doubled on each further attempt.
    pub retry_delay: Duration,
    /// Timeout of a single lookup attempt.
    pub lookup_timeout: Duration,
    /// Maximum concurrent lookups.
    pub workers: usize,
    /// How long definitive results stay memoized between runs.
    pub cache_ttl: Duration,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_secs(1),
            lookup_timeout: Duration::from_secs(10),
            workers: DEFAULT_WORKERS,
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// Everything the core pipeline consumes, as plain values.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub selection: TableSelection,
    pub rules: CleaningRules,
    pub aliases: Vec<CityAlias>,
    pub enrichment: EnrichmentSettings,
}

impl PipelineSettings {
    /// Default rules, aliases and enrichment knobs around the given selection.
    pub fn new(selection: TableSelection) -> Self {
        Self {
            selection,
            rules: CleaningRules::default(),
            aliases: default_city_aliases(),
            enrichment: EnrichmentSettings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub wikipedia_api_url: String,
    pub wikipedia_page_title: String,
    pub wikipedia_user_agent: String,
    pub geonames_base_url: String,
    pub geonames_username: String,
    pub output_path: Option<String>,
    pub pipeline: PipelineSettings,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let table_pattern = std::env::var("TABLE_MATCH_PATTERN")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TABLE_PATTERN.to_string());
        let selection = TableSelection::new(&table_pattern)?;

        let aliases = match std::env::var("CITY_ALIASES") {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str::<Vec<CityAlias>>(&raw)
                .map_err(|e| anyhow::anyhow!("CITY_ALIASES must be a JSON array of aliases: {}", e))?,
            _ => default_city_aliases(),
        };

        let workers: usize = env_or("POPULATION_WORKERS", DEFAULT_WORKERS)?;
        if workers == 0 {
            anyhow::bail!("POPULATION_WORKERS must be at least 1");
        }

        let config = Self {
            wikipedia_api_url: url_from_env("WIKIPEDIA_API_URL", DEFAULT_WIKIPEDIA_API_URL)?,
            wikipedia_page_title: std::env::var("WIKIPEDIA_PAGE_TITLE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PAGE_TITLE.to_string()),
            wikipedia_user_agent: std::env::var("WIKIPEDIA_USER_AGENT")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| {
                    format!("visitum-enrichment/{}", env!("CARGO_PKG_VERSION"))
                }),
            geonames_base_url: url_from_env("GEONAMES_BASE_URL", DEFAULT_GEONAMES_BASE_URL)?,
            geonames_username: std::env::var("GEONAMES_USERNAME")
                .map_err(|_| anyhow::anyhow!("GEONAMES_USERNAME environment variable required"))
                .and_then(|user| {
                    if user.trim().is_empty() {
                        anyhow::bail!("GEONAMES_USERNAME cannot be empty");
                    }
                    Ok(user)
                })?,
            output_path: std::env::var("OUTPUT_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            pipeline: PipelineSettings {
                selection,
                rules: CleaningRules {
                    target_year: env_or("TARGET_YEAR", DEFAULT_TARGET_YEAR)?,
                    min_visitors: env_or("MIN_VISITORS", DEFAULT_MIN_VISITORS)?,
                },
                aliases,
                enrichment: EnrichmentSettings {
                    max_retries: env_or("MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
                    retry_delay: Duration::from_millis(env_or("RETRY_DELAY_MS", 1000u64)?),
                    lookup_timeout: Duration::from_secs(env_or("LOOKUP_TIMEOUT_SECS", 10u64)?),
                    workers,
                    cache_ttl: Duration::from_secs(env_or("POPULATION_CACHE_TTL_SECS", 3600u64)?),
                },
            },
        };

        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Wikipedia API URL: {}", config.wikipedia_api_url);
        tracing::debug!("GeoNames Base URL: {}", config.geonames_base_url);
        tracing::debug!(
            "Target year: {}, min visitors: {}, workers: {}, max retries: {}",
            config.pipeline.rules.target_year,
            config.pipeline.rules.min_visitors,
            config.pipeline.enrichment.workers,
            config.pipeline.enrichment.max_retries
        );

        Ok(config)
    }
}

/// Reads an optional numeric variable, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid non-negative number", name)),
        _ => Ok(default),
    }
}

/// Reads an http(s) base URL, falling back to `default` when unset.
fn url_from_env(name: &str, default: &str) -> anyhow::Result<String> {
    let url = std::env::var(name).unwrap_or_else(|_| default.to_string());
    validate_url(name, url.trim())
}

fn validate_url(name: &str, url: &str) -> anyhow::Result<String> {
    if url.is_empty() {
        anyhow::bail!("{} cannot be empty", name);
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(url.trim_end_matches('/').to_string())
}
