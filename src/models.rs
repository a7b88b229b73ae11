use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ============ Extraction Models ============

/// One row of the source table, as extracted.
///
/// Fields keep the column order of the table header. Values are the visible
/// cell text with whitespace collapsed; nothing else is cleaned here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    fields: Vec<(String, String)>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a row from `(header, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn push(&mut self, header: impl Into<String>, value: impl Into<String>) {
        self.fields.push((header.into(), value.into()));
    }

    /// Value of the first column with exactly this header.
    pub fn get(&self, header: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(h, _)| h == header)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(h, _)| h.as_str())
    }
}

// ============ Cleaning Models ============

/// A museum row that passed parsing and filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Museum name.
    pub name: String,
    /// Normalized city field. May still name several places ("Vatican City, Rome").
    pub city: String,
    /// Country as listed in the table.
    pub country: String,
    /// Annual visitor count.
    pub visitor_count: u64,
    /// Year the visitor count was reported for.
    pub year: i32,
}

/// Why a raw row never became a `CandidateRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropReason {
    UnparseableVisitorCount,
    YearMismatch,
    BelowThreshold,
    MissingRequiredField,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::UnparseableVisitorCount => "UNPARSEABLE_VISITOR_COUNT",
            DropReason::YearMismatch => "YEAR_MISMATCH",
            DropReason::BelowThreshold => "BELOW_THRESHOLD",
            DropReason::MissingRequiredField => "MISSING_REQUIRED_FIELD",
        };
        f.write_str(s)
    }
}

/// Outcome of cleaning a single row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    Kept(CandidateRecord),
    Dropped(DropReason),
}

// ============ Enrichment Models ============

/// Normalized `(city, country)` pair; the unit of population lookup.
///
/// Construct through [`LocationKey::new`] so that two spellings differing
/// only in whitespace or all-caps/all-lowercase casing compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocationKey {
    pub city: String,
    pub country: String,
}

impl LocationKey {
    pub fn new(city: &str, country: &str) -> Self {
        Self {
            city: canonical_place_name(city),
            country: canonical_place_name(country),
        }
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.city, self.country)
    }
}

/// Collapses whitespace and fixes casing of names typed entirely in upper or
/// lower case. Mixed-case input ("McAllen") is left alone, and so is a lone
/// upper-case acronym of up to three letters ("USA", "UK", "U.S.").
pub fn canonical_place_name(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let has_upper = collapsed.chars().any(char::is_uppercase);
    let has_lower = collapsed.chars().any(char::is_lowercase);
    if has_upper && has_lower {
        return collapsed;
    }
    if has_upper && !collapsed.contains(' ') && is_acronym(&collapsed) {
        return collapsed;
    }

    collapsed
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_acronym(token: &str) -> bool {
    token.chars().filter(|c| c.is_alphabetic()).count() <= 3
}

/// Why a population lookup did not produce a usable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchFailureReason {
    NotFound,
    RateLimited,
    Timeout,
    ProviderError,
    ExhaustedRetries,
}

impl fmt::Display for FetchFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchFailureReason::NotFound => "NOT_FOUND",
            FetchFailureReason::RateLimited => "RATE_LIMITED",
            FetchFailureReason::Timeout => "TIMEOUT",
            FetchFailureReason::ProviderError => "PROVIDER_ERROR",
            FetchFailureReason::ExhaustedRetries => "EXHAUSTED_RETRIES",
        };
        f.write_str(s)
    }
}

/// Terminal result of looking up one `LocationKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PopulationResult {
    Success { population: u64 },
    Failure { reason: FetchFailureReason },
}

impl PopulationResult {
    pub fn population(&self) -> Option<u64> {
        match self {
            PopulationResult::Success { population } => Some(*population),
            PopulationResult::Failure { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FetchFailureReason> {
        match self {
            PopulationResult::Success { .. } => None,
            PopulationResult::Failure { reason } => Some(*reason),
        }
    }
}

/// Population annotation attached to a record.
///
/// The three variants are the three output classes a consumer has to tell
/// apart; a record can never carry both a population and a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Enrichment {
    /// At least one constituent lookup succeeded.
    Enriched { population: u64 },
    /// Every constituent lookup failed; carries the first failure reason.
    LookupFailed { failure_reason: FetchFailureReason },
    /// The city field produced no lookup key at all.
    Unresolved,
}

/// A candidate record annotated with its population outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub record: CandidateRecord,
    #[serde(flatten)]
    pub enrichment: Enrichment,
}

impl EnrichedRecord {
    pub fn population(&self) -> Option<u64> {
        match self.enrichment {
            Enrichment::Enriched { population } => Some(population),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FetchFailureReason> {
        match self.enrichment {
            Enrichment::LookupFailed { failure_reason } => Some(failure_reason),
            _ => None,
        }
    }
}

// ============ Run Summary ============

/// Aggregate counts for one pipeline run.
///
/// Drops and lookup failures are reported here instead of being raised, so
/// callers can judge whether the overall yield is acceptable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Identifier of this run, for log correlation.
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// SHA-256 of the input markup (hex encoded).
    pub markup_sha256: String,
    /// Rows produced by the table extractor.
    pub rows_extracted: usize,
    /// Rows that survived cleaning.
    pub candidates: usize,
    /// Dropped rows by reason.
    pub dropped: BTreeMap<DropReason, usize>,
    /// Distinct location keys that needed a population.
    pub keys_queried: usize,
    /// Failed lookups by reason, counted once per distinct key.
    pub lookup_failures: BTreeMap<FetchFailureReason, usize>,
    pub records_enriched: usize,
    pub records_failed: usize,
    pub records_unresolved: usize,
}

impl RunSummary {
    pub fn dropped_total(&self) -> usize {
        self.dropped.values().sum()
    }

    pub fn dropped_for(&self, reason: DropReason) -> usize {
        self.dropped.get(&reason).copied().unwrap_or(0)
    }

    pub fn lookup_failures_for(&self, reason: FetchFailureReason) -> usize {
        self.lookup_failures.get(&reason).copied().unwrap_or(0)
    }
}
