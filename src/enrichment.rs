/// Population enrichment
///
/// Resolves a population for each distinct `LocationKey`:
/// 1. Keys already memoized with a definitive result are answered from cache
/// 2. Every remaining key gets exactly one task; tasks share a bounded pool
/// 3. Each task retries transient failures up to the configured budget
/// 4. Results are merged by key once every task has finished
use crate::config::EnrichmentSettings;
use crate::models::{FetchFailureReason, LocationKey, PopulationResult};
use moka::future::Cache;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CACHE_CAPACITY: u64 = 10_000;

/// Failure reported by a population provider for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The provider definitively does not know the place. Never retried.
    NotFound,
    RateLimited(String),
    Timeout(String),
    Provider(String),
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::NotFound => write!(f, "place not found"),
            LookupError::RateLimited(msg) => write!(f, "rate limited: {}", msg),
            LookupError::Timeout(msg) => write!(f, "timed out: {}", msg),
            LookupError::Provider(msg) => write!(f, "provider error: {}", msg),
        }
    }
}

impl std::error::Error for LookupError {}

/// Narrow contract of an external population source.
///
/// Implementations return the raw population figure; validation of the
/// value happens in [`PopulationEnricher`].
pub trait PopulationProvider: Send + Sync + 'static {
    fn population(
        &self,
        city: &str,
        country: &str,
    ) -> impl Future<Output = Result<i64, LookupError>> + Send;
}

pub struct PopulationEnricher<P> {
    provider: Arc<P>,
    settings: EnrichmentSettings,
    /// Definitive results (successes and not-found) shared across runs.
    cache: Cache<LocationKey, PopulationResult>,
}

impl<P: PopulationProvider> PopulationEnricher<P> {
    pub fn new(provider: Arc<P>, settings: EnrichmentSettings) -> Self {
        let cache = Cache::builder()
            .time_to_live(settings.cache_ttl)
            .max_capacity(CACHE_CAPACITY)
            .build();

        Self {
            provider,
            settings,
            cache,
        }
    }

    /// Resolves every key in `keys`. The returned map has one entry per key.
    pub async fn enrich(
        &self,
        keys: &BTreeSet<LocationKey>,
    ) -> BTreeMap<LocationKey, PopulationResult> {
        let mut results = BTreeMap::new();
        let mut pending = Vec::new();

        for key in keys {
            match self.cache.get(key).await {
                Some(cached) => {
                    tracing::debug!("Population cache hit for {}", key);
                    results.insert(key.clone(), cached);
                }
                None => pending.push(key.clone()),
            }
        }

        if pending.is_empty() {
            return results;
        }

        tracing::info!(
            "Fetching population for {} location(s) using up to {} workers ({} cached)",
            pending.len(),
            self.settings.workers.max(1),
            results.len()
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut handles = Vec::with_capacity(pending.len());

        for key in pending {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            let settings = self.settings.clone();
            let task_key = key.clone();

            let handle = tokio::spawn(async move {
                // Never closed, so a permit is always granted
                let _permit = semaphore.acquire_owned().await.ok();
                lookup_with_retry(provider.as_ref(), &task_key, &settings).await
            });
            handles.push((key, handle));
        }

        let total = handles.len();
        for (completed, (key, handle)) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Population worker for {} died: {}", key, e);
                    PopulationResult::Failure {
                        reason: FetchFailureReason::ExhaustedRetries,
                    }
                }
            };

            if let PopulationResult::Failure { reason } = result {
                tracing::warn!("Population lookup for {} failed with reason: {}", key, reason);
            }
            if is_definitive(&result) {
                self.cache.insert(key.clone(), result).await;
            }
            results.insert(key, result);

            if (completed + 1) % 10 == 0 || completed + 1 == total {
                tracing::info!("Processed {}/{} city populations...", completed + 1, total);
            }
        }

        results
    }
}

/// Successes and not-found answers do not change on retry; everything else might.
fn is_definitive(result: &PopulationResult) -> bool {
    matches!(
        result,
        PopulationResult::Success { .. }
            | PopulationResult::Failure {
                reason: FetchFailureReason::NotFound
            }
    )
}

/// Looks up one key, retrying transient failures.
///
/// `max_retries` is the total number of attempts. The terminal failure keeps
/// the reason of the last attempt; `ExhaustedRetries` is only reported when
/// no attempt could be made.
pub async fn lookup_with_retry<P: PopulationProvider>(
    provider: &P,
    key: &LocationKey,
    settings: &EnrichmentSettings,
) -> PopulationResult {
    let mut last_failure: Option<FetchFailureReason> = None;

    for attempt in 1..=settings.max_retries {
        let outcome = tokio::time::timeout(
            settings.lookup_timeout,
            provider.population(&key.city, &key.country),
        )
        .await;

        let (reason, detail) = match outcome {
            Ok(Ok(population)) if population > 0 => {
                tracing::debug!("Population for {}: {}", key, population);
                return PopulationResult::Success {
                    population: population as u64,
                };
            }
            Ok(Ok(population)) => {
                tracing::warn!(
                    "Provider returned non-positive population {} for {}",
                    population,
                    key
                );
                return PopulationResult::Failure {
                    reason: FetchFailureReason::ProviderError,
                };
            }
            Ok(Err(LookupError::NotFound)) => {
                tracing::warn!("No population data found for {}", key);
                return PopulationResult::Failure {
                    reason: FetchFailureReason::NotFound,
                };
            }
            Ok(Err(e @ LookupError::RateLimited(_))) => {
                (FetchFailureReason::RateLimited, e.to_string())
            }
            Ok(Err(e @ LookupError::Timeout(_))) => (FetchFailureReason::Timeout, e.to_string()),
            Ok(Err(e @ LookupError::Provider(_))) => {
                (FetchFailureReason::ProviderError, e.to_string())
            }
            Err(_) => (
                FetchFailureReason::Timeout,
                format!("no answer within {:?}", settings.lookup_timeout),
            ),
        };

        tracing::warn!(
            "Population lookup for {} failed on attempt {}/{}: {}",
            key,
            attempt,
            settings.max_retries,
            detail
        );
        last_failure = Some(reason);

        if attempt < settings.max_retries {
            let delay = backoff_delay(settings.retry_delay, attempt);
            tracing::info!("Retrying lookup for {} in {:?}", key, delay);
            tokio::time::sleep(delay).await;
        }
    }

    tracing::error!(
        "Could not get population data for {} after {} attempts",
        key,
        settings.max_retries
    );
    PopulationResult::Failure {
        reason: last_failure.unwrap_or(FetchFailureReason::ExhaustedRetries),
    }
}

/// `base * 2^(attempt - 1)`, capped at thirty seconds.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}
