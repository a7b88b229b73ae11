/// End-to-end enrichment run
///
/// extract → clean each row (order kept) → collect distinct location keys →
/// enrich that set once → merge populations back onto the records.
///
/// Only a failure to extract the table aborts a run. Dropped rows and failed
/// lookups are counted in the `RunSummary` and logged.
use crate::cleaning::RecordCleaner;
use crate::config::{CleaningRules, PipelineSettings, TableSelection};
use crate::enrichment::{PopulationEnricher, PopulationProvider};
use crate::errors::ExtractionError;
use crate::extraction::extract_table;
use crate::location::LocationResolver;
use crate::models::{
    CandidateRecord, CleanOutcome, EnrichedRecord, Enrichment, FetchFailureReason, LocationKey,
    PopulationResult, RunSummary,
};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// Result of one run: records in extraction order plus aggregate counts.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub records: Vec<EnrichedRecord>,
    pub summary: RunSummary,
}

impl PipelineOutput {
    /// Serialized records and counts, leaving out run id and timestamps.
    ///
    /// Two runs over the same input with a deterministic provider produce
    /// identical fingerprints.
    pub fn fingerprint(&self) -> String {
        let s = &self.summary;
        serde_json::json!({
            "records": self.records,
            "markup_sha256": s.markup_sha256,
            "rows_extracted": s.rows_extracted,
            "candidates": s.candidates,
            "dropped": s.dropped,
            "keys_queried": s.keys_queried,
            "lookup_failures": s.lookup_failures,
            "records_enriched": s.records_enriched,
            "records_failed": s.records_failed,
            "records_unresolved": s.records_unresolved,
        })
        .to_string()
    }
}

pub struct EnrichmentPipeline<P> {
    resolver: LocationResolver,
    enricher: PopulationEnricher<P>,
}

impl<P: PopulationProvider> EnrichmentPipeline<P> {
    pub fn new(resolver: LocationResolver, enricher: PopulationEnricher<P>) -> Self {
        Self { resolver, enricher }
    }

    pub fn from_settings(settings: &PipelineSettings, provider: Arc<P>) -> Self {
        Self::new(
            LocationResolver::new(settings.aliases.clone()),
            PopulationEnricher::new(provider, settings.enrichment.clone()),
        )
    }

    pub async fn run(
        &self,
        raw_markup: &str,
        selection: &TableSelection,
        rules: CleaningRules,
    ) -> Result<PipelineOutput, ExtractionError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let markup_sha256 = hex::encode(Sha256::digest(raw_markup.as_bytes()));
        tracing::info!(
            "Starting enrichment run {} (target year {}, min visitors {})",
            run_id,
            rules.target_year,
            rules.min_visitors
        );

        // Step 1: Extract
        let rows = extract_table(raw_markup, selection)?;

        // Step 2: Clean, in row order
        let cleaner = RecordCleaner::new(rules);
        let mut candidates: Vec<CandidateRecord> = Vec::new();
        let mut dropped = BTreeMap::new();
        for (idx, row) in rows.iter().enumerate() {
            match cleaner.clean(row) {
                CleanOutcome::Kept(record) => candidates.push(record),
                CleanOutcome::Dropped(reason) => {
                    tracing::info!("Row {} dropped: {}", idx + 1, reason);
                    *dropped.entry(reason).or_insert(0) += 1;
                }
            }
        }
        tracing::info!(
            "Cleaning kept {} of {} rows",
            candidates.len(),
            rows.len()
        );

        // Step 3: Distinct keys across all surviving records
        let keys: BTreeSet<LocationKey> = candidates
            .iter()
            .flat_map(|record| self.resolver.resolve(&record.city, &record.country))
            .collect();

        // Step 4: One lookup per key
        let populations = self.enricher.enrich(&keys).await;

        let mut lookup_failures = BTreeMap::new();
        for result in populations.values() {
            if let Some(reason) = result.failure_reason() {
                *lookup_failures.entry(reason).or_insert(0) += 1;
            }
        }

        // Step 5: Merge back, preserving candidate order
        let records: Vec<EnrichedRecord> = candidates
            .into_iter()
            .map(|record| {
                let record_keys = self.resolver.resolve(&record.city, &record.country);
                let enrichment = combine_populations(&record, &record_keys, &populations);
                EnrichedRecord { record, enrichment }
            })
            .collect();

        let (mut enriched, mut failed, mut unresolved) = (0, 0, 0);
        for record in &records {
            match record.enrichment {
                Enrichment::Enriched { .. } => enriched += 1,
                Enrichment::LookupFailed { .. } => failed += 1,
                Enrichment::Unresolved => unresolved += 1,
            }
        }
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            markup_sha256,
            rows_extracted: rows.len(),
            candidates: records.len(),
            dropped,
            keys_queried: keys.len(),
            lookup_failures,
            records_enriched: enriched,
            records_failed: failed,
            records_unresolved: unresolved,
        };

        tracing::info!(
            "Run {} complete: {} records ({} with population, {} failed lookups, {} unresolved), {} rows dropped",
            run_id,
            summary.candidates,
            summary.records_enriched,
            summary.records_failed,
            summary.records_unresolved,
            summary.dropped_total()
        );

        Ok(PipelineOutput { records, summary })
    }
}

/// Largest successful population among the record's keys; otherwise the
/// first failure in key order.
fn combine_populations(
    record: &CandidateRecord,
    keys: &[LocationKey],
    populations: &BTreeMap<LocationKey, PopulationResult>,
) -> Enrichment {
    if keys.is_empty() {
        tracing::warn!("No location could be resolved for '{}'", record.name);
        return Enrichment::Unresolved;
    }

    let mut best: Option<(&LocationKey, u64)> = None;
    let mut first_failure: Option<FetchFailureReason> = None;

    for key in keys {
        // Every key was enriched; a gap would mean the lookup never ran
        let result = populations
            .get(key)
            .copied()
            .unwrap_or(PopulationResult::Failure {
                reason: FetchFailureReason::ExhaustedRetries,
            });
        match result {
            PopulationResult::Success { population } => {
                if best.map_or(true, |(_, current)| population > current) {
                    best = Some((key, population));
                }
            }
            PopulationResult::Failure { reason } => {
                first_failure.get_or_insert(reason);
            }
        }
    }

    match (best, first_failure) {
        (Some((key, population)), _) => {
            if keys.len() > 1 {
                let constituents: Vec<String> = keys
                    .iter()
                    .map(|k| match populations.get(k).and_then(|r| r.population()) {
                        Some(p) => format!("{}={}", k.city, p),
                        None => format!("{}=n/a", k.city),
                    })
                    .collect();
                // Max, not sum: approximate for metro fragments, wrong for unrelated branch cities
                tracing::info!(
                    "Compound city '{}, {}' [{}]: using max population {} from '{}'",
                    record.city,
                    record.country,
                    constituents.join(", "),
                    population,
                    key.city
                );
            }
            Enrichment::Enriched { population }
        }
        (None, Some(failure_reason)) => Enrichment::LookupFailed { failure_reason },
        (None, None) => Enrichment::Unresolved,
    }
}
