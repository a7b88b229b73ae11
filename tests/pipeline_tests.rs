/// End-to-end pipeline tests with a scripted population provider
/// Covers deduplication, compound cities, ordering and run determinism
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use visitum_enrichment::config::{CleaningRules, EnrichmentSettings, PipelineSettings, TableSelection};
use visitum_enrichment::enrichment::{LookupError, PopulationEnricher, PopulationProvider};
use visitum_enrichment::errors::ExtractionErrorKind;
use visitum_enrichment::location::{default_city_aliases, LocationResolver};
use visitum_enrichment::models::{DropReason, Enrichment, FetchFailureReason};
use visitum_enrichment::pipeline::EnrichmentPipeline;

/// Answers by city name; unknown cities are `NotFound`.
#[derive(Default)]
struct ScriptedProvider {
    populations: HashMap<String, Result<i64, LookupError>>,
    delays: HashMap<String, Duration>,
    calls: Mutex<HashMap<String, usize>>,
    total_calls: AtomicUsize,
}

impl ScriptedProvider {
    fn with(mut self, city: &str, answer: Result<i64, LookupError>) -> Self {
        self.populations.insert(city.to_string(), answer);
        self
    }

    fn delayed(mut self, city: &str, delay: Duration) -> Self {
        self.delays.insert(city.to_string(), delay);
        self
    }

    fn calls_for(&self, city: &str) -> usize {
        self.calls.lock().unwrap().get(city).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }
}

impl PopulationProvider for ScriptedProvider {
    async fn population(&self, city: &str, _country: &str) -> Result<i64, LookupError> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .unwrap()
            .entry(city.to_string())
            .or_insert(0) += 1;

        if let Some(delay) = self.delays.get(city) {
            tokio::time::sleep(*delay).await;
        }

        self.populations
            .get(city)
            .cloned()
            .unwrap_or(Err(LookupError::NotFound))
    }
}

fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings::new(TableSelection::new("Visitors in 2024").unwrap());
    settings.enrichment = EnrichmentSettings {
        max_retries: 3,
        retry_delay: Duration::from_millis(1),
        lookup_timeout: Duration::from_secs(2),
        workers: 4,
        cache_ttl: Duration::from_secs(60),
    };
    settings
}

fn pipeline(provider: Arc<ScriptedProvider>) -> EnrichmentPipeline<ScriptedProvider> {
    EnrichmentPipeline::from_settings(&settings(), provider)
}

fn table(rows: &[(&str, &str, &str, &str)]) -> String {
    let body: String = rows
        .iter()
        .map(|(name, city, country, visitors)| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                name, city, country, visitors
            )
        })
        .collect();
    format!(
        "<html><body><table class=\"wikitable\">\
         <tr><th>Name</th><th>City</th><th>Country</th><th>Visitors in 2024</th></tr>{}\
         </table></body></html>",
        body
    )
}

#[tokio::test]
async fn test_end_to_end_single_candidate() {
    let provider = Arc::new(ScriptedProvider::default().with("Paris", Ok(2_100_000)));
    let markup = table(&[
        ("Louvre", "Paris", "France", "8,700,000(2024)"),
        ("Test Museum", "Nowhere", "Nowhereland", "500,000(2024)"),
    ]);

    let output = pipeline(provider.clone())
        .run(&markup, &settings().selection, CleaningRules::default())
        .await
        .unwrap();

    assert_eq!(output.records.len(), 1);
    let louvre = &output.records[0];
    assert_eq!(louvre.record.name, "Louvre");
    assert_eq!(louvre.record.visitor_count, 8_700_000);
    assert_eq!(louvre.record.year, 2024);
    assert_eq!(louvre.population(), Some(2_100_000));

    assert_eq!(output.summary.rows_extracted, 2);
    assert_eq!(output.summary.dropped_for(DropReason::BelowThreshold), 1);
    assert_eq!(output.summary.keys_queried, 1);
    assert_eq!(provider.calls_for("Paris"), 1);
    assert_eq!(provider.total_calls(), 1);
}

#[tokio::test]
async fn test_shared_location_is_looked_up_once() {
    let provider = Arc::new(ScriptedProvider::default().with("London", Ok(8_900_000)));
    let markup = table(&[
        ("British Museum", "London", "United Kingdom", "6,500,000"),
        ("Tate Modern", "London", "United Kingdom", "4,600,000"),
        ("National Gallery", "LONDON", "United Kingdom", "3,200,000"),
        ("Natural History Museum", "South Kensington, London", "United Kingdom", "5,700,000"),
    ]);

    let output = pipeline(provider.clone())
        .run(&markup, &settings().selection, CleaningRules::default())
        .await
        .unwrap();

    assert_eq!(output.records.len(), 4);
    assert!(output
        .records
        .iter()
        .all(|r| r.population() == Some(8_900_000)));
    assert_eq!(provider.total_calls(), 1);
    assert_eq!(output.summary.keys_queried, 1);
}

#[tokio::test]
async fn test_compound_city_uses_largest_population() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .with("Vatican City", Ok(800))
            .with("Rome", Ok(2_800_000)),
    );
    let markup = table(&[("Vatican Museums", "Vatican City, Rome", "Italy", "6,800,000")]);

    let output = pipeline(provider.clone())
        .run(&markup, &settings().selection, CleaningRules::default())
        .await
        .unwrap();

    assert_eq!(output.records[0].population(), Some(2_800_000));
    assert_eq!(provider.calls_for("Vatican City"), 1);
    assert_eq!(provider.calls_for("Rome"), 1);
}

#[tokio::test]
async fn test_order_is_preserved_when_lookups_finish_out_of_order() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .with("Paris", Ok(2_100_000))
            .with("New York City", Ok(8_300_000))
            .with("Beijing", Ok(21_500_000))
            .delayed("Paris", Duration::from_millis(80))
            .delayed("New York City", Duration::from_millis(40)),
    );
    let markup = table(&[
        ("Louvre", "Paris", "France", "8,700,000"),
        ("Metropolitan Museum of Art", "New York City", "United States", "5,700,000"),
        ("National Museum of China", "Beijing", "China", "6,800,000"),
    ]);

    let output = pipeline(provider)
        .run(&markup, &settings().selection, CleaningRules::default())
        .await
        .unwrap();

    let names: Vec<&str> = output.records.iter().map(|r| r.record.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["Louvre", "Metropolitan Museum of Art", "National Museum of China"]
    );
    let populations: Vec<Option<u64>> = output.records.iter().map(|r| r.population()).collect();
    assert_eq!(
        populations,
        vec![Some(2_100_000), Some(8_300_000), Some(21_500_000)]
    );
}

#[tokio::test]
async fn test_failed_lookup_keeps_record_with_reason() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .with("Paris", Ok(2_100_000))
            .with("Atlantis", Err(LookupError::Timeout("slow".to_string()))),
    );
    let markup = table(&[
        ("Louvre", "Paris", "France", "8,700,000"),
        ("Sunken Museum", "Atlantis", "Ocean", "2,000,000"),
        ("Unknown Museum", "Nowhere", "Nowhere Land", "3,000,000"),
    ]);

    let output = pipeline(provider.clone())
        .run(&markup, &settings().selection, CleaningRules::default())
        .await
        .unwrap();

    assert_eq!(output.records.len(), 3);
    assert_eq!(output.records[0].population(), Some(2_100_000));
    assert_eq!(
        output.records[1].failure_reason(),
        Some(FetchFailureReason::Timeout)
    );
    assert_eq!(
        output.records[2].failure_reason(),
        Some(FetchFailureReason::NotFound)
    );

    // Timeouts are retried, not-found answers are not
    assert_eq!(provider.calls_for("Atlantis"), 3);
    assert_eq!(provider.calls_for("Nowhere"), 1);

    assert_eq!(output.summary.records_enriched, 1);
    assert_eq!(output.summary.records_failed, 2);
    assert_eq!(
        output.summary.lookup_failures_for(FetchFailureReason::Timeout),
        1
    );
}

#[tokio::test]
async fn test_empty_city_is_unresolved() {
    let provider = Arc::new(ScriptedProvider::default());
    let markup = table(&[("Floating Museum", "", "Monaco", "2,000,000")]);

    let output = pipeline(provider.clone())
        .run(&markup, &settings().selection, CleaningRules::default())
        .await
        .unwrap();

    assert_eq!(output.records.len(), 1);
    assert_eq!(output.records[0].enrichment, Enrichment::Unresolved);
    assert_eq!(output.summary.records_unresolved, 1);
    assert_eq!(provider.total_calls(), 0);
}

#[tokio::test]
async fn test_drop_reasons_are_counted() {
    let provider = Arc::new(ScriptedProvider::default().with("Paris", Ok(2_100_000)));
    let markup = table(&[
        ("Louvre", "Paris", "France", "8,700,000"),
        ("Closed Museum", "Paris", "France", "closed for renovation"),
        ("Old Museum", "Paris", "France", "3,000,000 (2019)"),
        ("", "Paris", "France", "2,000,000"),
    ]);

    let output = pipeline(provider)
        .run(&markup, &settings().selection, CleaningRules::default())
        .await
        .unwrap();

    let summary = &output.summary;
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.dropped_for(DropReason::UnparseableVisitorCount), 1);
    assert_eq!(summary.dropped_for(DropReason::YearMismatch), 1);
    assert_eq!(summary.dropped_for(DropReason::MissingRequiredField), 1);
    assert_eq!(summary.dropped_total(), 3);
}

#[tokio::test]
async fn test_repeated_runs_are_identical() {
    let markup = table(&[
        ("Louvre", "Paris", "France", "8,700,000"),
        ("Vatican Museums", "Vatican City, Rome", "Italy", "6.8 million"),
        ("Test Museum", "Paris", "France", "1,000,000"),
    ]);
    let provider = || {
        Arc::new(
            ScriptedProvider::default()
                .with("Paris", Ok(2_100_000))
                .with("Rome", Ok(2_800_000)),
        )
    };

    let first = pipeline(provider())
        .run(&markup, &settings().selection, CleaningRules::default())
        .await
        .unwrap();
    let second = pipeline(provider())
        .run(&markup, &settings().selection, CleaningRules::default())
        .await
        .unwrap();

    assert_eq!(first.records, second.records);
    assert_eq!(first.fingerprint(), second.fingerprint());
    assert_ne!(first.summary.run_id, second.summary.run_id);
}

#[tokio::test]
async fn test_missing_table_aborts_run() {
    let provider = Arc::new(ScriptedProvider::default());
    let selection = TableSelection::new("Visitors in 2024")
        .unwrap()
        .without_fallback();

    let err = pipeline(provider.clone())
        .run("<p>No tables here</p>", &selection, CleaningRules::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind, ExtractionErrorKind::NoMatchingTable);
    assert_eq!(provider.total_calls(), 0);
}

#[tokio::test]
async fn test_memoized_results_survive_between_runs() {
    let provider = Arc::new(ScriptedProvider::default().with("Paris", Ok(2_100_000)));
    let settings = settings();
    let pipeline = EnrichmentPipeline::new(
        LocationResolver::new(default_city_aliases()),
        PopulationEnricher::new(provider.clone(), settings.enrichment.clone()),
    );
    let markup = table(&[("Louvre", "Paris", "France", "8,700,000")]);

    for _ in 0..3 {
        let output = pipeline
            .run(&markup, &settings.selection, settings.rules)
            .await
            .unwrap();
        assert_eq!(output.records[0].population(), Some(2_100_000));
    }
    assert_eq!(provider.calls_for("Paris"), 1);
}
