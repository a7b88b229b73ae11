use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use visitum_enrichment::config::Config;
use visitum_enrichment::errors::ResultExt;
use visitum_enrichment::integrations::geonames::GeoNamesProvider;
use visitum_enrichment::integrations::wikipedia::WikipediaClient;
use visitum_enrichment::pipeline::EnrichmentPipeline;

/// Runs one enrichment pass.
///
/// Fetches the page, runs the pipeline and writes `{"records", "summary"}`
/// as JSON to `OUTPUT_PATH`, or to stdout when it is unset. Logs go to
/// stderr so stdout stays machine readable.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "visitum_enrichment=info,visitum=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;

    let wikipedia = WikipediaClient::new(
        config.wikipedia_api_url.clone(),
        &config.wikipedia_user_agent,
    )?;
    tracing::info!("✓ Wikipedia client initialized: {}", config.wikipedia_api_url);

    let provider = GeoNamesProvider::new(
        config.geonames_base_url.clone(),
        config.geonames_username.clone(),
        config.pipeline.enrichment.lookup_timeout,
    )?;
    tracing::info!("✓ GeoNames provider initialized: {}", config.geonames_base_url);

    let markup = wikipedia
        .fetch_page_html(&config.wikipedia_page_title)
        .await
        .context("Failed to fetch source page")?;

    let pipeline = EnrichmentPipeline::from_settings(&config.pipeline, Arc::new(provider));
    let output = pipeline
        .run(
            &markup,
            &config.pipeline.selection,
            config.pipeline.rules,
        )
        .await
        .context("Table extraction failed")?;

    let json = serde_json::to_string_pretty(&output)?;
    match &config.output_path {
        Some(path) => {
            tokio::fs::write(path, json).await.map_err(|e| {
                anyhow::anyhow!("Failed to write output to {}: {}", path, e)
            })?;
            tracing::info!("✓ Wrote {} records to {}", output.records.len(), path);
        }
        None => println!("{}", json),
    }

    Ok(())
}
