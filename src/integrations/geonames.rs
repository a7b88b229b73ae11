use crate::enrichment::{LookupError, PopulationProvider};
use crate::errors::AppError;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// GeoNames exception codes for exhausted daily, hourly and weekly credits.
const RATE_LIMIT_CODES: [i64; 3] = [18, 19, 20];

/// Population lookups against the GeoNames `searchJSON` web service.
///
/// Only populated places (`featureClass=P`) are considered and the best
/// ranked hit wins.
pub struct GeoNamesProvider {
    client: Client,
    base_url: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    geonames: Vec<Place>,
    status: Option<ServiceStatus>,
}

#[derive(Debug, Deserialize)]
struct Place {
    #[serde(default)]
    name: String,
    /// Usually a number, occasionally a string.
    #[serde(default)]
    population: Value,
}

#[derive(Debug, Deserialize)]
struct ServiceStatus {
    #[serde(default)]
    value: i64,
    #[serde(default)]
    message: String,
}

impl GeoNamesProvider {
    pub fn new(base_url: String, username: String, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            AppError::ExternalApiError(format!("Failed to create GeoNames client: {}", e))
        })?;

        Ok(Self {
            client,
            base_url,
            username,
        })
    }

    async fn search(&self, city: &str, country: &str) -> Result<i64, LookupError> {
        let query = format!("{}, {}", city, country);
        let url = reqwest::Url::parse_with_params(
            &format!("{}/searchJSON", self.base_url),
            &[
                ("q", query.as_str()),
                ("maxRows", "1"),
                ("featureClass", "P"),
                ("username", self.username.as_str()),
            ],
        )
        .map_err(|e| LookupError::Provider(format!("Failed to build URL: {}", e)))?;

        tracing::debug!("GeoNames search for '{}'", query);

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                LookupError::Timeout(format!("GeoNames request timed out: {}", e))
            } else {
                LookupError::Provider(format!("GeoNames request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LookupError::RateLimited(format!(
                "GeoNames returned {}",
                status
            )));
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LookupError::Provider(format!(
                "GeoNames returned status {}: {}",
                status, error_text
            )));
        }

        let body: SearchResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LookupError::Timeout(format!("GeoNames response timed out: {}", e))
            } else {
                LookupError::Provider(format!("Failed to parse GeoNames response: {}", e))
            }
        })?;

        if let Some(service_status) = body.status {
            return Err(if RATE_LIMIT_CODES.contains(&service_status.value) {
                LookupError::RateLimited(service_status.message)
            } else {
                LookupError::Provider(format!(
                    "GeoNames status {}: {}",
                    service_status.value, service_status.message
                ))
            });
        }

        let place = body.geonames.into_iter().next().ok_or(LookupError::NotFound)?;
        let population = population_value(&place.population).ok_or_else(|| {
            LookupError::Provider(format!(
                "GeoNames hit '{}' has no usable population",
                place.name
            ))
        })?;

        tracing::debug!("GeoNames: '{}' -> {} ({})", query, place.name, population);
        Ok(population)
    }
}

fn population_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl PopulationProvider for GeoNamesProvider {
    async fn population(&self, city: &str, country: &str) -> Result<i64, LookupError> {
        self.search(city, country).await
    }
}
