use crate::errors::AppError;
use serde::Deserialize;
use std::time::Duration;

/// Client for the MediaWiki `action=parse` endpoint.
///
/// Returns the rendered HTML of a page, which is what the extraction stage
/// consumes.
#[derive(Clone)]
pub struct WikipediaClient {
    client: reqwest::Client,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    parse: Option<ParsedPage>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ParsedPage {
    text: Option<PageText>,
}

#[derive(Debug, Deserialize)]
struct PageText {
    #[serde(rename = "*")]
    html: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    #[serde(default)]
    info: String,
}

impl WikipediaClient {
    /// Creates a new `WikipediaClient`.
    ///
    /// # Arguments
    ///
    /// * `api_url` - Full URL of `api.php`.
    /// * `user_agent` - Sent on every request; Wikimedia rejects anonymous clients.
    pub fn new(api_url: String, user_agent: &str) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create Wikipedia client: {}", e))
            })?;

        Ok(Self { client, api_url })
    }

    /// Fetches the rendered HTML of `title`.
    pub async fn fetch_page_html(&self, title: &str) -> Result<String, AppError> {
        let url = reqwest::Url::parse_with_params(
            &self.api_url,
            &[
                ("action", "parse"),
                ("page", title),
                ("prop", "text"),
                ("format", "json"),
                ("redirects", "1"),
            ],
        )
        .map_err(|e| AppError::ExternalApiError(format!("Failed to build URL: {}", e)))?;

        tracing::info!("Fetching Wikipedia page '{}'", title);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::ExternalApiError(format!("Wikipedia request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!("Wikipedia returned error {}: {}", status, error_text);
            return Err(AppError::ExternalApiError(format!(
                "Wikipedia returned status {}: {}",
                status, error_text
            )));
        }

        let body: ParseResponse = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Wikipedia response: {}", e))
        })?;

        if let Some(err) = body.error {
            return Err(AppError::ExternalApiError(format!(
                "Wikipedia API error '{}': {}",
                err.code, err.info
            )));
        }

        let html = body
            .parse
            .and_then(|page| page.text)
            .map(|text| text.html)
            .ok_or_else(|| {
                AppError::ExternalApiError(format!("Wikipedia response for '{}' has no page text", title))
            })?;

        tracing::info!("✓ Fetched '{}' ({} bytes of HTML)", title, html.len());
        Ok(html)
    }
}
