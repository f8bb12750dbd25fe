use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use urlencoding::encode;

use crate::catalog::SourceProduct;
use crate::http::build_client;

/// Rows per search page, fixed by the upstream API plan.
pub const PAGE_SIZE: i64 = 20;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("source returned HTTP {status} for {context}")]
    Status { status: u16, context: String },
    #[error("could not decode {context}: {source}")]
    Decode {
        context: String,
        source: serde_json::Error,
    },
}

/// One page of a catalog search, paging already resolved from the raw
/// row count.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub results: Vec<SourceProduct>,
    pub current_page: u32,
    pub total_pages: u32,
    pub total_count: i64,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    count: i64,
    results: Vec<SourceProduct>,
}

/// Read/write client for the tabular source catalog. All requests carry
/// token auth and transient failures are retried with jitter.
#[derive(Clone)]
pub struct SourceClient {
    client: Client,
    base_url: String,
    token: String,
}

impl SourceClient {
    /// `None` when `SOURCE_API_URL` / `SOURCE_API_TOKEN` are unset, in which
    /// case everything that needs the source is reported as not configured.
    pub fn from_env() -> Option<Self> {
        let base_url = env::var("SOURCE_API_URL").ok()?;
        let token = env::var("SOURCE_API_TOKEN").ok()?;
        if base_url.trim().is_empty() || token.trim().is_empty() {
            return None;
        }
        Some(Self::with_base_url(token, &base_url))
    }

    pub fn with_base_url(token: impl Into<String>, base_url: &str) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Fetches one row by its source id. `Ok(None)` when the row does not
    /// exist upstream.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Http`] when the request cannot be delivered
    /// after retries, [`SourceError::Status`] on a non-404 failure status,
    /// and [`SourceError::Decode`] when the row payload does not parse.
    pub async fn get_record(&self, source_id: i64) -> Result<Option<SourceProduct>, SourceError> {
        let url = format!("{}/rows/{}/?user_field_names=true", self.base_url, source_id);
        let response = self.request_with_retry(Method::GET, &url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                context: format!("record {source_id}"),
            });
        }
        let payload = response.text().await?;
        let record = serde_json::from_str(&payload).map_err(|source| SourceError::Decode {
            context: format!("record {source_id}"),
            source,
        })?;
        Ok(Some(record))
    }

    /// Full-text search over the catalog, optionally narrowed to rows whose
    /// category column contains the leaf segment of `category`. Pages are
    /// 1-based.
    pub async fn search_records(
        &self,
        query: Option<&str>,
        category: Option<&str>,
        page: u32,
    ) -> Result<SearchPage, SourceError> {
        let page = page.max(1);
        let mut url = format!(
            "{}/rows/?user_field_names=true&size={PAGE_SIZE}&page={page}",
            self.base_url
        );
        if let Some(term) = query.map(str::trim).filter(|term| !term.is_empty()) {
            url.push_str("&search=");
            url.push_str(&encode(term));
        }
        if let Some(path) = category.map(str::trim).filter(|path| !path.is_empty()) {
            // The source column holds leaf names, not full paths.
            let leaf = path.rsplit('>').next().map(str::trim).unwrap_or(path);
            url.push_str("&filter__Category__contains=");
            url.push_str(&encode(leaf));
        }

        let response = self.request_with_retry(Method::GET, &url, None).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                context: "record search".to_string(),
            });
        }
        let payload = response.text().await?;
        let listing: ListResponse =
            serde_json::from_str(&payload).map_err(|source| SourceError::Decode {
                context: "record search".to_string(),
                source,
            })?;
        let total_pages = listing.count.max(0).div_ceil(PAGE_SIZE);
        Ok(SearchPage {
            results: listing.results,
            current_page: page,
            total_pages: total_pages as u32,
            total_count: listing.count,
        })
    }

    /// Patches row fields upstream. Used to push import bookkeeping back
    /// onto the source row.
    pub async fn update_record(&self, source_id: i64, fields: &Value) -> Result<(), SourceError> {
        let url = format!("{}/rows/{}/?user_field_names=true", self.base_url, source_id);
        let response = self
            .request_with_retry(Method::PATCH, &url, Some(fields))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                context: format!("record {source_id} update"),
            });
        }
        debug!(target = "caravel.source", source_id, "record updated");
        Ok(())
    }

    /// Sends the request up to [`MAX_ATTEMPTS`] times, sleeping with jitter
    /// between attempts. Retries cover transport errors and the transient
    /// status set; any other response is returned as-is for the caller to
    /// judge.
    async fn request_with_retry(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, SourceError> {
        let mut attempt = 1;
        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .header("Authorization", format!("Token {}", self.token));
            if let Some(body) = body {
                request = request.json(body);
            }
            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if RETRY_STATUSES.contains(&status) && attempt < MAX_ATTEMPTS {
                        warn!(
                            target = "caravel.source",
                            url, status, attempt, "transient source status, retrying"
                        );
                        tokio::time::sleep(retry_pause()).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) if attempt < MAX_ATTEMPTS => {
                    warn!(
                        target = "caravel.source",
                        url, attempt, error = %err, "source request error, retrying"
                    );
                    tokio::time::sleep(retry_pause()).await;
                    attempt += 1;
                }
                Err(err) => return Err(SourceError::Http(err)),
            }
        }
    }
}

fn retry_pause() -> Duration {
    let jitter = rand::rng().random_range(0..250);
    Duration::from_millis(1000 + jitter)
}
