//! Scrape-source contract and the portal-backed implementation: retrying
//! HTTP fetch, listing JSON parsing and formatted-price extraction.

use std::collections::HashMap;
use std::time::Duration;

use aptwatch_core::RawListing;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "aptwatch-source";

/// Scrape failures split by retryability: a transient failure (network blip,
/// rate limit) is safe to retry within the same crawl attempt; a permanent
/// one (portal structure changed, bad complex id) is not.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transient scrape failure: {0}")]
    Transient(String),
    #[error("permanent scrape failure: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// Opaque data source returning the raw listing list for one complex.
#[async_trait]
pub trait ScrapeSource: Send + Sync {
    async fn fetch_listings(&self, complex_id: &str) -> Result<Vec<RawListing>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "aptwatch-bot/0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// JSON fetcher that retries transient failures with exponential backoff and
/// never retries permanent ones.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|err| SourceError::Permanent(format!("building http client: {err}")))?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_json(&self, url: &str) -> Result<JsonValue, SourceError> {
        let mut last_transient: Option<String> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<JsonValue>().await.map_err(|err| {
                            SourceError::Permanent(format!("decoding response body: {err}"))
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, url, attempt, "retrying after http status");
                        last_transient = Some(format!("http status {status} for {url}"));
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    let message = format!("http status {status} for {url}");
                    return Err(match classify_status(status) {
                        RetryDisposition::Retryable => SourceError::Transient(message),
                        RetryDisposition::NonRetryable => SourceError::Permanent(message),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url, attempt, error = %err, "retrying after request error");
                        last_transient = Some(err.to_string());
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    let message = format!("request to {url} failed: {err}");
                    return Err(match classify_reqwest_error(&err) {
                        RetryDisposition::Retryable => SourceError::Transient(message),
                        RetryDisposition::NonRetryable => SourceError::Permanent(message),
                    });
                }
            }
        }

        Err(SourceError::Transient(
            last_transient.unwrap_or_else(|| format!("retries exhausted for {url}")),
        ))
    }
}

/// Extract the minor-unit (만원) integer from a formatted portal price such
/// as "10억 4,000". Returns `None` when no digits survive.
pub fn parse_price(raw: &str) -> Option<i64> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn json_str(value: &JsonValue, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Map one portal `articleList` entry onto the pipeline's raw-listing shape.
/// Never fails: a malformed entry simply yields a listing with missing
/// identity, which the diff engine drops and counts.
pub fn parse_article(value: &JsonValue) -> RawListing {
    RawListing {
        article_no: json_str(value, "articleNo"),
        trade_type: json_str(value, "tradeTypeName"),
        price: json_str(value, "dealOrWarrantPrc")
            .as_deref()
            .and_then(parse_price),
        area_name: json_str(value, "areaName"),
        area: value.get("area1").and_then(JsonValue::as_f64),
        floor_info: json_str(value, "floorInfo"),
        direction: json_str(value, "direction"),
        building_name: json_str(value, "buildingName"),
        realtor_name: json_str(value, "realtorName"),
    }
}

/// Portal-backed scrape source. The portal exposes a per-complex listing API
/// returning `{ "articleList": [...] }`.
pub struct PortalSource {
    fetcher: HttpFetcher,
    base_url: String,
}

impl PortalSource {
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> Result<Self, SourceError> {
        Ok(Self {
            fetcher: HttpFetcher::new(config)?,
            base_url: base_url.into(),
        })
    }

    fn listings_url(&self, complex_id: &str) -> String {
        format!(
            "{}/api/articles/complex/{complex_id}?realEstateType=APT&order=prc",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ScrapeSource for PortalSource {
    async fn fetch_listings(&self, complex_id: &str) -> Result<Vec<RawListing>, SourceError> {
        let url = self.listings_url(complex_id);
        let body = self.fetcher.get_json(&url).await?;
        let articles = body
            .get("articleList")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| {
                SourceError::Permanent(format!(
                    "portal response for complex {complex_id} has no articleList"
                ))
            })?;
        let listings: Vec<RawListing> = articles.iter().map(parse_article).collect();
        debug!(complex_id, count = listings.len(), "listings fetched");
        Ok(listings)
    }
}

/// Canned source for tests and offline development: serves a fixed listing
/// set per complex and errors for unknown complexes.
#[derive(Default)]
pub struct StaticSource {
    listings: HashMap<String, Vec<RawListing>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_complex(mut self, complex_id: &str, listings: Vec<RawListing>) -> Self {
        self.listings.insert(complex_id.to_string(), listings);
        self
    }
}

#[async_trait]
impl ScrapeSource for StaticSource {
    async fn fetch_listings(&self, complex_id: &str) -> Result<Vec<RawListing>, SourceError> {
        self.listings
            .get(complex_id)
            .cloned()
            .ok_or_else(|| SourceError::Permanent(format!("unknown complex {complex_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn formatted_prices_reduce_to_minor_unit_integers() {
        assert_eq!(parse_price("10억 4,000"), Some(104_000));
        assert_eq!(parse_price("5,000"), Some(5_000));
        assert_eq!(parse_price("3억"), Some(3));
        assert_eq!(parse_price("협의"), None);
        assert_eq!(parse_price(""), None);
    }

    #[test]
    fn article_entries_map_onto_raw_listings() {
        let entry = json!({
            "articleNo": "2412345678",
            "tradeTypeName": "매매",
            "dealOrWarrantPrc": "10억 4,000",
            "areaName": "84A",
            "area1": 84.97,
            "floorInfo": "12/25",
            "direction": "남향",
            "buildingName": "101동",
            "realtorName": "한빛공인중개사"
        });
        let listing = parse_article(&entry);
        assert_eq!(listing.article_no.as_deref(), Some("2412345678"));
        assert_eq!(listing.price, Some(104_000));
        assert_eq!(listing.area, Some(84.97));
        assert_eq!(listing.direction.as_deref(), Some("남향"));
    }

    #[test]
    fn malformed_entry_keeps_missing_identity() {
        let entry = json!({ "tradeTypeName": "전세", "articleNo": "  " });
        let listing = parse_article(&entry);
        assert_eq!(listing.article_no, None);
        assert_eq!(listing.price, None);
    }

    #[test]
    fn status_classification_marks_server_errors_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(700),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(700));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn static_source_serves_fixtures_and_rejects_unknowns() {
        let listing = RawListing {
            article_no: Some("A1".into()),
            trade_type: Some("매매".into()),
            price: Some(50_000),
            area_name: None,
            area: None,
            floor_info: None,
            direction: None,
            building_name: None,
            realtor_name: None,
        };
        let source = StaticSource::new().with_complex("1482", vec![listing.clone()]);
        assert_eq!(source.fetch_listings("1482").await.unwrap(), vec![listing]);
        let err = source.fetch_listings("9999").await.unwrap_err();
        assert!(!err.is_transient());
    }
}
